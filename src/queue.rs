use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::error::SocketError;
use crate::ready::Ready;
use crate::sys;

#[cfg(target_os = "linux")]
use std::os::unix::io::AsRawFd;

/// One readiness report from a backend.
///
/// `ready` carries the ready events plus the error conditions observed on
/// the descriptor (`error`, and `hup` for an end-of-file transition).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Notification {
    pub fd: RawFd,
    pub ready: Ready,
}

/// Which multiplexer backs the socket pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    /// kqueue on BSD/Darwin, epoll on Linux, the poll scanner elsewhere.
    Auto,
    /// Pure-userland `poll(2)` scanner. `poll_interval` bounds the kernel
    /// wait, `loop_interval` paces the driver between empty scans.
    Poll {
        poll_interval: Duration,
        loop_interval: Duration,
    },
    /// Force the kernel event queue of the current platform.
    EventQueue,
}

impl PoolKind {
    /// The poll scanner with its default pacing.
    pub fn poll() -> PoolKind {
        PoolKind::Poll {
            poll_interval: Duration::from_millis(10),
            loop_interval: Duration::from_millis(10),
        }
    }
}

impl Default for PoolKind {
    fn default() -> PoolKind {
        PoolKind::Auto
    }
}

/// A kernel (or userland) event queue behind the socket pool.
///
/// `add_events` / `remove_events` keep the registration equal to the union
/// of events across waiters per descriptor; `get_notifications` blocks
/// until readiness and fails with [SocketError::Disconnected] once `stop`
/// has been observed.
pub enum EventQueue {
    #[cfg(target_os = "linux")]
    Epoll(EpollQueue),
    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    ))]
    Kqueue(KqueueQueue),
    Poll(PollQueue),
}

impl EventQueue {
    pub fn open(kind: PoolKind) -> io::Result<EventQueue> {
        match kind {
            PoolKind::Poll {
                poll_interval,
                loop_interval,
            } => Ok(EventQueue::Poll(PollQueue::open(
                poll_interval,
                loop_interval,
            ))),
            PoolKind::Auto | PoolKind::EventQueue => EventQueue::open_kernel(),
        }
    }

    #[cfg(target_os = "linux")]
    fn open_kernel() -> io::Result<EventQueue> {
        Ok(EventQueue::Epoll(EpollQueue::open()?))
    }

    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    ))]
    fn open_kernel() -> io::Result<EventQueue> {
        Ok(EventQueue::Kqueue(KqueueQueue::open()?))
    }

    #[cfg(not(any(
        target_os = "linux",
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    )))]
    fn open_kernel() -> io::Result<EventQueue> {
        Ok(EventQueue::Poll(PollQueue::open(
            Duration::from_millis(10),
            Duration::from_millis(10),
        )))
    }

    pub fn add_events(&self, fd: RawFd, delta: Ready) -> io::Result<()> {
        match self {
            #[cfg(target_os = "linux")]
            EventQueue::Epoll(queue) => queue.add_events(fd, delta),
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd",
                target_os = "dragonfly"
            ))]
            EventQueue::Kqueue(queue) => queue.add_events(fd, delta),
            EventQueue::Poll(queue) => queue.add_events(fd, delta),
        }
    }

    pub fn remove_events(&self, fd: RawFd, delta: Ready) -> io::Result<()> {
        match self {
            #[cfg(target_os = "linux")]
            EventQueue::Epoll(queue) => queue.remove_events(fd, delta),
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd",
                target_os = "dragonfly"
            ))]
            EventQueue::Kqueue(queue) => queue.remove_events(fd, delta),
            EventQueue::Poll(queue) => queue.remove_events(fd, delta),
        }
    }

    /// Blocks until at least one notification is available. Fails with
    /// [SocketError::Disconnected] when the queue has been stopped.
    pub fn get_notifications(&self, max_events: usize) -> Result<Vec<Notification>, SocketError> {
        match self {
            #[cfg(target_os = "linux")]
            EventQueue::Epoll(queue) => queue.get_notifications(max_events),
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd",
                target_os = "dragonfly"
            ))]
            EventQueue::Kqueue(queue) => queue.get_notifications(max_events),
            EventQueue::Poll(queue) => queue.get_notifications(max_events),
        }
    }

    /// Unblocks a pending or future `get_notifications`, which then fails
    /// with [SocketError::Disconnected].
    pub fn stop(&self) {
        match self {
            #[cfg(target_os = "linux")]
            EventQueue::Epoll(queue) => queue.stop(),
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd",
                target_os = "dragonfly"
            ))]
            EventQueue::Kqueue(queue) => queue.stop(),
            EventQueue::Poll(queue) => queue.stop(),
        }
    }

    /// How long the driver should sleep after an empty batch, if the
    /// backend relies on the driver for pacing.
    pub fn yield_interval(&self) -> Option<Duration> {
        match self {
            EventQueue::Poll(queue) => Some(queue.loop_interval),
            #[allow(unreachable_patterns)]
            _ => None,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|err| err.into_inner())
}

/// Substitute the registered set when a notification carries error
/// conditions but no ready event, so waiters are still woken.
fn substitute(ready: Ready, registered: Ready) -> Ready {
    if (ready & Ready::connection()).is_empty() {
        ready | registered
    } else {
        ready
    }
}

#[cfg(target_os = "linux")]
pub struct EpollQueue {
    epoll: sys::epoll::Epoll,
    canary: sys::eventfd::EventFd,
    registered: Mutex<HashMap<RawFd, Ready>>,
}

#[cfg(target_os = "linux")]
impl EpollQueue {
    fn open() -> io::Result<EpollQueue> {
        let epoll = sys::epoll::Epoll::new()?;
        let canary = sys::eventfd::EventFd::new()?;
        epoll.add(canary.as_raw_fd(), Ready::readable())?;

        Ok(EpollQueue {
            epoll,
            canary,
            registered: Mutex::new(HashMap::new()),
        })
    }

    fn add_events(&self, fd: RawFd, delta: Ready) -> io::Result<()> {
        let mut registered = lock(&self.registered);
        match registered.get_mut(&fd) {
            Some(events) => {
                let union = *events | delta;
                self.epoll.modify(fd, union)?;
                *events = union;
            }
            None => {
                self.epoll.add(fd, delta)?;
                registered.insert(fd, delta);
            }
        }
        Ok(())
    }

    fn remove_events(&self, fd: RawFd, delta: Ready) -> io::Result<()> {
        let mut registered = lock(&self.registered);
        if let Some(events) = registered.get_mut(&fd) {
            let remaining = *events - delta;
            if remaining.is_empty() {
                registered.remove(&fd);
                self.epoll.delete(fd)?;
            } else {
                self.epoll.modify(fd, remaining)?;
                *events = remaining;
            }
        }
        Ok(())
    }

    fn get_notifications(&self, max_events: usize) -> Result<Vec<Notification>, SocketError> {
        let mut events = sys::epoll::Events::with_capacity(max_events);
        self.epoll.wait(&mut events).map_err(SocketError::from)?;

        let mut notifications = Vec::with_capacity(events.len());
        for idx in 0..events.len() {
            let Some((fd, ready)) = events.get(idx) else {
                break;
            };
            if fd == self.canary.as_raw_fd() {
                let _ = self.canary.read();
                return Err(SocketError::Disconnected);
            }
            let registered = lock(&self.registered)
                .get(&fd)
                .copied()
                .unwrap_or_else(Ready::empty);
            notifications.push(Notification {
                fd,
                ready: substitute(ready, registered),
            });
        }
        Ok(notifications)
    }

    fn stop(&self) {
        let _ = self.canary.write(1);
    }
}

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub struct KqueueQueue {
    kqueue: sys::kqueue::Kqueue,
    registered: Mutex<HashMap<RawFd, Ready>>,
}

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
impl KqueueQueue {
    fn open() -> io::Result<KqueueQueue> {
        Ok(KqueueQueue {
            kqueue: sys::kqueue::Kqueue::new()?,
            registered: Mutex::new(HashMap::new()),
        })
    }

    fn add_events(&self, fd: RawFd, delta: Ready) -> io::Result<()> {
        let mut registered = lock(&self.registered);
        self.kqueue.add(fd, delta)?;
        *registered.entry(fd).or_insert_with(Ready::empty) |= delta;
        Ok(())
    }

    fn remove_events(&self, fd: RawFd, delta: Ready) -> io::Result<()> {
        let mut registered = lock(&self.registered);
        // a filter may already be gone if the descriptor closed
        let _ = self.kqueue.delete(fd, delta);
        if let Some(events) = registered.get_mut(&fd) {
            let remaining = *events - delta;
            if remaining.is_empty() {
                registered.remove(&fd);
            } else {
                *events = remaining;
            }
        }
        Ok(())
    }

    fn get_notifications(&self, max_events: usize) -> Result<Vec<Notification>, SocketError> {
        let mut events = sys::kqueue::Events::with_capacity(max_events);
        self.kqueue.wait(&mut events).map_err(SocketError::from)?;

        let mut notifications = Vec::with_capacity(events.len());
        for idx in 0..events.len() {
            let Some(event) = events.get(idx) else {
                break;
            };
            if event.wake {
                return Err(SocketError::Disconnected);
            }
            let registered = lock(&self.registered)
                .get(&event.fd)
                .copied()
                .unwrap_or_else(Ready::empty);
            notifications.push(Notification {
                fd: event.fd,
                ready: substitute(event.ready, registered),
            });
        }
        Ok(notifications)
    }

    fn stop(&self) {
        let _ = self.kqueue.wake();
    }
}

/// Pure-userland fallback: scans a snapshot of the registered descriptors
/// with `poll(2)` each iteration and observes `stop` through a flag.
pub struct PollQueue {
    registered: Mutex<HashMap<RawFd, Ready>>,
    stopped: AtomicBool,
    poll_interval: Duration,
    loop_interval: Duration,
}

impl PollQueue {
    fn open(poll_interval: Duration, loop_interval: Duration) -> PollQueue {
        PollQueue {
            registered: Mutex::new(HashMap::new()),
            stopped: AtomicBool::new(false),
            poll_interval,
            loop_interval,
        }
    }

    fn add_events(&self, fd: RawFd, delta: Ready) -> io::Result<()> {
        let mut registered = lock(&self.registered);
        *registered.entry(fd).or_insert_with(Ready::empty) |= delta;
        Ok(())
    }

    fn remove_events(&self, fd: RawFd, delta: Ready) -> io::Result<()> {
        let mut registered = lock(&self.registered);
        if let Some(events) = registered.get_mut(&fd) {
            let remaining = *events - delta;
            if remaining.is_empty() {
                registered.remove(&fd);
            } else {
                *events = remaining;
            }
        }
        Ok(())
    }

    fn get_notifications(&self, max_events: usize) -> Result<Vec<Notification>, SocketError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(SocketError::Disconnected);
        }

        let snapshot: Vec<(RawFd, Ready)> = lock(&self.registered)
            .iter()
            .map(|(fd, events)| (*fd, *events))
            .collect();

        let mut fds: Vec<libc::pollfd> = snapshot
            .iter()
            .map(|(fd, events)| libc::pollfd {
                fd: *fd,
                events: sys::poll::ready_to_poll(*events),
                revents: 0,
            })
            .collect();

        let ready = sys::poll::poll(&mut fds, self.poll_interval).map_err(SocketError::from)?;

        if self.stopped.load(Ordering::Acquire) {
            return Err(SocketError::Disconnected);
        }

        let mut notifications = Vec::new();
        if ready > 0 {
            for (pollfd, (fd, registered)) in fds.iter().zip(snapshot) {
                if pollfd.revents == 0 {
                    continue;
                }
                notifications.push(Notification {
                    fd,
                    ready: substitute(sys::poll::poll_to_ready(pollfd.revents), registered),
                });
                if notifications.len() == max_events {
                    break;
                }
            }
        }
        Ok(notifications)
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn poll_queue_tracks_registration_union() {
        let queue = PollQueue::open(Duration::from_millis(1), Duration::from_millis(1));

        queue.add_events(3, Ready::readable()).unwrap();
        queue.add_events(3, Ready::writable()).unwrap();
        assert_eq!(lock(&queue.registered).get(&3), Some(&Ready::connection()));

        queue.remove_events(3, Ready::readable()).unwrap();
        assert_eq!(lock(&queue.registered).get(&3), Some(&Ready::writable()));

        queue.remove_events(3, Ready::writable()).unwrap();
        assert!(lock(&queue.registered).is_empty());
    }

    #[test]
    fn stopped_poll_queue_disconnects() {
        let queue = PollQueue::open(Duration::from_millis(1), Duration::from_millis(1));
        queue.stop();
        assert!(matches!(
            queue.get_notifications(8),
            Err(SocketError::Disconnected)
        ));
    }

    #[test]
    fn empty_notification_substitutes_registered_set() {
        let ready = substitute(Ready::hup(), Ready::readable());
        assert!(ready.is_readable());
        assert!(ready.is_hup());

        let ready = substitute(Ready::readable(), Ready::connection());
        assert_eq!(ready, Ready::readable());
    }
}
