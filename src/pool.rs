use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, trace, warn};
use tokio::sync::oneshot;
use tokio::task;

use crate::error::{PoolError, SocketError};
use crate::queue::{EventQueue, Notification, PoolKind};
use crate::ready::Ready;
use crate::token::Token;
use crate::waiting::{Resume, WaitingTable};

/// Default kernel notification batch size.
pub const DEFAULT_MAX_EVENTS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Uninitialized,
    Ready,
    Running,
    Stopping,
    Stopped,
}

/// A readiness multiplexer that parks cooperative tasks until their
/// descriptor is ready.
///
/// `prepare` opens the backend, `run` drives it from one long-lived task,
/// and `suspend` parks the calling task on an `(fd, events)` pair until
/// the backend reports readiness or the pool goes away. Handles are
/// cheap clones sharing one pool.
#[derive(Clone)]
pub struct SocketPool {
    shared: Arc<Shared>,
}

struct Shared {
    kind: PoolKind,
    max_events: usize,
    inner: Mutex<Inner>,
}

struct Inner {
    state: PoolState,
    queue: Option<Arc<EventQueue>>,
    waiting: WaitingTable,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|err| err.into_inner())
    }
}

impl std::fmt::Debug for SocketPool {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "SocketPool({:?})", self.state())
    }
}

impl SocketPool {
    pub fn new(kind: PoolKind) -> SocketPool {
        SocketPool::with_max_events(kind, DEFAULT_MAX_EVENTS)
    }

    pub fn with_max_events(kind: PoolKind, max_events: usize) -> SocketPool {
        SocketPool {
            shared: Arc::new(Shared {
                kind,
                max_events: max_events.max(1),
                inner: Mutex::new(Inner {
                    state: PoolState::Uninitialized,
                    queue: None,
                    waiting: WaitingTable::new(),
                }),
            }),
        }
    }

    pub fn state(&self) -> PoolState {
        self.shared.lock().state
    }

    /// Opens the backend. Permitted from `Uninitialized` or `Stopped`
    /// (re-opening a stopped pool is allowed); a no-op when already
    /// `Ready`.
    pub fn prepare(&self) -> Result<(), PoolError> {
        let mut inner = self.shared.lock();
        match inner.state {
            PoolState::Uninitialized | PoolState::Stopped => {}
            PoolState::Ready => return Ok(()),
            PoolState::Running | PoolState::Stopping => return Err(PoolError::InvalidState),
        }
        let queue = EventQueue::open(self.shared.kind).map_err(SocketError::from)?;
        inner.queue = Some(Arc::new(queue));
        inner.state = PoolState::Ready;
        Ok(())
    }

    /// The long-lived driver: fetches notification batches and resumes
    /// the matching waiters until stopped.
    ///
    /// On exit, whether by `stop`, backend failure or cancellation of the
    /// driving task, every remaining waiter is resumed with
    /// [SocketError::Cancelled].
    pub async fn run(&self) -> Result<(), PoolError> {
        let queue = {
            let mut inner = self.shared.lock();
            if inner.state != PoolState::Ready {
                return Err(PoolError::InvalidState);
            }
            let Some(queue) = inner.queue.clone() else {
                return Err(PoolError::InvalidState);
            };
            inner.state = PoolState::Running;
            queue
        };
        debug!("socket pool running");

        let _guard = RunGuard {
            shared: Arc::clone(&self.shared),
            queue: Arc::clone(&queue),
        };

        loop {
            let batch = {
                let queue = Arc::clone(&queue);
                let max_events = self.shared.max_events;
                task::spawn_blocking(move || queue.get_notifications(max_events)).await
            };

            let batch = match batch {
                Ok(Ok(batch)) => batch,
                Ok(Err(SocketError::Disconnected)) => break,
                Ok(Err(err)) => {
                    warn!("socket pool backend failed: {}", err);
                    return Err(err.into());
                }
                Err(err) => {
                    warn!("socket pool driver task failed: {}", err);
                    return Err(PoolError::Socket(SocketError::Cancelled));
                }
            };

            if batch.is_empty() {
                match queue.yield_interval() {
                    Some(interval) => tokio::time::sleep(interval).await,
                    None => task::yield_now().await,
                }
                continue;
            }

            for notification in batch {
                self.resume(&notification);
            }
        }

        debug!("socket pool stopped");
        Ok(())
    }

    /// Parks the calling task until `fd` is ready for at least one of
    /// `events`, resuming with an error if the descriptor failed or the
    /// pool went away. Cancelling the caller removes its waiter and
    /// adjusts the backend registration before unwinding.
    pub async fn suspend(&self, fd: RawFd, events: Ready) -> Result<(), SocketError> {
        let (token, rx) = {
            let mut inner = self.shared.lock();
            match inner.state {
                PoolState::Ready | PoolState::Running => {}
                _ => return Err(SocketError::Cancelled),
            }
            let Some(queue) = inner.queue.clone() else {
                return Err(SocketError::Cancelled);
            };

            let (tx, rx) = oneshot::channel();
            let (token, delta) = inner.waiting.append(fd, events, tx);
            if !delta.is_empty() {
                if let Err(err) = queue.add_events(fd, delta) {
                    inner.waiting.remove(token);
                    return Err(err.into());
                }
            }
            (token, rx)
        };
        trace!("fd {} suspended on {:?}", fd, events);

        let mut guard = SuspendGuard {
            shared: &self.shared,
            token: Some(token),
        };
        let received = rx.await;
        guard.token = None;

        match received {
            Ok(result) => result,
            // the sender disappeared without resuming: pool teardown
            Err(_) => Err(SocketError::Cancelled),
        }
    }

    /// Stops the pool: a running driver exits and cancels every pending
    /// waiter. Safe to call from any task; idempotent.
    pub fn stop(&self) {
        let (queue, orphaned) = {
            let mut inner = self.shared.lock();
            match inner.state {
                PoolState::Running => {
                    inner.state = PoolState::Stopping;
                    (inner.queue.clone(), Vec::new())
                }
                PoolState::Ready => {
                    // never ran: close the backend and cancel directly
                    inner.state = PoolState::Stopped;
                    inner.queue = None;
                    (None, inner.waiting.drain_all())
                }
                _ => (None, Vec::new()),
            }
        };
        if let Some(queue) = queue {
            queue.stop();
        }
        for tx in orphaned {
            let _ = tx.send(Err(SocketError::Cancelled));
        }
    }

    fn resume(&self, notification: &Notification) {
        let senders = {
            let mut inner = self.shared.lock();
            let events = notification.ready & Ready::connection();
            let (senders, removed) = inner.waiting.take_ready(notification.fd, events);
            if !removed.is_empty() {
                if let Some(queue) = &inner.queue {
                    if let Err(err) = queue.remove_events(notification.fd, removed) {
                        debug!(
                            "failed to deregister fd {} after resume: {}",
                            notification.fd, err
                        );
                    }
                }
            }
            senders
        };

        if senders.is_empty() {
            return;
        }
        trace!(
            "resuming {} waiter(s) for fd {} ({:?})",
            senders.len(),
            notification.fd,
            notification.ready
        );
        // send outside the table lock so a woken task's scheduler never
        // contends with it
        for tx in senders {
            let _ = tx.send(resume_payload(notification.ready));
        }
    }
}

fn resume_payload(ready: Ready) -> Resume {
    if ready.is_error() {
        Err(SocketError::Io(io::Error::new(
            io::ErrorKind::Other,
            "error condition on descriptor",
        )))
    } else if ready.is_hup() && !ready.is_readable() {
        Err(SocketError::Disconnected)
    } else {
        Ok(())
    }
}

/// Cleans up when `run` exits or its future is dropped mid-flight:
/// unblocks an orphaned kernel wait, closes the backend and cancels every
/// pending waiter.
struct RunGuard {
    shared: Arc<Shared>,
    queue: Arc<EventQueue>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.queue.stop();
        let senders = {
            let mut inner = self.shared.lock();
            inner.state = PoolState::Stopped;
            inner.queue = None;
            inner.waiting.drain_all()
        };
        if !senders.is_empty() {
            debug!("cancelling {} pending waiter(s)", senders.len());
        }
        for tx in senders {
            let _ = tx.send(Err(SocketError::Cancelled));
        }
    }
}

/// Removes the waiter if `suspend` is cancelled while parked.
struct SuspendGuard<'a> {
    shared: &'a Shared,
    token: Option<Token>,
}

impl Drop for SuspendGuard<'_> {
    fn drop(&mut self) {
        let Some(token) = self.token else {
            return;
        };
        let mut inner = self.shared.lock();
        if let Some((fd, removed)) = inner.waiting.remove(token) {
            if !removed.is_empty() {
                if let Some(queue) = &inner.queue {
                    let _ = queue.remove_events(fd, removed);
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn run_requires_prepare() {
        let pool = SocketPool::new(PoolKind::poll());
        assert!(matches!(pool.run().await, Err(PoolError::InvalidState)));
        assert_eq!(pool.state(), PoolState::Uninitialized);
    }

    #[tokio::test]
    async fn prepare_is_idempotent_when_ready() {
        let pool = SocketPool::new(PoolKind::poll());
        pool.prepare().unwrap();
        pool.prepare().unwrap();
        assert_eq!(pool.state(), PoolState::Ready);
    }

    #[tokio::test]
    async fn suspend_fails_after_stop() {
        let pool = SocketPool::new(PoolKind::poll());
        pool.prepare().unwrap();
        pool.stop();
        assert_eq!(pool.state(), PoolState::Stopped);
        assert!(matches!(
            pool.suspend(0, Ready::readable()).await,
            Err(SocketError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn stopped_pool_can_be_reopened() {
        let pool = SocketPool::new(PoolKind::poll());
        pool.prepare().unwrap();
        pool.stop();
        pool.prepare().unwrap();
        assert_eq!(pool.state(), PoolState::Ready);
    }
}
