use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::ptr;

use crate::ready::Ready;

/// Identity of the user-event used to interrupt a blocked `kevent` wait.
const WAKE_IDENT: usize = 0;

pub struct Kqueue {
    kq: RawFd,
}

impl Kqueue {
    pub fn new() -> io::Result<Kqueue> {
        let kq = syscall!(kqueue())?;
        syscall!(fcntl(kq, libc::F_SETFD, libc::FD_CLOEXEC))?;

        let kqueue = Kqueue { kq };

        // register the wake-up user event up front
        kqueue.apply(&[kevent(
            WAKE_IDENT,
            libc::EVFILT_USER,
            libc::EV_ADD | libc::EV_CLEAR,
            0,
        )])?;

        Ok(kqueue)
    }

    pub fn add(&self, fd: RawFd, interest: Ready) -> io::Result<()> {
        let mut changes = Vec::with_capacity(2);
        if interest.is_readable() {
            changes.push(kevent(
                fd as usize,
                libc::EVFILT_READ,
                libc::EV_ADD | libc::EV_CLEAR,
                0,
            ));
        }
        if interest.is_writable() {
            changes.push(kevent(
                fd as usize,
                libc::EVFILT_WRITE,
                libc::EV_ADD | libc::EV_CLEAR,
                0,
            ));
        }
        self.apply(&changes)
    }

    pub fn delete(&self, fd: RawFd, interest: Ready) -> io::Result<()> {
        let mut changes = Vec::with_capacity(2);
        if interest.is_readable() {
            changes.push(kevent(fd as usize, libc::EVFILT_READ, libc::EV_DELETE, 0));
        }
        if interest.is_writable() {
            changes.push(kevent(fd as usize, libc::EVFILT_WRITE, libc::EV_DELETE, 0));
        }
        self.apply(&changes)
    }

    /// Triggers the user event, unblocking the current or next `wait`.
    pub fn wake(&self) -> io::Result<()> {
        self.apply(&[kevent(
            WAKE_IDENT,
            libc::EVFILT_USER,
            0,
            libc::NOTE_TRIGGER,
        )])
    }

    pub fn wait(&self, events: &mut Events) -> io::Result<()> {
        let cnt = syscall!(kevent(
            self.kq,
            ptr::null(),
            0,
            events.events.as_mut_ptr(),
            events.events.capacity() as _,
            ptr::null()
        ))?;

        unsafe { events.events.set_len(cnt as usize) };

        Ok(())
    }

    fn apply(&self, changes: &[libc::kevent]) -> io::Result<()> {
        if changes.is_empty() {
            return Ok(());
        }

        syscall!(kevent(
            self.kq,
            changes.as_ptr(),
            changes.len() as _,
            ptr::null_mut(),
            0,
            ptr::null()
        ))?;

        Ok(())
    }
}

impl AsRawFd for Kqueue {
    fn as_raw_fd(&self) -> RawFd {
        self.kq
    }
}

impl Drop for Kqueue {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::close(self.kq);
        }
    }
}

fn kevent(ident: usize, filter: i16, flags: u16, fflags: u32) -> libc::kevent {
    let mut event: libc::kevent = unsafe { std::mem::zeroed() };
    event.ident = ident as _;
    event.filter = filter as _;
    event.flags = flags as _;
    event.fflags = fflags as _;
    event
}

pub struct Event {
    pub fd: RawFd,
    pub ready: Ready,
    pub wake: bool,
}

pub struct Events {
    events: Vec<libc::kevent>,
}

impl Events {
    pub fn with_capacity(u: usize) -> Events {
        Events {
            events: Vec::with_capacity(u),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[inline]
    pub fn get(&self, idx: usize) -> Option<Event> {
        self.events.get(idx).map(|event| {
            let mut kind = Ready::empty();
            let mut wake = false;

            match event.filter as i16 {
                libc::EVFILT_READ => {
                    kind = kind | Ready::readable();
                    if (event.flags as u16 & libc::EV_EOF as u16) != 0 {
                        kind = kind | Ready::hup();
                    }
                }
                libc::EVFILT_WRITE => {
                    kind = kind | Ready::writable();
                }
                libc::EVFILT_USER => {
                    wake = true;
                }
                _ => {}
            }

            if (event.flags as u16 & libc::EV_ERROR as u16) != 0 {
                kind = kind | Ready::error();
            }

            Event {
                fd: event.ident as RawFd,
                ready: kind,
                wake,
            }
        })
    }
}
