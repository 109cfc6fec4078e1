use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use libc::c_void;

use super::fd::FileDesc;

/// Create an eventfd with initval: 0 and flags: EFD_CLOEXEC | EFD_NONBLOCK
/// view: http://man7.org/linux/man-pages/man2/eventfd.2.html
#[derive(Debug)]
pub struct EventFd {
    inner: FileDesc,
}

impl EventFd {
    pub fn new() -> io::Result<EventFd> {
        let flags = libc::EFD_CLOEXEC | libc::EFD_NONBLOCK;
        let eventfd = syscall!(eventfd(0, flags))?;

        Ok(EventFd {
            inner: FileDesc::new(eventfd),
        })
    }

    pub fn read(&self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        syscall!(read(
            self.inner.raw(),
            buf.as_mut_ptr() as *mut c_void,
            buf.len()
        ))?;
        Ok(u64::from_ne_bytes(buf))
    }

    pub fn write(&self, val: u64) -> io::Result<()> {
        let buf: [u8; 8] = val.to_ne_bytes();
        syscall!(write(
            self.inner.raw(),
            buf.as_ptr() as *const c_void,
            buf.len()
        ))?;
        Ok(())
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.raw()
    }
}

#[cfg(test)]
mod test {
    use super::EventFd;

    #[test]
    fn write_and_read() {
        let eventfd = EventFd::new().unwrap();
        eventfd.write(123).unwrap();
        let count = eventfd.read().unwrap();
        assert_eq!(123, count);
    }

    #[test]
    fn read_would_block_when_unsignalled() {
        let eventfd = EventFd::new().unwrap();
        assert_eq!(
            eventfd.read().unwrap_err().kind(),
            std::io::ErrorKind::WouldBlock
        );
    }
}
