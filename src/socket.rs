use std::fs;
use std::net::Shutdown;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;

use crate::addr::Address;
use crate::error::SocketError;
use crate::pool::SocketPool;
use crate::ready::Ready;
use crate::sys;

/// A non-blocking stream socket.
///
/// Operations either make progress or fail with [SocketError::Blocked];
/// nothing here ever parks a thread. Pair it with a [SocketPool] through
/// [AsyncSocket] to turn `Blocked` into a task suspension.
#[derive(Debug)]
pub struct Socket {
    sys: sys::Socket,
    unlink_on_drop: Option<PathBuf>,
}

impl Socket {
    /// Binds and listens on `address`. Inet listeners get `SO_REUSEADDR`;
    /// UNIX listeners unlink a stale path first and remove it on close.
    pub fn listen(address: &Address, backlog: i32) -> Result<Socket, SocketError> {
        match address {
            Address::Inet(addr) => {
                let family = if addr.is_ipv4() {
                    libc::AF_INET
                } else {
                    libc::AF_INET6
                };
                let sys = sys::Socket::new(family)?;
                sys.set_reuseaddr()?;
                sys.bind_inet(addr)?;
                sys.listen(backlog)?;
                Ok(Socket {
                    sys,
                    unlink_on_drop: None,
                })
            }
            Address::Unix(path) => {
                if path.exists() {
                    let _ = fs::remove_file(path);
                }
                let sys = sys::Socket::new(libc::AF_UNIX)?;
                sys.bind_unix(path)?;
                sys.listen(backlog)?;
                Ok(Socket {
                    sys,
                    unlink_on_drop: Some(path.clone()),
                })
            }
        }
    }

    /// A connected non-blocking socket pair (UNIX-domain).
    pub fn pair() -> Result<(Socket, Socket), SocketError> {
        let (a, b) = sys::Socket::pair()?;
        Ok((Socket::from_sys(a), Socket::from_sys(b)))
    }

    fn from_sys(sys: sys::Socket) -> Socket {
        Socket {
            sys,
            unlink_on_drop: None,
        }
    }

    /// Accepts one pending connection; the returned socket is already
    /// non-blocking.
    pub fn accept(&self) -> Result<Socket, SocketError> {
        Ok(Socket::from_sys(self.sys.accept()?))
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize, SocketError> {
        Ok(self.sys.read(buf)?)
    }

    pub fn write(&self, buf: &[u8]) -> Result<usize, SocketError> {
        Ok(self.sys.write(buf)?)
    }

    pub fn shutdown(&self, how: Shutdown) -> Result<(), SocketError> {
        Ok(self.sys.shutdown(how)?)
    }

    /// The bound address, with the real port after binding port 0.
    pub fn local_address(&self) -> Result<Address, SocketError> {
        match &self.unlink_on_drop {
            Some(path) => Ok(Address::Unix(path.clone())),
            None => Ok(Address::Inet(self.sys.local_inet_addr()?)),
        }
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.sys.as_raw_fd()
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        if let Some(path) = &self.unlink_on_drop {
            let _ = fs::remove_file(path);
        }
    }
}

/// A socket bound to a pool: every operation that would block suspends
/// the calling task until the descriptor is ready.
#[derive(Debug)]
pub struct AsyncSocket {
    socket: Socket,
    pool: SocketPool,
}

impl AsyncSocket {
    pub fn new(socket: Socket, pool: SocketPool) -> AsyncSocket {
        AsyncSocket { socket, pool }
    }

    pub fn pool(&self) -> &SocketPool {
        &self.pool
    }

    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, SocketError> {
        loop {
            match self.socket.read(buf) {
                Err(SocketError::Blocked) => {
                    self.pool
                        .suspend(self.socket.as_raw_fd(), Ready::readable())
                        .await?
                }
                other => return other,
            }
        }
    }

    pub async fn write_all(&self, mut buf: &[u8]) -> Result<(), SocketError> {
        while !buf.is_empty() {
            match self.socket.write(buf) {
                Ok(0) => return Err(SocketError::Disconnected),
                Ok(n) => buf = &buf[n..],
                Err(SocketError::Blocked) => {
                    self.pool
                        .suspend(self.socket.as_raw_fd(), Ready::writable())
                        .await?
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Accepts the next connection on a listening socket.
    pub async fn accept(&self) -> Result<Socket, SocketError> {
        loop {
            match self.socket.accept() {
                Err(SocketError::Blocked) => {
                    self.pool
                        .suspend(self.socket.as_raw_fd(), Ready::readable())
                        .await?
                }
                other => return other,
            }
        }
    }
}

impl AsRawFd for AsyncSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}
