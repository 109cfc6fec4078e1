use std::io::{self, Error, ErrorKind};
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::path::Path;
use std::ptr;

use libc::{c_int, c_void, sockaddr, sockaddr_storage, socklen_t};

use super::fd::FileDesc;

#[cfg(target_os = "linux")]
const SEND_FLAGS: c_int = libc::MSG_NOSIGNAL;
#[cfg(not(target_os = "linux"))]
const SEND_FLAGS: c_int = 0;

/// A non-blocking stream socket over the raw BSD primitives.
///
/// Every constructor puts the descriptor in non-blocking, close-on-exec
/// mode before returning it.
#[derive(Debug)]
pub struct Socket(FileDesc);

impl Socket {
    pub fn new(family: c_int) -> io::Result<Socket> {
        #[cfg(target_os = "linux")]
        {
            let fd = syscall!(socket(
                family,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0
            ))?;
            Ok(Socket(FileDesc::new(fd)))
        }
        #[cfg(not(target_os = "linux"))]
        {
            let fd = syscall!(socket(family, libc::SOCK_STREAM, 0))?;
            let fd = FileDesc::new(fd);
            fd.set_cloexec()?;
            fd.set_nonblocking(true)?;
            let socket = Socket(fd);
            socket.set_nosigpipe()?;
            Ok(socket)
        }
    }

    pub fn pair() -> io::Result<(Socket, Socket)> {
        let mut fds = [0, 0];

        #[cfg(target_os = "linux")]
        {
            syscall!(socketpair(
                libc::AF_UNIX,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
                fds.as_mut_ptr()
            ))?;
            Ok((
                Socket(FileDesc::new(fds[0])),
                Socket(FileDesc::new(fds[1])),
            ))
        }
        #[cfg(not(target_os = "linux"))]
        {
            syscall!(socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()))?;
            let a = FileDesc::new(fds[0]);
            let b = FileDesc::new(fds[1]);
            for fd in [&a, &b] {
                fd.set_cloexec()?;
                fd.set_nonblocking(true)?;
            }
            Ok((Socket(a), Socket(b)))
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn set_nosigpipe(&self) -> io::Result<()> {
        #[cfg(any(target_os = "macos", target_os = "ios"))]
        {
            let on: c_int = 1;
            syscall!(setsockopt(
                self.raw(),
                libc::SOL_SOCKET,
                libc::SO_NOSIGPIPE,
                &on as *const _ as *const c_void,
                mem::size_of::<c_int>() as socklen_t
            ))?;
        }
        Ok(())
    }

    pub fn raw(&self) -> RawFd {
        self.0.raw()
    }

    pub fn set_reuseaddr(&self) -> io::Result<()> {
        let on: c_int = 1;
        syscall!(setsockopt(
            self.raw(),
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &on as *const _ as *const c_void,
            mem::size_of::<c_int>() as socklen_t
        ))?;
        Ok(())
    }

    pub fn bind_inet(&self, addr: &SocketAddr) -> io::Result<()> {
        let (storage, len) = inet_to_sockaddr(addr);
        syscall!(bind(self.raw(), &storage as *const _ as *const sockaddr, len))?;
        Ok(())
    }

    pub fn bind_unix(&self, path: &Path) -> io::Result<()> {
        let addr = unix_to_sockaddr(path)?;
        syscall!(bind(
            self.raw(),
            &addr as *const _ as *const sockaddr,
            mem::size_of::<libc::sockaddr_un>() as socklen_t
        ))?;
        Ok(())
    }

    pub fn listen(&self, backlog: c_int) -> io::Result<()> {
        syscall!(listen(self.raw(), backlog))?;
        Ok(())
    }

    pub fn accept(&self) -> io::Result<Socket> {
        #[cfg(target_os = "linux")]
        {
            let fd = loop {
                match syscall!(accept4(
                    self.raw(),
                    ptr::null_mut(),
                    ptr::null_mut(),
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC
                )) {
                    Err(ref e) if e.kind() == ErrorKind::Interrupted => (),
                    other => break other?,
                }
            };
            Ok(Socket(FileDesc::new(fd)))
        }
        #[cfg(not(target_os = "linux"))]
        {
            let fd = loop {
                match syscall!(accept(self.raw(), ptr::null_mut(), ptr::null_mut())) {
                    Err(ref e) if e.kind() == ErrorKind::Interrupted => (),
                    other => break other?,
                }
            };
            let fd = FileDesc::new(fd);
            fd.set_cloexec()?;
            fd.set_nonblocking(true)?;
            let socket = Socket(fd);
            socket.set_nosigpipe()?;
            Ok(socket)
        }
    }

    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = loop {
            match syscall!(recv(
                self.raw(),
                buf.as_mut_ptr() as *mut c_void,
                buf.len(),
                0
            )) {
                Err(ref e) if e.kind() == ErrorKind::Interrupted => (),
                other => break other?,
            }
        };
        Ok(n as usize)
    }

    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let n = loop {
            match syscall!(send(
                self.raw(),
                buf.as_ptr() as *const c_void,
                buf.len(),
                SEND_FLAGS
            )) {
                Err(ref e) if e.kind() == ErrorKind::Interrupted => (),
                other => break other?,
            }
        };
        Ok(n as usize)
    }

    pub fn local_inet_addr(&self) -> io::Result<SocketAddr> {
        let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of_val(&storage) as socklen_t;
        syscall!(getsockname(
            self.raw(),
            &mut storage as *mut _ as *mut sockaddr,
            &mut len
        ))?;
        sockaddr_to_inet(&storage)
    }

    pub fn shutdown(&self, how: std::net::Shutdown) -> io::Result<()> {
        let how = match how {
            std::net::Shutdown::Read => libc::SHUT_RD,
            std::net::Shutdown::Write => libc::SHUT_WR,
            std::net::Shutdown::Both => libc::SHUT_RDWR,
        };
        syscall!(shutdown(self.raw(), how))?;
        Ok(())
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.0.raw()
    }
}

impl FromRawFd for Socket {
    unsafe fn from_raw_fd(fd: RawFd) -> Socket {
        Socket(FileDesc::new(fd))
    }
}

fn inet_to_sockaddr(addr: &SocketAddr) -> (sockaddr_storage, socklen_t) {
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            // sockaddr_storage is at least as large and aligned as sockaddr_in
            let sin = unsafe { &mut *(&mut storage as *mut sockaddr_storage as *mut libc::sockaddr_in) };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = v4.port().to_be();
            sin.sin_addr.s_addr = u32::from(*v4.ip()).to_be();
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 =
                unsafe { &mut *(&mut storage as *mut sockaddr_storage as *mut libc::sockaddr_in6) };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = v6.port().to_be();
            sin6.sin6_addr.s6_addr = v6.ip().octets();
            sin6.sin6_flowinfo = v6.flowinfo();
            sin6.sin6_scope_id = v6.scope_id();
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as socklen_t)
}

pub fn sockaddr_to_inet(storage: &sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const sockaddr_storage as *const libc::sockaddr_in) };
            Ok(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            let sin6 =
                unsafe { &*(storage as *const sockaddr_storage as *const libc::sockaddr_in6) };
            Ok(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => Err(Error::new(ErrorKind::InvalidInput, "invalid address family")),
    }
}

fn unix_to_sockaddr(path: &Path) -> io::Result<libc::sockaddr_un> {
    let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;

    let bytes = path.as_os_str().as_bytes();
    if bytes.is_empty() {
        return Err(Error::new(ErrorKind::InvalidInput, "empty socket path"));
    }
    // one byte must remain for the trailing NUL
    if bytes.len() >= addr.sun_path.len() {
        return Err(Error::new(ErrorKind::InvalidInput, "socket path too long"));
    }
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }
    Ok(addr)
}
