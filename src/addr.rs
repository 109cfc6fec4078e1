use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

/// A listening address: IPv4/IPv6 inet or UNIX-domain path.
///
/// Inet listeners get `SO_REUSEADDR`; UNIX listeners unlink a stale
/// socket path on bind and remove it again on close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Inet(SocketAddr),
    Unix(PathBuf),
}

impl Address {
    pub fn inet(addr: impl Into<SocketAddr>) -> Address {
        Address::Inet(addr.into())
    }

    pub fn unix(path: impl Into<PathBuf>) -> Address {
        Address::Unix(path.into())
    }

    pub fn as_inet(&self) -> Option<SocketAddr> {
        match self {
            Address::Inet(addr) => Some(*addr),
            Address::Unix(_) => None,
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Address {
        Address::Inet(addr)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Address::Inet(addr) => write!(fmt, "{}", addr),
            Address::Unix(path) => write!(fmt, "{}", path.display()),
        }
    }
}
