use std::fmt;
use std::io;

use thiserror::Error;

/// Failures surfaced by sockets and the socket pool.
#[derive(Debug, Error)]
pub enum SocketError {
    /// The operation would block. Internal: [crate::AsyncSocket] turns
    /// this into a pool suspension, it never reaches callers.
    #[error("operation would block")]
    Blocked,

    /// The peer closed the connection or the descriptor was invalidated.
    #[error("peer disconnected")]
    Disconnected,

    /// The pool stopped or the owning task was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// The address family is not one of IPv4, IPv6 or UNIX-domain.
    #[error("unsupported address family")]
    UnsupportedAddress,

    #[error("socket failure: {0}")]
    Io(#[source] io::Error),
}

impl From<io::Error> for SocketError {
    fn from(err: io::Error) -> SocketError {
        match err.kind() {
            io::ErrorKind::WouldBlock => SocketError::Blocked,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => SocketError::Disconnected,
            _ => SocketError::Io(err),
        }
    }
}

/// Failures of the socket pool lifecycle.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The pool is not in a state that permits the operation, e.g. `run`
    /// was called before `prepare`.
    #[error("socket pool is in the wrong state for this operation")]
    InvalidState,

    #[error(transparent)]
    Socket(#[from] SocketError),
}

impl From<io::Error> for PoolError {
    fn from(err: io::Error) -> PoolError {
        PoolError::Socket(err.into())
    }
}

/// Failures while reading or writing HTTP frames.
#[derive(Debug, Error)]
pub enum HttpError {
    /// Malformed request framing; answered with `400` when no response
    /// bytes have been written yet.
    #[error("malformed request: {0}")]
    Protocol(&'static str),

    /// A configured limit was exceeded.
    #[error("request exceeds limit: {0}")]
    TooLarge(&'static str),

    #[error(transparent)]
    Socket(#[from] SocketError),
}

/// Failures of a WebSocket framing session.
#[derive(Debug, Error)]
pub enum WsError {
    #[error("websocket protocol violation: {0}")]
    Protocol(&'static str),

    #[error(transparent)]
    Socket(#[from] SocketError),
}

/// Failures of the server lifecycle; bind and listen errors propagate out
/// of `start` through this type.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Socket(#[from] SocketError),
}

/// A matched handler declined the request; dispatch continues with the
/// next matching route. Never visible to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Unhandled;

impl fmt::Display for Unhandled {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "request not handled by this route")
    }
}

impl std::error::Error for Unhandled {}
