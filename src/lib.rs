//! A lightweight HTTP/1.1 and WebSocket server built on a non-blocking
//! socket pool.
//!
//! The pool registers descriptors with a kernel event queue (epoll on
//! Linux, kqueue on BSD/Darwin, a userland `poll(2)` scanner elsewhere)
//! and parks cooperative tasks until readiness, turning blocking BSD
//! socket calls into suspension points. On top of it sit the HTTP frame
//! codec, an ordered route table with wildcards and captures, and an
//! RFC 6455 WebSocket framer.
//!
//! # Example
//!
//! ```no_run
//! use stilt::{handler, Response, Server};
//!
//! #[tokio::main]
//! async fn main() {
//!     let server = Server::bind("127.0.0.1:8080".parse::<std::net::SocketAddr>().unwrap());
//!
//!     server.route("GET /hello/:name", handler(|request| async move {
//!         let name: String = request.parameter("name")?;
//!         Ok(Response::text(format!("hello, {}", name)))
//!     }));
//!
//!     server.start().await.unwrap();
//! }
//! ```

mod addr;
mod error;
mod handler;
mod pool;
mod queue;
mod ready;
mod server;
mod socket;
mod sys;
mod token;
mod waiting;

pub mod http;
pub mod ws;

pub use addr::Address;
pub use error::{HttpError, PoolError, ServerError, SocketError, Unhandled, WsError};
pub use handler::{handler, FnHandler, Handler};
pub use http::codec::Limits;
pub use http::router::{Route, RouteTable};
pub use http::{header, Body, Headers, Method, Request, Response, StatusCode};
pub use pool::{PoolState, SocketPool, DEFAULT_MAX_EVENTS};
pub use queue::{Notification, PoolKind};
pub use ready::Ready;
pub use server::{Server, ServerConfig, DEFAULT_STOP_TIMEOUT};
pub use socket::{AsyncSocket, Socket};
pub use token::Token;
pub use ws::{ws_handler, FnWsHandler, Message, WsHandler};
