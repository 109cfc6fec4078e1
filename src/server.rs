use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::addr::Address;
use crate::error::{HttpError, ServerError, SocketError, Unhandled};
use crate::handler::Handler;
use crate::http::codec::{self, Limits, RequestParser};
use crate::http::router::{Route, RouteTable};
use crate::http::{header, Body, Headers, Request, Response, StatusCode};
use crate::pool::SocketPool;
use crate::queue::PoolKind;
use crate::ready::Ready;
use crate::socket::{AsyncSocket, Socket};
use crate::ws::{self, WsHandler};

pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

const ACCEPT_BACKLOG: i32 = 128;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub address: Address,
    pub pool: PoolKind,
    /// Kernel notification batch size.
    pub max_events: usize,
    /// Default grace period for [Server::stop].
    pub stop_timeout: Duration,
    pub limits: Limits,
}

impl ServerConfig {
    pub fn new(address: impl Into<Address>) -> ServerConfig {
        ServerConfig {
            address: address.into(),
            pool: PoolKind::Auto,
            max_events: crate::pool::DEFAULT_MAX_EVENTS,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            limits: Limits::default(),
        }
    }
}

/// An HTTP/1.1 server on a socket pool.
///
/// `start` binds the listener and runs two concurrent subtasks: the pool
/// driver and the accept loop; each accepted connection becomes its own
/// task. Routes may be appended at any time, before or while serving.
pub struct Server {
    config: ServerConfig,
    pool: SocketPool,
    routes: RouteTable,
    listening: watch::Sender<Option<Address>>,
    stopping: watch::Sender<Option<Duration>>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Server {
        let pool = SocketPool::with_max_events(config.pool, config.max_events);
        Server {
            config,
            pool,
            routes: RouteTable::new(),
            listening: watch::channel(None).0,
            stopping: watch::channel(None).0,
        }
    }

    /// A server with default configuration for `address`.
    pub fn bind(address: impl Into<Address>) -> Server {
        Server::new(ServerConfig::new(address))
    }

    /// Appends `handler` under a route parsed from `pattern`, e.g.
    /// `"GET /hello/:name"`.
    pub fn route(&self, pattern: &str, handler: impl Handler) {
        self.routes.append(Route::new(pattern), handler);
    }

    pub fn append_route(&self, route: Route, handler: impl Handler) {
        self.routes.append(route, handler);
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn pool(&self) -> &SocketPool {
        &self.pool
    }

    /// Resolves once the listener is bound, with the actual address
    /// (the real port when binding port 0).
    pub async fn wait_until_listening(&self) -> Address {
        let mut rx = self.listening.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(address) = current {
                return address;
            }
            let _ = rx.changed().await;
        }
    }

    /// Binds the listener and serves until stopped. Bind and listen
    /// failures propagate; cancellation of the task running `start`
    /// closes every socket immediately.
    pub async fn start(&self) -> Result<(), ServerError> {
        self.pool.prepare()?;
        self.stopping.send_replace(None);

        let listener = Socket::listen(&self.config.address, ACCEPT_BACKLOG)?;
        let local = listener.local_address()?;
        info!("listening on {}", local);
        self.listening.send_replace(Some(local));

        let result = self.serve(&listener).await;

        self.listening.send_replace(None);
        debug!("server stopped");
        result
    }

    /// Stops with the configured default grace period.
    pub async fn stop(&self) {
        self.stop_within(self.config.stop_timeout).await
    }

    /// Stops accepting, lets connections finish their in-flight exchange
    /// for up to `timeout`, then closes the stragglers. Resolves when
    /// `start` has returned.
    pub async fn stop_within(&self, timeout: Duration) {
        self.stopping.send_replace(Some(timeout));
        let mut rx = self.listening.subscribe();
        loop {
            if rx.borrow_and_update().is_none() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    async fn serve(&self, listener: &Socket) -> Result<(), ServerError> {
        let mut tasks = JoinSet::new();
        let driver = self.pool.run();
        tokio::pin!(driver);
        let mut stop_rx = self.stopping.subscribe();

        let grace = tokio::select! {
            result = &mut driver => {
                // backend failure tears down every connection
                tasks.abort_all();
                while tasks.join_next().await.is_some() {}
                return result.map_err(ServerError::from);
            }
            result = self.accept_loop(listener, &mut tasks) => {
                tasks.abort_all();
                while tasks.join_next().await.is_some() {}
                self.pool.stop();
                return result;
            }
            changed = async { stop_rx.wait_for(|grace| grace.is_some()).await.map(|value| *value) } => {
                match changed {
                    Ok(value) => value.unwrap_or(self.config.stop_timeout),
                    Err(_) => self.config.stop_timeout,
                }
            }
        };

        // graceful stop: the accept loop is gone; wait for in-flight
        // exchanges, then force-close whatever remains
        debug!(
            "stopping: waiting up to {:?} for {} open connection(s)",
            grace,
            tasks.len()
        );
        let mut driver_done = false;
        {
            let drain_all = async {
                while tasks.join_next().await.is_some() {}
            };
            tokio::pin!(drain_all);
            tokio::select! {
                _ = &mut driver => { driver_done = true; }
                _ = tokio::time::timeout(grace, &mut drain_all) => {}
            }
        }
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
        if !driver_done {
            self.pool.stop();
            let _ = driver.await;
        }
        Ok(())
    }

    async fn accept_loop(
        &self,
        listener: &Socket,
        tasks: &mut JoinSet<()>,
    ) -> Result<(), ServerError> {
        loop {
            match listener.accept() {
                Ok(socket) => {
                    debug!("accepted connection on fd {}", socket.as_raw_fd());
                    let connection = Connection {
                        socket: AsyncSocket::new(socket, self.pool.clone()),
                        routes: self.routes.clone(),
                        limits: self.config.limits,
                        stopping: self.stopping.subscribe(),
                    };
                    tasks.spawn(connection.serve());
                }
                Err(SocketError::Blocked) => {
                    match self
                        .pool
                        .suspend(listener.as_raw_fd(), Ready::readable())
                        .await
                    {
                        Ok(()) => {}
                        Err(SocketError::Cancelled) => return Ok(()),
                        Err(err) => return Err(err.into()),
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

struct Connection {
    socket: AsyncSocket,
    routes: RouteTable,
    limits: Limits,
    stopping: watch::Receiver<Option<Duration>>,
}

impl Connection {
    async fn serve(mut self) {
        match self.run().await {
            Ok(()) => debug!("connection closed"),
            Err(HttpError::Socket(SocketError::Disconnected))
            | Err(HttpError::Socket(SocketError::Cancelled)) => {
                debug!("connection closed by peer or shutdown")
            }
            Err(err) => warn!("connection failed: {}", err),
        }
    }

    async fn run(&mut self) -> Result<(), HttpError> {
        let mut buf = BytesMut::with_capacity(4096);
        let mut read_buf = [0u8; 4096];

        loop {
            let mut parser = RequestParser::new(self.limits);
            let request = loop {
                match parser.advance(&mut buf) {
                    Ok(Some(request)) => break request,
                    Ok(None) => {}
                    Err(err) => {
                        if !matches!(err, HttpError::Socket(_)) {
                            self.reject().await;
                        }
                        return Err(err);
                    }
                }
                match self.socket.read(&mut read_buf).await {
                    Ok(0) => {
                        return if buf.is_empty() && parser.is_idle() {
                            Ok(())
                        } else {
                            Err(HttpError::Protocol("connection closed mid-request"))
                        };
                    }
                    Ok(n) => buf.extend_from_slice(&read_buf[..n]),
                    Err(SocketError::Disconnected) if buf.is_empty() && parser.is_idle() => {
                        return Ok(());
                    }
                    Err(err) => return Err(err.into()),
                }
            };

            debug!("{} {}", request.method, request.path);
            let close_requested = request.headers.has_token(&header::CONNECTION, "close");
            let response = dispatch(&self.routes, &request).await;

            match response.body {
                Body::Upgrade(handler) => {
                    return self.upgrade(&request, handler, buf).await;
                }
                body => {
                    let response = Response {
                        status: response.status,
                        headers: response.headers,
                        body,
                    };
                    let close = close_requested || self.stopping.borrow().is_some();
                    self.write_response(response, close).await?;
                    if close {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Best-effort `400` for a request that could not be parsed; valid
    /// only while no response bytes have been written.
    async fn reject(&mut self) {
        let mut headers = Headers::new();
        headers.insert(header::CONNECTION, "close");
        headers.insert(header::CONTENT_LENGTH, "0");
        let head = codec::encode_response_head(StatusCode::BAD_REQUEST, &headers);
        let _ = self.socket.write_all(&head).await;
    }

    async fn write_response(&mut self, response: Response, close: bool) -> Result<(), HttpError> {
        let Response {
            status,
            mut headers,
            body,
        } = response;
        if close {
            headers.insert(header::CONNECTION, "close");
        }

        match body {
            Body::Empty => {
                if !headers.contains(&header::CONTENT_LENGTH) {
                    headers.insert(header::CONTENT_LENGTH, "0");
                }
                self.socket
                    .write_all(&codec::encode_response_head(status, &headers))
                    .await?;
            }
            Body::Bytes(bytes) => {
                if !headers.contains(&header::CONTENT_LENGTH) {
                    headers.insert(header::CONTENT_LENGTH, bytes.len().to_string());
                }
                let mut out = codec::encode_response_head(status, &headers);
                out.extend_from_slice(&bytes);
                self.socket.write_all(&out).await?;
            }
            Body::Stream(mut rx) => {
                headers.remove(&header::CONTENT_LENGTH);
                headers.insert(header::TRANSFER_ENCODING, "chunked");
                self.socket
                    .write_all(&codec::encode_response_head(status, &headers))
                    .await?;
                while let Some(chunk) = rx.recv().await {
                    if chunk.is_empty() {
                        continue;
                    }
                    self.socket.write_all(&codec::encode_chunk(&chunk)).await?;
                }
                self.socket.write_all(codec::FINAL_CHUNK).await?;
            }
            Body::Upgrade(_) => {
                // never reaches here; the connection loop intercepts
                // upgrades before serialization
                headers.insert(header::CONTENT_LENGTH, "0");
                self.socket
                    .write_all(&codec::encode_response_head(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        &headers,
                    ))
                    .await?;
            }
        }
        Ok(())
    }

    async fn upgrade(
        &mut self,
        request: &Request,
        handler: Arc<dyn WsHandler>,
        buf: BytesMut,
    ) -> Result<(), HttpError> {
        if !ws::is_upgrade(request) {
            self.reject().await;
            return Err(HttpError::Protocol("invalid websocket upgrade request"));
        }
        let key = request
            .headers
            .get(&header::SEC_WEBSOCKET_KEY)
            .unwrap_or_default();

        let mut headers = Headers::new();
        headers.insert(header::CONNECTION, "Upgrade");
        headers.insert(header::UPGRADE, "websocket");
        headers.insert(header::SEC_WEBSOCKET_ACCEPT, ws::accept_key(key.trim()));
        self.socket
            .write_all(&codec::encode_response_head(
                StatusCode::SWITCHING_PROTOCOLS,
                &headers,
            ))
            .await?;
        debug!("connection upgraded to websocket");

        match ws::serve(&self.socket, buf, handler).await {
            Ok(()) => Ok(()),
            Err(crate::error::WsError::Protocol(message)) => Err(HttpError::Protocol(message)),
            Err(crate::error::WsError::Socket(err)) => Err(HttpError::Socket(err)),
        }
    }
}

/// Runs the request through the route table: first route whose
/// predicates hold and whose handler does not signal [Unhandled] wins;
/// otherwise `404`.
async fn dispatch(routes: &RouteTable, request: &Request) -> Response {
    let snapshot = routes.snapshot();
    for entry in snapshot.iter() {
        if let Some(parameters) = entry.route.matches(request) {
            let mut attempt = request.clone();
            attempt.set_parameters(parameters);
            match entry.handler.handle(attempt).await {
                Ok(response) => return response,
                Err(Unhandled) => continue,
            }
        }
    }
    Response::new(StatusCode::NOT_FOUND)
}
