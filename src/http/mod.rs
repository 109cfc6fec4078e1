pub mod codec;
pub mod router;

use std::borrow::Cow;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use indexmap::IndexMap;
use tokio::sync::mpsc;

use crate::error::Unhandled;
use crate::ws::WsHandler;

/// An HTTP request method.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
    Patch,
    Extension(String),
}

impl Method {
    /// The method for a request-line token. Unknown tokens become
    /// [Method::Extension].
    pub fn from_name(name: &str) -> Method {
        match name {
            "GET" => Method::Get,
            "HEAD" => Method::Head,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "DELETE" => Method::Delete,
            "CONNECT" => Method::Connect,
            "OPTIONS" => Method::Options,
            "TRACE" => Method::Trace,
            "PATCH" => Method::Patch,
            other => Method::Extension(other.to_owned()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Connect => "CONNECT",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Patch => "PATCH",
            Method::Extension(name) => name,
        }
    }
}

impl FromStr for Method {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Method, Self::Err> {
        Ok(Method::from_name(s))
    }
}

impl fmt::Display for Method {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.write_str(self.as_str())
    }
}

/// An HTTP status code with its canonical reason phrase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StatusCode(pub u16);

impl StatusCode {
    pub const SWITCHING_PROTOCOLS: StatusCode = StatusCode(101);
    pub const OK: StatusCode = StatusCode(200);
    pub const NO_CONTENT: StatusCode = StatusCode(204);
    pub const MOVED_PERMANENTLY: StatusCode = StatusCode(301);
    pub const NOT_MODIFIED: StatusCode = StatusCode(304);
    pub const BAD_REQUEST: StatusCode = StatusCode(400);
    pub const UNAUTHORIZED: StatusCode = StatusCode(401);
    pub const FORBIDDEN: StatusCode = StatusCode(403);
    pub const NOT_FOUND: StatusCode = StatusCode(404);
    pub const PAYLOAD_TOO_LARGE: StatusCode = StatusCode(413);
    pub const INTERNAL_SERVER_ERROR: StatusCode = StatusCode(500);

    pub fn reason(&self) -> &'static str {
        match self.0 {
            100 => "Continue",
            101 => "Switching Protocols",
            200 => "OK",
            201 => "Created",
            202 => "Accepted",
            204 => "No Content",
            301 => "Moved Permanently",
            302 => "Found",
            304 => "Not Modified",
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            408 => "Request Timeout",
            411 => "Length Required",
            413 => "Payload Too Large",
            426 => "Upgrade Required",
            500 => "Internal Server Error",
            501 => "Not Implemented",
            503 => "Service Unavailable",
            _ => "Unknown",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{} {}", self.0, self.reason())
    }
}

/// A header field name. Comparison and hashing ignore ASCII case; the
/// original spelling is kept for serialization.
#[derive(Debug, Clone, Eq)]
pub struct HeaderName(Cow<'static, str>);

impl HeaderName {
    pub const fn from_static(name: &'static str) -> HeaderName {
        HeaderName(Cow::Borrowed(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl PartialEq for HeaderName {
    fn eq(&self, other: &HeaderName) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl Hash for HeaderName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for b in self.0.bytes() {
            state.write_u8(b.to_ascii_lowercase());
        }
    }
}

impl From<&str> for HeaderName {
    fn from(name: &str) -> HeaderName {
        HeaderName(Cow::Owned(name.to_owned()))
    }
}

impl From<String> for HeaderName {
    fn from(name: String) -> HeaderName {
        HeaderName(Cow::Owned(name))
    }
}

impl fmt::Display for HeaderName {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.write_str(&self.0)
    }
}

/// Well-known header names.
pub mod header {
    use super::HeaderName;

    pub const HOST: HeaderName = HeaderName::from_static("Host");
    pub const CONNECTION: HeaderName = HeaderName::from_static("Connection");
    pub const CONTENT_LENGTH: HeaderName = HeaderName::from_static("Content-Length");
    pub const CONTENT_TYPE: HeaderName = HeaderName::from_static("Content-Type");
    pub const TRANSFER_ENCODING: HeaderName = HeaderName::from_static("Transfer-Encoding");
    pub const UPGRADE: HeaderName = HeaderName::from_static("Upgrade");
    pub const SEC_WEBSOCKET_KEY: HeaderName = HeaderName::from_static("Sec-WebSocket-Key");
    pub const SEC_WEBSOCKET_ACCEPT: HeaderName = HeaderName::from_static("Sec-WebSocket-Accept");
    pub const SEC_WEBSOCKET_VERSION: HeaderName = HeaderName::from_static("Sec-WebSocket-Version");
}

/// Header fields in insertion order with case-insensitive names.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Headers {
    entries: IndexMap<HeaderName, String>,
}

impl Headers {
    pub fn new() -> Headers {
        Headers::default()
    }

    pub fn insert(&mut self, name: impl Into<HeaderName>, value: impl Into<String>) {
        self.entries.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &HeaderName) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    pub fn contains(&self, name: &HeaderName) -> bool {
        self.entries.contains_key(name)
    }

    pub fn remove(&mut self, name: &HeaderName) -> Option<String> {
        self.entries.shift_remove(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&HeaderName, &str)> {
        self.entries.iter().map(|(name, value)| (name, value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when the (comma-separated) header value contains `token`,
    /// ignoring ASCII case. `Connection: keep-alive, Upgrade` matches
    /// the token `upgrade`.
    pub fn has_token(&self, name: &HeaderName, token: &str) -> bool {
        match self.get(name) {
            Some(value) => value
                .split(',')
                .any(|part| part.trim().eq_ignore_ascii_case(token)),
            None => false,
        }
    }
}

/// A parsed HTTP request. The body has been read in full by the codec.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Headers,
    pub body: Bytes,
    parameters: Vec<(String, String)>,
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>) -> Request {
        Request {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: Headers::new(),
            body: Bytes::new(),
            parameters: Vec::new(),
        }
    }

    /// First value for the query item `name`, if present.
    pub fn query_value(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// A path capture converted to the requested type. Fails with
    /// [Unhandled] when the capture is missing or does not parse, letting
    /// dispatch fall through to the next route.
    pub fn parameter<T: FromStr>(&self, name: &str) -> Result<T, Unhandled> {
        let raw = self
            .parameters
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
            .ok_or(Unhandled)?;
        raw.parse().map_err(|_| Unhandled)
    }

    pub(crate) fn set_parameters(&mut self, parameters: Vec<(String, String)>) {
        self.parameters = parameters;
    }
}

/// A response body: fixed bytes, a chunk-framed stream, or a protocol
/// upgrade.
pub enum Body {
    Empty,
    Bytes(Bytes),
    /// Written with `Transfer-Encoding: chunked`, one chunk per received
    /// buffer, until the sender side is dropped.
    Stream(mpsc::Receiver<Bytes>),
    /// Switch the connection to WebSocket framing driven by the handler.
    Upgrade(Arc<dyn WsHandler>),
}

impl fmt::Debug for Body {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Body::Empty => fmt.write_str("Body::Empty"),
            Body::Bytes(bytes) => write!(fmt, "Body::Bytes({} bytes)", bytes.len()),
            Body::Stream(_) => fmt.write_str("Body::Stream"),
            Body::Upgrade(_) => fmt.write_str("Body::Upgrade"),
        }
    }
}

/// An HTTP response.
#[derive(Debug)]
pub struct Response {
    pub status: StatusCode,
    pub headers: Headers,
    pub body: Body,
}

impl Response {
    pub fn new(status: StatusCode) -> Response {
        Response {
            status,
            headers: Headers::new(),
            body: Body::Empty,
        }
    }

    /// A `200 OK` with a `text/plain` body.
    pub fn text(body: impl Into<String>) -> Response {
        let body: String = body.into();
        let mut response = Response::new(StatusCode::OK);
        response
            .headers
            .insert(header::CONTENT_TYPE, "text/plain; charset=utf-8");
        response.body = Body::Bytes(Bytes::from(body.into_bytes()));
        response
    }

    pub fn bytes(status: StatusCode, body: impl Into<Bytes>) -> Response {
        let mut response = Response::new(status);
        response.body = Body::Bytes(body.into());
        response
    }

    /// A response whose body arrives as chunks from `rx`.
    pub fn stream(status: StatusCode, rx: mpsc::Receiver<Bytes>) -> Response {
        let mut response = Response::new(status);
        response.body = Body::Stream(rx);
        response
    }

    /// Upgrades the connection to a WebSocket session served by
    /// `handler` after the `101` handshake.
    pub fn websocket(handler: impl WsHandler) -> Response {
        let mut response = Response::new(StatusCode::SWITCHING_PROTOCOLS);
        response.body = Body::Upgrade(Arc::new(handler));
        response
    }

    pub fn header(mut self, name: impl Into<HeaderName>, value: impl Into<String>) -> Response {
        self.headers.insert(name, value);
        self
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn header_names_ignore_case() {
        let mut headers = Headers::new();
        headers.insert("Content-Type", "text/plain");

        assert_eq!(
            headers.get(&HeaderName::from("content-type")),
            Some("text/plain")
        );
        assert_eq!(headers.get(&header::CONTENT_TYPE), Some("text/plain"));

        headers.insert("CONTENT-TYPE", "application/json");
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get(&header::CONTENT_TYPE), Some("application/json"));
    }

    #[test]
    fn connection_tokens() {
        let mut headers = Headers::new();
        headers.insert(header::CONNECTION, "keep-alive, Upgrade");

        assert!(headers.has_token(&header::CONNECTION, "upgrade"));
        assert!(headers.has_token(&header::CONNECTION, "keep-alive"));
        assert!(!headers.has_token(&header::CONNECTION, "close"));
    }

    #[test]
    fn typed_parameters() {
        let mut request = Request::new(Method::Get, "/users/42");
        request.set_parameters(vec![("id".to_owned(), "42".to_owned())]);

        let id: u32 = request.parameter("id").unwrap();
        assert_eq!(id, 42);
        assert!(request.parameter::<u32>("missing").is_err());
        assert!(request.parameter::<std::net::Ipv4Addr>("id").is_err());
    }
}
