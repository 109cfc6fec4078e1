use std::mem;

use bytes::{Bytes, BytesMut};

use super::{header, Headers, Method, Request, StatusCode};
use crate::error::HttpError;

/// Tunable parsing limits. Exceeding any of them yields `400` and closes
/// the connection.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    /// Request line plus header block.
    pub max_head_bytes: usize,
    /// Decoded request body.
    pub max_body_bytes: usize,
    /// A single chunk-size or trailer line.
    pub max_line_bytes: usize,
}

impl Default for Limits {
    fn default() -> Limits {
        Limits {
            max_head_bytes: 16 * 1024,
            max_body_bytes: 1024 * 1024,
            max_line_bytes: 4096,
        }
    }
}

enum Framing {
    Length { remaining: usize },
    Chunked { stage: Chunk },
}

enum Chunk {
    Size,
    Data { remaining: usize },
    DataCrlf,
    Trailers,
}

enum State {
    Head,
    Body {
        head: Request,
        framing: Framing,
        body: BytesMut,
    },
}

/// Incremental request parser.
///
/// Feed it the connection's receive buffer with [RequestParser::advance];
/// it consumes exactly the bytes of one request and leaves pipelined
/// bytes in place. `Ok(None)` means more input is needed.
pub struct RequestParser {
    limits: Limits,
    state: State,
}

impl RequestParser {
    pub fn new(limits: Limits) -> RequestParser {
        RequestParser {
            limits,
            state: State::Head,
        }
    }

    /// True when no bytes of a request have been consumed yet.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::Head)
    }

    pub fn advance(&mut self, buf: &mut BytesMut) -> Result<Option<Request>, HttpError> {
        loop {
            match mem::replace(&mut self.state, State::Head) {
                State::Head => {
                    let Some(end) = find_head_end(buf) else {
                        if buf.len() > self.limits.max_head_bytes {
                            return Err(HttpError::TooLarge("header block"));
                        }
                        return Ok(None);
                    };
                    if end + 4 > self.limits.max_head_bytes {
                        return Err(HttpError::TooLarge("header block"));
                    }
                    let head_bytes = buf.split_to(end + 4);
                    let head = parse_head(&head_bytes)?;
                    match select_framing(&head.headers)? {
                        None => return Ok(Some(head)),
                        Some(framing) => {
                            self.state = State::Body {
                                head,
                                framing,
                                body: BytesMut::new(),
                            };
                        }
                    }
                }
                State::Body {
                    mut head,
                    mut framing,
                    mut body,
                } => {
                    let complete = self.fill_body(buf, &mut framing, &mut body)?;
                    if complete {
                        head.body = body.freeze();
                        return Ok(Some(head));
                    }
                    self.state = State::Body { head, framing, body };
                    return Ok(None);
                }
            }
        }
    }

    fn fill_body(
        &self,
        buf: &mut BytesMut,
        framing: &mut Framing,
        body: &mut BytesMut,
    ) -> Result<bool, HttpError> {
        match framing {
            Framing::Length { remaining } => {
                let take = (*remaining).min(buf.len());
                body.extend_from_slice(&buf.split_to(take));
                *remaining -= take;
                if body.len() > self.limits.max_body_bytes {
                    return Err(HttpError::TooLarge("request body"));
                }
                Ok(*remaining == 0)
            }
            Framing::Chunked { stage } => loop {
                match stage {
                    Chunk::Size => {
                        let Some(line) = take_line(buf, self.limits.max_line_bytes)? else {
                            return Ok(false);
                        };
                        let size = parse_chunk_size(&line)?;
                        if size == 0 {
                            *stage = Chunk::Trailers;
                        } else {
                            *stage = Chunk::Data { remaining: size };
                        }
                    }
                    Chunk::Data { remaining } => {
                        let take = (*remaining).min(buf.len());
                        body.extend_from_slice(&buf.split_to(take));
                        *remaining -= take;
                        if body.len() > self.limits.max_body_bytes {
                            return Err(HttpError::TooLarge("request body"));
                        }
                        if *remaining > 0 {
                            return Ok(false);
                        }
                        *stage = Chunk::DataCrlf;
                    }
                    Chunk::DataCrlf => {
                        if buf.len() < 2 {
                            return Ok(false);
                        }
                        let crlf = buf.split_to(2);
                        if &crlf[..] != b"\r\n" {
                            return Err(HttpError::Protocol("chunk data not CRLF-terminated"));
                        }
                        *stage = Chunk::Size;
                    }
                    Chunk::Trailers => {
                        let Some(line) = take_line(buf, self.limits.max_line_bytes)? else {
                            return Ok(false);
                        };
                        // trailers are accepted and discarded
                        if line.is_empty() {
                            return Ok(true);
                        }
                    }
                }
            },
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|window| window == b"\r\n\r\n")
}

/// Removes one CRLF-terminated line from `buf`, without the terminator.
fn take_line(buf: &mut BytesMut, max_line: usize) -> Result<Option<Vec<u8>>, HttpError> {
    match buf.windows(2).position(|window| window == b"\r\n") {
        Some(pos) => {
            if pos > max_line {
                return Err(HttpError::TooLarge("line"));
            }
            let line = buf.split_to(pos + 2);
            Ok(Some(line[..pos].to_vec()))
        }
        None => {
            if buf.len() > max_line {
                return Err(HttpError::TooLarge("line"));
            }
            Ok(None)
        }
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<usize, HttpError> {
    let line = std::str::from_utf8(line).map_err(|_| HttpError::Protocol("invalid chunk size"))?;
    // chunk extensions after ';' are ignored
    let size = line.split(';').next().unwrap_or("").trim();
    usize::from_str_radix(size, 16).map_err(|_| HttpError::Protocol("invalid chunk size"))
}

fn parse_head(bytes: &[u8]) -> Result<Request, HttpError> {
    let text =
        std::str::from_utf8(bytes).map_err(|_| HttpError::Protocol("header block not UTF-8"))?;
    let mut lines = text.split("\r\n");

    let request_line = lines
        .next()
        .ok_or(HttpError::Protocol("missing request line"))?;
    let mut parts = request_line.split(' ');
    let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(method), Some(target), Some(version), None) => (method, target, version),
        _ => return Err(HttpError::Protocol("malformed request line")),
    };
    if method.is_empty() || target.is_empty() {
        return Err(HttpError::Protocol("malformed request line"));
    }
    if !version.starts_with("HTTP/1.") {
        return Err(HttpError::Protocol("unsupported protocol version"));
    }

    let method = Method::from_name(method);
    let (path, query) = parse_target(target)?;

    let mut request = Request::new(method, path);
    request.query = query;

    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or(HttpError::Protocol("malformed header field"))?;
        if name.is_empty() || name.ends_with(' ') || name.ends_with('\t') {
            return Err(HttpError::Protocol("malformed header field"));
        }
        request.headers.insert(name, value.trim());
    }
    Ok(request)
}

fn parse_target(target: &str) -> Result<(String, Vec<(String, String)>), HttpError> {
    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (target, None),
    };

    let path = percent_decode(path, false)?;
    let mut items = Vec::new();
    if let Some(query) = query {
        for item in query.split('&').filter(|item| !item.is_empty()) {
            let (name, value) = match item.split_once('=') {
                Some((name, value)) => (name, value),
                None => (item, ""),
            };
            items.push((percent_decode(name, true)?, percent_decode(value, true)?));
        }
    }
    Ok((path, items))
}

fn percent_decode(input: &str, plus_as_space: bool) -> Result<String, HttpError> {
    if !input.contains('%') && !(plus_as_space && input.contains('+')) {
        return Ok(input.to_owned());
    }

    let mut out = Vec::with_capacity(input.len());
    let mut bytes = input.bytes();
    while let Some(b) = bytes.next() {
        match b {
            b'%' => {
                let (hi, lo) = match (bytes.next(), bytes.next()) {
                    (Some(hi), Some(lo)) => (hi, lo),
                    _ => return Err(HttpError::Protocol("truncated percent escape")),
                };
                let decode = |c: u8| -> Result<u8, HttpError> {
                    (c as char)
                        .to_digit(16)
                        .map(|d| d as u8)
                        .ok_or(HttpError::Protocol("invalid percent escape"))
                };
                out.push(decode(hi)? << 4 | decode(lo)?);
            }
            b'+' if plus_as_space => out.push(b' '),
            other => out.push(other),
        }
    }
    String::from_utf8(out).map_err(|_| HttpError::Protocol("percent escape not UTF-8"))
}

fn select_framing(headers: &Headers) -> Result<Option<Framing>, HttpError> {
    let transfer_encoding = headers.get(&header::TRANSFER_ENCODING);
    let content_length = headers.get(&header::CONTENT_LENGTH);

    match (transfer_encoding, content_length) {
        // RFC 7230 §3.3.3: reject rather than guess
        (Some(_), Some(_)) => Err(HttpError::Protocol(
            "both content-length and transfer-encoding present",
        )),
        (Some(encoding), None) => {
            if encoding
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("chunked"))
            {
                Ok(Some(Framing::Chunked { stage: Chunk::Size }))
            } else {
                Err(HttpError::Protocol("unsupported transfer encoding"))
            }
        }
        (None, Some(length)) => {
            let remaining: usize = length
                .trim()
                .parse()
                .map_err(|_| HttpError::Protocol("invalid content-length"))?;
            if remaining == 0 {
                Ok(None)
            } else {
                Ok(Some(Framing::Length { remaining }))
            }
        }
        (None, None) => Ok(None),
    }
}

/// Serializes a response status line and header block.
pub fn encode_response_head(status: StatusCode, headers: &Headers) -> Vec<u8> {
    let mut out = Vec::with_capacity(128);
    out.extend_from_slice(b"HTTP/1.1 ");
    out.extend_from_slice(status.0.to_string().as_bytes());
    out.push(b' ');
    out.extend_from_slice(status.reason().as_bytes());
    out.extend_from_slice(b"\r\n");
    for (name, value) in headers.iter() {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}

/// Serializes a request; the inverse of [RequestParser::advance] for
/// bodies framed by `Content-Length`.
pub fn encode_request(request: &Request) -> Vec<u8> {
    let mut out = Vec::with_capacity(128);
    out.extend_from_slice(request.method.as_str().as_bytes());
    out.push(b' ');
    out.extend_from_slice(request.path.as_bytes());
    for (idx, (name, value)) in request.query.iter().enumerate() {
        out.push(if idx == 0 { b'?' } else { b'&' });
        out.extend_from_slice(name.as_bytes());
        out.push(b'=');
        out.extend_from_slice(value.as_bytes());
    }
    out.extend_from_slice(b" HTTP/1.1\r\n");
    for (name, value) in request.headers.iter() {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    if !request.body.is_empty() && !request.headers.contains(&header::CONTENT_LENGTH) {
        out.extend_from_slice(b"Content-Length: ");
        out.extend_from_slice(request.body.len().to_string().as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&request.body);
    out
}

/// Frames one chunk of a streamed body.
pub fn encode_chunk(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 16);
    out.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    out
}

pub const FINAL_CHUNK: &[u8] = b"0\r\n\r\n";

/// A complete decoded response: status, headers and de-framed body.
/// Primarily for clients and tests; parses a full response buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedResponse {
    pub status: StatusCode,
    pub headers: Headers,
    pub body: Bytes,
}

/// Decodes one response from `buf`, consuming its bytes. `Ok(None)` means
/// the buffer does not hold a complete response yet; the buffer is left
/// untouched in that case.
pub fn decode_response(buf: &mut BytesMut) -> Result<Option<DecodedResponse>, HttpError> {
    let mut attempt = buf.clone();
    let Some(end) = find_head_end(&attempt) else {
        return Ok(None);
    };
    let head = attempt.split_to(end + 4);
    let text =
        std::str::from_utf8(&head).map_err(|_| HttpError::Protocol("header block not UTF-8"))?;
    let mut lines = text.split("\r\n");

    let status_line = lines
        .next()
        .ok_or(HttpError::Protocol("missing status line"))?;
    let mut parts = status_line.splitn(3, ' ');
    let (version, status) = match (parts.next(), parts.next()) {
        (Some(version), Some(status)) => (version, status),
        _ => return Err(HttpError::Protocol("malformed status line")),
    };
    if !version.starts_with("HTTP/1.") {
        return Err(HttpError::Protocol("unsupported protocol version"));
    }
    let status: u16 = status
        .parse()
        .map_err(|_| HttpError::Protocol("malformed status code"))?;

    let mut headers = Headers::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or(HttpError::Protocol("malformed header field"))?;
        headers.insert(name, value.trim());
    }

    let mut body = BytesMut::new();
    match select_framing(&headers)? {
        None => {}
        Some(mut framing) => {
            // reuse the request body machinery; limits are generous here
            let parser = RequestParser::new(Limits {
                max_body_bytes: usize::MAX,
                ..Limits::default()
            });
            if !parser.fill_body(&mut attempt, &mut framing, &mut body)? {
                return Ok(None);
            }
        }
    }

    *buf = attempt;
    Ok(Some(DecodedResponse {
        status: StatusCode(status),
        headers,
        body: body.freeze(),
    }))
}
