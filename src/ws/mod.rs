mod frame;

pub use frame::{Frame, Opcode};

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::BytesMut;
use log::{debug, trace};
use sha1::{Digest, Sha1};
use tokio::sync::mpsc;

use crate::error::{SocketError, WsError};
use crate::http::{header, Request};
use crate::socket::AsyncSocket;

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Normal-closure status code.
const CLOSE_NORMAL: u16 = 1000;

/// Computes the `Sec-WebSocket-Accept` value for a handshake key.
pub fn accept_key(key: &str) -> String {
    let mut sha = Sha1::new();
    sha.update(key.as_bytes());
    sha.update(WS_GUID.as_bytes());
    BASE64.encode(sha.finalize())
}

/// True when the request asks to switch this connection to WebSocket.
pub fn is_upgrade(request: &Request) -> bool {
    request.headers.has_token(&header::UPGRADE, "websocket")
        && request
            .headers
            .get(&header::SEC_WEBSOCKET_KEY)
            .map(|key| !key.trim().is_empty())
            .unwrap_or(false)
}

/// A complete WebSocket message, reassembled from its fragments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
}

/// Serves one WebSocket session through a pair of message streams:
/// `incoming` ends when the peer closes; dropping `outgoing` starts the
/// close handshake.
#[async_trait]
pub trait WsHandler: Send + Sync + 'static {
    async fn serve(&self, incoming: mpsc::Receiver<Message>, outgoing: mpsc::Sender<Message>);
}

/// Adapts an async closure into a [WsHandler].
pub struct FnWsHandler<F>(F);

pub fn ws_handler<F, Fut>(f: F) -> FnWsHandler<F>
where
    F: Fn(mpsc::Receiver<Message>, mpsc::Sender<Message>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    FnWsHandler(f)
}

#[async_trait]
impl<F, Fut> WsHandler for FnWsHandler<F>
where
    F: Fn(mpsc::Receiver<Message>, mpsc::Sender<Message>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn serve(&self, incoming: mpsc::Receiver<Message>, outgoing: mpsc::Sender<Message>) {
        (self.0)(incoming, outgoing).await
    }
}

/// Runs the framing session on an upgraded connection. `buf` carries any
/// bytes read past the upgrade request.
pub(crate) async fn serve(
    socket: &AsyncSocket,
    buf: BytesMut,
    handler: Arc<dyn WsHandler>,
) -> Result<(), WsError> {
    let (in_tx, in_rx) = mpsc::channel(16);
    let (out_tx, out_rx) = mpsc::channel(16);

    let handler_task = tokio::spawn(async move { handler.serve(in_rx, out_tx).await });

    let result = Session {
        socket,
        buf,
        fragments: None,
        sent_close: false,
    }
    .run(in_tx, out_rx)
    .await;

    handler_task.abort();
    result
}

struct Session<'a> {
    socket: &'a AsyncSocket,
    buf: BytesMut,
    fragments: Option<(Opcode, Vec<u8>)>,
    sent_close: bool,
}

impl Session<'_> {
    async fn run(
        mut self,
        in_tx: mpsc::Sender<Message>,
        mut out_rx: mpsc::Receiver<Message>,
    ) -> Result<(), WsError> {
        let mut in_tx = Some(in_tx);
        let mut read_buf = [0u8; 4096];

        loop {
            // drain the frames already buffered
            while let Some(frame) = self.next_frame()? {
                trace!("websocket frame: {:?} ({} bytes)", frame.opcode, frame.payload.len());
                match frame.opcode {
                    Opcode::Ping => {
                        let pong = Frame::new(Opcode::Pong, frame.payload);
                        self.write_frame(&pong).await?;
                    }
                    Opcode::Pong => {}
                    Opcode::Close => {
                        if !self.sent_close {
                            // mirror the close code back
                            let mut reply = frame.clone();
                            reply.payload.truncate(2);
                            self.write_frame(&reply).await?;
                        }
                        debug!("websocket close handshake complete");
                        return Ok(());
                    }
                    Opcode::Text | Opcode::Binary | Opcode::Continuation => {
                        if let Some(message) = self.assemble(frame)? {
                            self.deliver(&mut in_tx, &mut out_rx, message).await?;
                        }
                    }
                }
            }

            tokio::select! {
                read = self.socket.read(&mut read_buf) => {
                    match read {
                        Ok(0) | Err(SocketError::Disconnected) => {
                            return if self.sent_close {
                                Ok(())
                            } else {
                                Err(WsError::Socket(SocketError::Disconnected))
                            };
                        }
                        Ok(n) => self.buf.extend_from_slice(&read_buf[..n]),
                        Err(err) => return Err(err.into()),
                    }
                }
                outbound = out_rx.recv(), if !self.sent_close => {
                    match outbound {
                        Some(message) => self.write_message(message).await?,
                        // the handler is done: start the close handshake
                        None => self.send_close().await?,
                    }
                }
            }
        }
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, WsError> {
        match frame::decode(&mut self.buf)? {
            Some((frame, true)) => Ok(Some(frame)),
            // client-to-server frames MUST be masked
            Some((_, false)) => Err(WsError::Protocol("unmasked frame from client")),
            None => Ok(None),
        }
    }

    fn assemble(&mut self, frame: Frame) -> Result<Option<Message>, WsError> {
        assemble(&mut self.fragments, frame)
    }

    /// Hands a message to the handler while keeping outbound frames
    /// flowing, so neither side can stall the other.
    async fn deliver(
        &mut self,
        in_tx: &mut Option<mpsc::Sender<Message>>,
        out_rx: &mut mpsc::Receiver<Message>,
        message: Message,
    ) -> Result<(), WsError> {
        let Some(tx) = in_tx.clone() else {
            return Ok(());
        };
        let mut message = Some(message);
        loop {
            tokio::select! {
                permit = tx.reserve() => {
                    match permit {
                        Ok(permit) => {
                            if let Some(message) = message.take() {
                                permit.send(message);
                            }
                            return Ok(());
                        }
                        Err(_) => {
                            // the handler dropped its inbound stream
                            *in_tx = None;
                            if !self.sent_close {
                                self.send_close().await?;
                            }
                            return Ok(());
                        }
                    }
                }
                outbound = out_rx.recv(), if !self.sent_close => {
                    match outbound {
                        Some(message) => self.write_message(message).await?,
                        None => self.send_close().await?,
                    }
                }
            }
        }
    }

    async fn write_message(&mut self, message: Message) -> Result<(), WsError> {
        let frame = match message {
            Message::Text(text) => Frame::new(Opcode::Text, text.into_bytes()),
            Message::Binary(bytes) => Frame::new(Opcode::Binary, bytes),
        };
        self.write_frame(&frame).await
    }

    async fn send_close(&mut self) -> Result<(), WsError> {
        self.sent_close = true;
        let close = Frame::close(CLOSE_NORMAL);
        self.write_frame(&close).await
    }

    async fn write_frame(&mut self, frame: &Frame) -> Result<(), WsError> {
        // server-to-client frames are never masked
        let bytes = frame::encode(frame, None);
        self.socket.write_all(&bytes).await?;
        Ok(())
    }
}

fn assemble(
    fragments: &mut Option<(Opcode, Vec<u8>)>,
    frame: Frame,
) -> Result<Option<Message>, WsError> {
    match frame.opcode {
        Opcode::Continuation => {
            let Some((opcode, mut accumulated)) = fragments.take() else {
                return Err(WsError::Protocol("continuation without a first fragment"));
            };
            accumulated.extend_from_slice(&frame.payload);
            if frame.fin {
                finish_message(opcode, accumulated).map(Some)
            } else {
                *fragments = Some((opcode, accumulated));
                Ok(None)
            }
        }
        Opcode::Text | Opcode::Binary => {
            if fragments.is_some() {
                return Err(WsError::Protocol("interleaved data frames"));
            }
            if frame.fin {
                finish_message(frame.opcode, frame.payload).map(Some)
            } else {
                *fragments = Some((frame.opcode, frame.payload));
                Ok(None)
            }
        }
        _ => Ok(None),
    }
}

fn finish_message(opcode: Opcode, payload: Vec<u8>) -> Result<Message, WsError> {
    match opcode {
        Opcode::Text => String::from_utf8(payload)
            .map(Message::Text)
            .map_err(|_| WsError::Protocol("text message is not valid UTF-8")),
        _ => Ok(Message::Binary(payload)),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn accept_key_matches_the_rfc_example() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn upgrade_requires_header_and_key() {
        let mut request = Request::new(crate::http::Method::Get, "/socket");
        assert!(!is_upgrade(&request));

        request.headers.insert(header::UPGRADE, "websocket");
        assert!(!is_upgrade(&request));

        request
            .headers
            .insert(header::SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==");
        assert!(is_upgrade(&request));
    }

    #[test]
    fn fragments_reassemble_into_one_message() {
        let mut fragments = None;

        let mut first = Frame::new(Opcode::Text, &b"he"[..]);
        first.fin = false;
        assert_eq!(assemble(&mut fragments, first).unwrap(), None);

        let mut middle = Frame::new(Opcode::Continuation, &b"ll"[..]);
        middle.fin = false;
        assert_eq!(assemble(&mut fragments, middle).unwrap(), None);

        let last = Frame::new(Opcode::Continuation, &b"o"[..]);
        let message = assemble(&mut fragments, last).unwrap();
        assert_eq!(message, Some(Message::Text("hello".to_owned())));
        assert!(fragments.is_none());
    }

    #[test]
    fn stray_continuations_are_rejected() {
        let mut fragments = None;
        let stray = Frame::new(Opcode::Continuation, &b"?"[..]);
        assert!(assemble(&mut fragments, stray).is_err());
    }

    #[test]
    fn interleaved_data_frames_are_rejected() {
        let mut fragments = None;

        let mut first = Frame::new(Opcode::Binary, &b"a"[..]);
        first.fin = false;
        assemble(&mut fragments, first).unwrap();

        let second = Frame::new(Opcode::Text, &b"b"[..]);
        assert!(assemble(&mut fragments, second).is_err());
    }

    #[test]
    fn text_messages_must_be_utf8() {
        let mut fragments = None;
        let invalid = Frame::new(Opcode::Text, vec![0xff, 0xfe]);
        assert!(assemble(&mut fragments, invalid).is_err());
    }
}
