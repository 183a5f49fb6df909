use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::stream::{Stream, StreamExt};
use futures_util::sink::{Sink, SinkExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex as AsyncMutex;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tracing::debug;

use crate::error::LinkError;
use crate::frame::Frame;

/// The WebSocket subprotocol SHV 3 peers negotiate.
pub const SUBPROTOCOL: &str = "shv3";

type BoxSink = Box<dyn Sink<WsMessage, Error = WsError> + Send + Unpin>;
type BoxStream = Box<dyn Stream<Item = Result<WsMessage, WsError>> + Send + Unpin>;

/// WebSocket framing: one binary WS message per SHV frame.
///
/// Text messages are discarded; ping/pong stays inside the WS layer.
#[derive(Clone)]
pub struct WebSocketLink {
    inner: Arc<WsInner>,
}

struct WsInner {
    sink: AsyncMutex<BoxSink>,
    stream: AsyncMutex<BoxStream>,
    closed: AtomicBool,
}

impl std::fmt::Debug for WebSocketLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketLink").finish_non_exhaustive()
    }
}

impl WebSocketLink {
    pub fn new<S>(ws: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = ws.split();
        Self {
            inner: Arc::new(WsInner {
                sink: AsyncMutex::new(Box::new(sink)),
                stream: AsyncMutex::new(Box::new(stream)),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Connected in-memory pair with a real handshake, used by tests.
    pub async fn pair() -> (Self, Self) {
        let (client_io, server_io) = tokio::io::duplex(65536);
        let server =
            tokio::spawn(
                async move { tokio_tungstenite::accept_async(server_io).await.unwrap() },
            );
        let (client_ws, _) = tokio_tungstenite::client_async("ws://peer/", client_io)
            .await
            .expect("in-memory handshake");
        let server_ws = server.await.expect("in-memory accept");
        (Self::new(client_ws), Self::new(server_ws))
    }

    pub async fn send(&self, frame: Frame) -> Result<(), LinkError> {
        if self.is_closed() {
            return Err(LinkError::Eof);
        }
        let mut sink = self.inner.sink.lock().await;
        sink.send(WsMessage::Binary(frame.payload()))
            .await
            .map_err(ws_error)
    }

    pub async fn receive(&self) -> Result<Frame, LinkError> {
        if self.is_closed() {
            return Err(LinkError::Eof);
        }
        let mut stream = self.inner.stream.lock().await;
        loop {
            match stream.next().await {
                None => return Err(LinkError::Eof),
                Some(Err(err)) => return Err(ws_error(err)),
                Some(Ok(WsMessage::Binary(data))) => {
                    return Ok(Frame::from_payload(data));
                }
                Some(Ok(WsMessage::Text(_))) => {
                    debug!("discarding text message on SHV WebSocket");
                }
                Some(Ok(WsMessage::Close(_))) => return Err(LinkError::Eof),
                Some(Ok(_)) => {}
            }
        }
    }

    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

fn ws_error(err: WsError) -> LinkError {
    match err {
        WsError::ConnectionClosed | WsError::AlreadyClosed | WsError::Protocol(_) => LinkError::Eof,
        WsError::Io(err) => LinkError::Io(err),
        other => LinkError::Io(std::io::Error::other(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn frame_round_trip() {
        let (a, b) = WebSocketLink::pair().await;
        let msg = Frame::Message(Bytes::from_static(&[1, 0x41, 0x42]));
        a.send(msg.clone()).await.unwrap();
        assert_eq!(b.receive().await.unwrap(), msg);
        b.send(Frame::Reset).await.unwrap();
        assert_eq!(a.receive().await.unwrap(), Frame::Reset);
    }

    #[tokio::test]
    async fn text_messages_are_discarded() {
        let (a, b) = WebSocketLink::pair().await;
        {
            let mut sink = a.inner.sink.lock().await;
            sink.send(WsMessage::Text("noise".into())).await.unwrap();
        }
        let msg = Frame::Message(Bytes::from_static(&[1, 0x40]));
        a.send(msg.clone()).await.unwrap();
        assert_eq!(b.receive().await.unwrap(), msg);
    }
}
