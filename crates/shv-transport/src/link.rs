use crate::error::LinkError;
use crate::frame::Frame;
use crate::serial::SerialLink;
use crate::stream::StreamLink;
use crate::websocket::WebSocketLink;

/// A connection carrying SHV frames, one variant per framing backend.
#[derive(Clone, Debug)]
pub enum Link {
    Stream(StreamLink),
    Serial(SerialLink),
    WebSocket(WebSocketLink),
}

impl Link {
    /// Connected in-memory pair with Stream framing, used by tests.
    pub fn pair() -> (Self, Self) {
        let (a, b) = StreamLink::pair();
        (Link::Stream(a), Link::Stream(b))
    }

    pub fn stream<S>(stream: S) -> Self
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + Sync + 'static,
    {
        Link::Stream(StreamLink::new(stream))
    }

    pub fn serial<S>(stream: S, use_crc: bool) -> Self
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + Sync + 'static,
    {
        Link::Serial(SerialLink::new(stream, use_crc))
    }

    pub async fn send(&self, frame: Frame) -> Result<(), LinkError> {
        match self {
            Link::Stream(link) => link.send(frame).await,
            Link::Serial(link) => link.send(frame).await,
            Link::WebSocket(link) => link.send(frame).await,
        }
    }

    pub async fn receive(&self) -> Result<Frame, LinkError> {
        match self {
            Link::Stream(link) => link.receive().await,
            Link::Serial(link) => link.receive().await,
            Link::WebSocket(link) => link.receive().await,
        }
    }

    /// Send the in-band RESET control.
    pub async fn send_reset(&self) -> Result<(), LinkError> {
        self.send(Frame::Reset).await
    }

    pub fn close(&self) {
        match self {
            Link::Stream(link) => link.close(),
            Link::Serial(link) => link.close(),
            Link::WebSocket(link) => link.close(),
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            Link::Stream(link) => link.is_closed(),
            Link::Serial(link) => link.is_closed(),
            Link::WebSocket(link) => link.is_closed(),
        }
    }
}
