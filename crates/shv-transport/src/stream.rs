use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;

use crate::error::LinkError;
use crate::frame::Frame;

/// Frames larger than this are treated as stream corruption.
const MAX_FRAME_SIZE: u64 = 128 * 1024 * 1024;

type BoxReader = Box<dyn AsyncRead + Unpin + Send + Sync>;
type BoxWriter = Box<dyn AsyncWrite + Unpin + Send + Sync>;

/// Stream framing: `<uvarint payload length><payload>`.
///
/// The length prefix uses the same unsigned integer encoding as ChainPack.
#[derive(Clone)]
pub struct StreamLink {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    reader: AsyncMutex<BoxReader>,
    writer: AsyncMutex<BoxWriter>,
    closed: AtomicBool,
}

impl std::fmt::Debug for StreamLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamLink").finish_non_exhaustive()
    }
}

impl StreamLink {
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::from_split(reader, writer)
    }

    pub fn from_split<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + Sync + 'static,
        W: AsyncWrite + Unpin + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(StreamInner {
                reader: AsyncMutex::new(Box::new(reader)),
                writer: AsyncMutex::new(Box::new(writer)),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Connected in-memory pair, used by tests.
    pub fn pair() -> (Self, Self) {
        let (a, b) = tokio::io::duplex(65536);
        (Self::new(a), Self::new(b))
    }

    pub async fn send(&self, frame: Frame) -> Result<(), LinkError> {
        if self.is_closed() {
            return Err(LinkError::Eof);
        }
        let payload = frame.payload();
        let mut head = shv_value::pack_uint(payload.len() as u64);
        head.extend_from_slice(&payload);
        let mut writer = self.inner.writer.lock().await;
        writer.write_all(&head).await?;
        writer.flush().await?;
        Ok(())
    }

    pub async fn receive(&self) -> Result<Frame, LinkError> {
        if self.is_closed() {
            return Err(LinkError::Eof);
        }
        let mut reader = self.inner.reader.lock().await;
        let mut head = Vec::new();
        let size = loop {
            let mut byte = [0u8; 1];
            reader.read_exact(&mut byte).await?;
            head.push(byte[0]);
            match shv_value::unpack_uint(&head) {
                Ok(Some((size, _))) => break size,
                Ok(None) => continue,
                Err(_) => return Err(LinkError::Eof),
            }
        };
        if size == 0 || size > MAX_FRAME_SIZE {
            return Err(LinkError::Io(std::io::Error::other(format!(
                "invalid frame size: {size}"
            ))));
        }
        let mut payload = vec![0u8; size as usize];
        reader.read_exact(&mut payload).await?;
        Ok(Frame::from_payload(Bytes::from(payload)))
    }

    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}
