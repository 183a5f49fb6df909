use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use crate::error::LinkError;
use crate::frame::Frame;

const STX: u8 = 0xa2;
const ETX: u8 = 0xa3;
/// Aborts the frame currently being transmitted.
const ATX: u8 = 0xa4;
const ESC: u8 = 0xaa;

/// Escape frame delimiters inside a payload.
///
/// `STX`, `ETX`, `ATX` and `ESC` are replaced by `ESC` followed by `0x02`,
/// `0x03`, `0x04` and `0x0a` respectively.
pub fn escape(data: &[u8]) -> Vec<u8> {
    let mut res = Vec::with_capacity(data.len());
    for &b in data {
        match b {
            STX => res.extend([ESC, 0x02]),
            ETX => res.extend([ESC, 0x03]),
            ATX => res.extend([ESC, 0x04]),
            ESC => res.extend([ESC, 0x0a]),
            b => res.push(b),
        }
    }
    res
}

/// Reverse of [`escape`]. Unknown escape pairs pass through unchanged.
pub fn deescape(data: &[u8]) -> Vec<u8> {
    let mut res = Vec::with_capacity(data.len());
    let mut iter = data.iter();
    while let Some(&b) = iter.next() {
        if b == ESC {
            match iter.next() {
                Some(0x02) => res.push(STX),
                Some(0x03) => res.push(ETX),
                Some(0x04) => res.push(ATX),
                Some(0x0a) => res.push(ESC),
                Some(&other) => res.extend([ESC, other]),
                None => res.push(ESC),
            }
        } else {
            res.push(b);
        }
    }
    res
}

type BoxReader = Box<dyn AsyncRead + Unpin + Send + Sync>;
type BoxWriter = Box<dyn AsyncWrite + Unpin + Send + Sync>;

/// Serial framing: `STX <escaped payload> ETX [<escaped CRC32>]`.
///
/// The CRC-32 is computed over the escaped payload and sent big-endian,
/// itself escaped. Frames with a CRC mismatch are dropped silently, as are
/// frames cut short by `ATX`.
#[derive(Clone)]
pub struct SerialLink {
    inner: Arc<SerialInner>,
}

struct SerialInner {
    reader: AsyncMutex<BoxReader>,
    writer: AsyncMutex<BoxWriter>,
    closed: AtomicBool,
    use_crc: bool,
}

impl std::fmt::Debug for SerialLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialLink")
            .field("use_crc", &self.inner.use_crc)
            .finish_non_exhaustive()
    }
}

impl SerialLink {
    pub fn new<S>(stream: S, use_crc: bool) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            inner: Arc::new(SerialInner {
                reader: AsyncMutex::new(Box::new(reader)),
                writer: AsyncMutex::new(Box::new(writer)),
                closed: AtomicBool::new(false),
                use_crc,
            }),
        }
    }

    /// Connected in-memory pair, used by tests.
    pub fn pair(use_crc: bool) -> (Self, Self) {
        let (a, b) = tokio::io::duplex(65536);
        (Self::new(a, use_crc), Self::new(b, use_crc))
    }

    pub async fn send(&self, frame: Frame) -> Result<(), LinkError> {
        if self.is_closed() {
            return Err(LinkError::Eof);
        }
        let escaped = escape(&frame.payload());
        let mut wire = Vec::with_capacity(escaped.len() + 6);
        wire.push(STX);
        wire.extend_from_slice(&escaped);
        wire.push(ETX);
        if self.inner.use_crc {
            let crc = crc32fast::hash(&escaped);
            wire.extend_from_slice(&escape(&crc.to_be_bytes()));
        }
        let mut writer = self.inner.writer.lock().await;
        writer.write_all(&wire).await?;
        writer.flush().await?;
        Ok(())
    }

    pub async fn receive(&self) -> Result<Frame, LinkError> {
        if self.is_closed() {
            return Err(LinkError::Eof);
        }
        let mut reader = self.inner.reader.lock().await;
        'frame: loop {
            while read_byte(&mut *reader).await? != STX {}
            let mut escaped = Vec::new();
            loop {
                match read_byte(&mut *reader).await? {
                    ETX => break,
                    ATX => continue 'frame,
                    b => escaped.push(b),
                }
            }
            if self.inner.use_crc {
                let mut crc_raw = [0u8; 4];
                for slot in &mut crc_raw {
                    let b = read_byte(&mut *reader).await?;
                    *slot = if b == ESC {
                        deescape(&[ESC, read_byte(&mut *reader).await?])[0]
                    } else {
                        b
                    };
                }
                if u32::from_be_bytes(crc_raw) != crc32fast::hash(&escaped) {
                    debug!("dropping serial frame with CRC mismatch");
                    continue;
                }
            }
            return Ok(Frame::from_payload(Bytes::from(deescape(&escaped))));
        }
    }

    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

async fn read_byte<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u8, LinkError> {
    let mut byte = [0u8; 1];
    reader.read_exact(&mut byte).await?;
    Ok(byte[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_round_trip() {
        let samples: [&[u8]; 5] = [
            b"",
            b"plain",
            &[STX, ETX, ATX, ESC],
            &[ESC, 0x02, ESC, ESC],
            &[0x01, 0xa2, 0xa3, 0xa4, 0xaa, 0xff, 0x00],
        ];
        for data in samples {
            let escaped = escape(data);
            assert_eq!(deescape(&escaped), data);
            // Delimiters never appear unescaped.
            let mut prev_esc = false;
            for &b in &escaped {
                if !prev_esc {
                    assert!(!matches!(b, STX | ETX | ATX), "bare delimiter in {escaped:02x?}");
                }
                prev_esc = b == ESC && !prev_esc;
            }
        }
    }

    #[tokio::test]
    async fn frame_round_trip() {
        for use_crc in [false, true] {
            let (a, b) = SerialLink::pair(use_crc);
            let msg = Frame::Message(Bytes::from_static(&[1, 0xa2, 0xaa, 0x41]));
            a.send(msg.clone()).await.unwrap();
            assert_eq!(b.receive().await.unwrap(), msg);
        }
    }

    #[tokio::test]
    async fn concatenated_frames_in_order() {
        let (a, b) = SerialLink::pair(true);
        let frames = [
            Frame::Message(Bytes::from_static(&[1, 0x41])),
            Frame::Reset,
            Frame::Message(Bytes::from_static(&[1, 0xa3, 0xa4])),
        ];
        for f in &frames {
            a.send(f.clone()).await.unwrap();
        }
        for f in &frames {
            assert_eq!(&b.receive().await.unwrap(), f);
        }
    }

    #[tokio::test]
    async fn atx_aborts_frame() {
        let (client, server) = tokio::io::duplex(4096);
        let link = SerialLink::new(server, false);
        let (_, mut write) = tokio::io::split(client);
        // A frame cut by ATX is discarded, the following one survives.
        write
            .write_all(&[STX, 0x01, 0x02, ATX, STX, 0x01, 0x41, ETX])
            .await
            .unwrap();
        assert_eq!(
            link.receive().await.unwrap(),
            Frame::Message(Bytes::from_static(&[0x01, 0x41]))
        );
    }

    #[tokio::test]
    async fn crc_mismatch_drops_frame() {
        let (client, server) = tokio::io::duplex(4096);
        let link = SerialLink::new(server, true);
        let (_, mut write) = tokio::io::split(client);
        // Corrupted CRC first, then a well-formed frame.
        write
            .write_all(&[STX, 0x01, 0x41, ETX, 0, 0, 0, 0])
            .await
            .unwrap();
        let good = escape(&[0x01, 0x42]);
        let mut wire = vec![STX];
        wire.extend_from_slice(&good);
        wire.push(ETX);
        wire.extend_from_slice(&escape(&crc32fast::hash(&good).to_be_bytes()));
        write.write_all(&wire).await.unwrap();
        assert_eq!(
            link.receive().await.unwrap(),
            Frame::Message(Bytes::from_static(&[0x01, 0x42]))
        );
    }
}
