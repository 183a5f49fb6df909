use std::fmt;

/// Failure while decoding a value from either codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadError {
    /// Byte offset the reader was at when the failure was detected.
    pub position: usize,
    pub kind: ReadErrorKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadErrorKind {
    /// Input ended in the middle of a value.
    UnexpectedEof,
    /// Unknown or out-of-place type tag or token.
    InvalidTag(u8),
    /// Structurally invalid data with a reason.
    Malformed(String),
    /// String data that is not valid UTF-8.
    InvalidUtf8,
}

impl ReadError {
    pub(crate) fn eof(position: usize) -> Self {
        Self {
            position,
            kind: ReadErrorKind::UnexpectedEof,
        }
    }

    pub(crate) fn tag(position: usize, tag: u8) -> Self {
        Self {
            position,
            kind: ReadErrorKind::InvalidTag(tag),
        }
    }

    pub(crate) fn malformed(position: usize, reason: impl Into<String>) -> Self {
        Self {
            position,
            kind: ReadErrorKind::Malformed(reason.into()),
        }
    }

    pub(crate) fn utf8(position: usize) -> Self {
        Self {
            position,
            kind: ReadErrorKind::InvalidUtf8,
        }
    }
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ReadErrorKind::UnexpectedEof => {
                write!(f, "unexpected end of input at byte {}", self.position)
            }
            ReadErrorKind::InvalidTag(tag) => {
                write!(f, "invalid type tag {} at byte {}", tag, self.position)
            }
            ReadErrorKind::Malformed(reason) => {
                write!(f, "malformed input at byte {}: {}", self.position, reason)
            }
            ReadErrorKind::InvalidUtf8 => {
                write!(f, "invalid UTF-8 string at byte {}", self.position)
            }
        }
    }
}

impl std::error::Error for ReadError {}
