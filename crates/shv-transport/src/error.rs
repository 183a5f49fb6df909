use std::fmt;

/// Failure of a transport link operation.
#[derive(Debug)]
pub enum LinkError {
    /// The peer closed the connection or the link was closed locally.
    Eof,
    /// Underlying I/O failure.
    Io(std::io::Error),
    /// The requested protocol has no transport implementation.
    Unsupported(String),
    /// WebSocket handshake did not end up with the expected subprotocol.
    Handshake(String),
}

impl LinkError {
    pub fn is_eof(&self) -> bool {
        matches!(self, LinkError::Eof)
    }
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkError::Eof => write!(f, "end of connection"),
            LinkError::Io(err) => write!(f, "link I/O error: {err}"),
            LinkError::Unsupported(what) => write!(f, "unsupported transport: {what}"),
            LinkError::Handshake(what) => write!(f, "handshake failed: {what}"),
        }
    }
}

impl std::error::Error for LinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LinkError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for LinkError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            LinkError::Eof
        } else {
            LinkError::Io(err)
        }
    }
}
