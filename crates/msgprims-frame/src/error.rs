/// Errors that can occur during header and frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The header bytes could not be parsed. The frame has been consumed.
    #[error("invalid header: {0}")]
    InvalidHeader(String),

    /// The header carries a type byte this codec does not know.
    #[error("unknown header type 0x{0:02x}")]
    UnknownHeaderType(u8),

    /// A header whose frame extent is known but whose content is unusable.
    /// The reader discards the `body_length` body bytes that follow it
    /// before returning this error.
    #[error("malformed frame ({body_length} body bytes skipped): {reason}")]
    MalformedFrame { reason: String, body_length: u64 },

    /// The declared header length exceeds the configured maximum.
    #[error("header too large ({size} bytes, max {max})")]
    HeaderTooLarge { size: usize, max: usize },

    /// A serialized object exceeds the configured maximum.
    #[error("object too large ({size} bytes, max {max})")]
    ObjectTooLarge { size: usize, max: usize },

    /// A complete object was read but did not have the expected shape.
    #[error("object decode error: {0}")]
    Object(#[from] serde_json::Error),

    /// The object stream is not valid and cannot be resynchronized.
    #[error("object stream corrupted: {0}")]
    StreamCorrupted(String),

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete frame was received.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,
}

impl FrameError {
    /// True for per-frame errors after which the stream is still aligned
    /// on a frame boundary, so the receive loop may log and continue.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            FrameError::InvalidHeader(_)
                | FrameError::UnknownHeaderType(_)
                | FrameError::MalformedFrame { .. }
                | FrameError::Object(_)
        )
    }

    /// Wrap a content error of a header whose frame carries `body_length`
    /// body bytes.
    pub fn malformed(err: FrameError, body_length: i64) -> Self {
        FrameError::MalformedFrame {
            reason: err.to_string(),
            body_length: body_length.max(0) as u64,
        }
    }

    /// True when the underlying read or write timed out rather than failed.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            FrameError::Io(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut
        )
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
