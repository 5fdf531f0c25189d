/// Errors raised while encoding or decoding frames.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame body ended early or contained bytes that do not decode.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// The declared body length exceeds the configured maximum.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The frame cannot be expressed at the connection's protocol version.
    #[error("frame not representable at protocol version {version}: {reason}")]
    Unrepresentable { version: u32, reason: String },

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The stream reached EOF.
    #[error("connection closed")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, FrameError>;
