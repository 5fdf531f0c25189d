use std::time::Duration;

use linkrpc_frame::Outcome;

/// Errors surfaced by connection-level operations.
///
/// Individual calls report failures as [`Outcome::Error`] instead; this type
/// is for connecting, negotiating and other operations with no outcome slot.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] linkrpc_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] linkrpc_frame::FrameError),

    /// Spawning a connection thread or similar OS-level failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Negotiation did not reach a usable state.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// The connection is gone.
    #[error("disconnected: {0}")]
    Disconnected(String),

    /// An operation ran out of time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The peer sent something that violates the protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The remote side answered with an error outcome.
    #[error("call failed with code {code}: {message}")]
    Call { code: i32, message: String },

    /// Bad signature text.
    #[error(transparent)]
    Signature(#[from] linkrpc_frame::SignatureError),

    /// JSON encoding of an auth token failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SessionError {
    /// Map a non-value outcome to an error.
    pub fn from_outcome(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Error { code, message } => SessionError::Call { code, message },
            other => SessionError::Protocol(format!("unexpected outcome: {other}")),
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
