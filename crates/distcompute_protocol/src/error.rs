//! Error types for the wire framing layer.

use thiserror::Error;

/// Framing operation result type.
pub type Result<T> = std::result::Result<T, FramingError>;

/// Errors raised while encoding, sending, receiving, or decoding a framed
/// message.
#[derive(Error, Debug)]
pub enum FramingError {
    /// The peer closed the connection cleanly between messages, or
    /// mid-frame.
    #[error("connection lost")]
    ConnectionLost,

    /// The framing stream was malformed: an out-of-order or unexpected
    /// chunk, a bad flags byte, or similar. The connection must be
    /// terminated immediately.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The frame's body could not be deserialized into a `Message`.
    #[error("decode error: {0}")]
    DecodeError(#[from] bincode::Error),

    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl FramingError {
    pub fn protocol_violation(msg: impl Into<String>) -> Self {
        Self::ProtocolViolation(msg.into())
    }
}
