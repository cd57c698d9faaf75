//! Coordinator-side error types.

use distcompute_protocol::FramingError;
use thiserror::Error;

/// Errors that can end a worker session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The worker's token (or lack of one) did not match the configured
    /// shared token. The session sends `AUTH_FAILED` and closes before
    /// this error reaches the caller.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The first message on the wire was not `REGISTER_WORKER`.
    #[error("expected REGISTER_WORKER, got {0:?}")]
    UnexpectedFirstMessage(distcompute_protocol::MessageKind),

    #[error(transparent)]
    Framing(#[from] FramingError),
}
