//! Wire Protocol: framing, message grammar, and shared configuration for
//! the coordinator/worker cluster.
//!
//! # Protocol specification
//!
//! Every message on the wire is carried by a framed unit:
//!
//! ```text
//! [LEN:4 big-endian][FLAGS:1][BODY:LEN bytes]
//! ```
//!
//! `BODY` is a `bincode` encoding of a [`types::Message`]. Flag bit 0 means
//! the body is zlib-compressed; see [`framing`] for the full chunking and
//! compression contract.

pub mod config;
pub mod defaults;
pub mod error;
pub mod framing;
pub mod types;

pub use error::{FramingError, Result};
pub use types::{
    ArgValue, AuthFailedPayload, ChunkDataPayload, ChunkEndPayload, ChunkStartPayload, FunctionId,
    HeartbeatPayload, JobId, Message, MessageKind, RegisterWorkerPayload, TaskAssignmentPayload,
    TaskErrorPayload, TaskId, TaskResultPayload, WorkerId, WorkerRegisteredPayload,
    WorkerStatusPayload,
};
