//! Message grammar shared by coordinator and worker.
//!
//! `Message` is the closed set of wire-level message kinds from the
//! coordinator/worker protocol. The body of every framed unit (see
//! [`crate::framing`]) is a `bincode` encoding of one `Message` value.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Error returned when parsing a UUID-backed identifier fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {label}: {source}")]
pub struct IdParseError {
    label: &'static str,
    #[source]
    source: uuid::Error,
}

macro_rules! define_uuid_id {
    ($name:ident, $label:expr) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = IdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|source| IdParseError { label: $label, source })
            }
        }
    };
}

define_uuid_id!(WorkerId, "worker id");
define_uuid_id!(TaskId, "task id");
define_uuid_id!(JobId, "job id");

/// Identifies a registered function known to both coordinator and worker.
///
/// Rust has no stable equivalent of shipping a closure and its captured
/// environment across the wire, so `map` submits a function name from a
/// shared registry (see `distcompute_worker::registry`) instead of a
/// serialized callable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FunctionId(pub String);

impl FunctionId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for FunctionId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// A task argument or result value.
///
/// Stands in for "serialized argument"/"serialized result" in the wire
/// spec: a small closed set of value shapes wide enough to exercise
/// chunking (`IntVec`/`Bytes` can cross `MAX_CHUNK_SIZE`) without needing a
/// general-purpose object format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ArgValue {
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    IntVec(Vec<i64>),
}

impl ArgValue {
    /// Approximate encoded size, used only for test fixtures that need to
    /// cross the chunk/compression thresholds deliberately.
    pub fn approx_len(&self) -> usize {
        match self {
            ArgValue::Int(_) => 8,
            ArgValue::Float(_) => 8,
            ArgValue::Str(s) => s.len(),
            ArgValue::Bytes(b) => b.len(),
            ArgValue::IntVec(v) => v.len() * 8,
        }
    }
}

/// The closed set of message kinds (§6 of the protocol spec).
///
/// Carried alongside `CHUNK_START`/`CHUNK_END` payloads to identify the
/// kind of the message being reassembled, without re-encoding its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    RegisterWorker,
    WorkerRegistered,
    AuthFailed,
    Heartbeat,
    TaskAssignment,
    TaskResult,
    TaskError,
    WorkerStatus,
    Shutdown,
    SubmitJob,
    JobResult,
    JobError,
    ChunkStart,
    ChunkData,
    ChunkEnd,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterWorkerPayload {
    pub name: String,
    pub max_concurrent_tasks: u32,
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegisteredPayload {
    pub worker_id: WorkerId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthFailedPayload {
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub worker_id: WorkerId,
    pub in_flight: u32,
    pub completed_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssignmentPayload {
    pub task_id: TaskId,
    pub function: FunctionId,
    pub arg: ArgValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResultPayload {
    pub task_id: TaskId,
    pub value: ArgValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskErrorPayload {
    pub task_id: TaskId,
    pub error_message: String,
}

/// Optional diagnostic counters a worker may report; informational only.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WorkerStatusPayload {
    pub worker_id: WorkerId,
    pub counters: HashMap<String, i64>,
}

/// Reserved for a future remote job-submission client; no current code
/// path drives these (see `distcompute_coordinator::dispatch::Dispatcher::map`,
/// which is called in-process).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitJobPayload {
    pub job_id: JobId,
    pub function: FunctionId,
    pub inputs: Vec<ArgValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResultPayload {
    pub job_id: JobId,
    pub results: Vec<ArgValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobErrorPayload {
    pub job_id: JobId,
    pub index: usize,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkStartPayload {
    pub original_kind: MessageKind,
    pub total_size: u64,
    pub num_chunks: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkDataPayload {
    pub chunk_num: u32,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkEndPayload {
    pub original_kind: MessageKind,
}

/// A single logical message on the wire: `{kind, payload}`, immutable once
/// constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    RegisterWorker(RegisterWorkerPayload),
    WorkerRegistered(WorkerRegisteredPayload),
    AuthFailed(AuthFailedPayload),
    Heartbeat(HeartbeatPayload),
    TaskAssignment(TaskAssignmentPayload),
    TaskResult(TaskResultPayload),
    TaskError(TaskErrorPayload),
    WorkerStatus(WorkerStatusPayload),
    Shutdown,
    SubmitJob(SubmitJobPayload),
    JobResult(JobResultPayload),
    JobError(JobErrorPayload),
    ChunkStart(ChunkStartPayload),
    ChunkData(ChunkDataPayload),
    ChunkEnd(ChunkEndPayload),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::RegisterWorker(_) => MessageKind::RegisterWorker,
            Message::WorkerRegistered(_) => MessageKind::WorkerRegistered,
            Message::AuthFailed(_) => MessageKind::AuthFailed,
            Message::Heartbeat(_) => MessageKind::Heartbeat,
            Message::TaskAssignment(_) => MessageKind::TaskAssignment,
            Message::TaskResult(_) => MessageKind::TaskResult,
            Message::TaskError(_) => MessageKind::TaskError,
            Message::WorkerStatus(_) => MessageKind::WorkerStatus,
            Message::Shutdown => MessageKind::Shutdown,
            Message::SubmitJob(_) => MessageKind::SubmitJob,
            Message::JobResult(_) => MessageKind::JobResult,
            Message::JobError(_) => MessageKind::JobError,
            Message::ChunkStart(_) => MessageKind::ChunkStart,
            Message::ChunkData(_) => MessageKind::ChunkData,
            Message::ChunkEnd(_) => MessageKind::ChunkEnd,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_id_round_trips_through_display_and_parse() {
        let id = WorkerId::new();
        let parsed: WorkerId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn function_id_from_str() {
        let f = FunctionId::from("square");
        assert_eq!(f.as_str(), "square");
    }

    #[test]
    fn message_kind_matches_variant() {
        let msg = Message::Heartbeat(HeartbeatPayload {
            worker_id: WorkerId::new(),
            in_flight: 1,
            completed_count: 2,
        });
        assert_eq!(msg.kind(), MessageKind::Heartbeat);
    }
}
