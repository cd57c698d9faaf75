//! In-memory worker table.
//!
//! Owned exclusively by [`crate::dispatch::Dispatcher`]; mutated only with
//! the dispatcher's state mutex held. Not persisted — a coordinator
//! restart forgets every worker.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Instant;

use distcompute_protocol::{Message, TaskId, WorkerId};
use tokio::sync::mpsc;

/// Lifecycle state of a connected worker. `AWAITING_REGISTER` and
/// `AUTH_FAILED` never appear here: a session only inserts a
/// [`WorkerRecord`] into the table after registration succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Registered,
    Dead,
}

/// A connected worker, as seen by the dispatcher.
pub struct WorkerRecord {
    pub worker_id: WorkerId,
    pub name: String,
    pub endpoint: SocketAddr,
    pub max_concurrent_tasks: u32,
    pub in_flight: u32,
    pub completed: u64,
    pub last_heartbeat_at: Instant,
    pub state: WorkerState,
    pub assigned: HashSet<TaskId>,
    /// Monotonic registration order, used as the tie-break after
    /// least-in-flight in the assignment policy.
    pub registered_seq: u64,
    /// Channel to the session's writer half. A session owns the only
    /// task allowed to write its socket; the dispatcher hands it
    /// messages to forward rather than touching the socket itself.
    pub outbound: mpsc::Sender<Message>,
}

impl WorkerRecord {
    pub fn has_free_slot(&self) -> bool {
        self.state == WorkerState::Registered && self.in_flight < self.max_concurrent_tasks
    }
}
