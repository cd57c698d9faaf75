//! Coordinator: dispatches `map` jobs as tasks across registered workers
//! over the wire protocol defined in `distcompute_protocol`.

pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod job;
pub mod session;
pub mod stats;
pub mod worker_table;

pub use coordinator::Coordinator;
pub use dispatch::{Dispatcher, DispatcherConfig};
pub use error::SessionError;
pub use job::JobError;
pub use stats::{DispatcherStats, WorkerStat};
