//! Job and task bookkeeping owned by the dispatcher.

use distcompute_protocol::{ArgValue, FunctionId, JobId, TaskId, WorkerId};
use tokio::sync::oneshot;

/// A single `(function, argument)` unit, uniquely identified within its
/// job. At most one worker may hold a given `task_id` in
/// [`TaskState::Assigned`] at any moment.
#[derive(Debug, Clone)]
pub struct Task {
    pub task_id: TaskId,
    pub job_id: JobId,
    /// Position in the job's input vector; preserved for result ordering.
    pub index: usize,
    pub function: FunctionId,
    pub arg: ArgValue,
    pub state: TaskState,
    /// Number of times this task has been (re-)assigned. Used only against
    /// `DispatcherConfig::max_attempts_per_task` when that cap is set.
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Assigned(WorkerId),
}

/// A `map` call in flight. Destroyed (removed from the dispatcher's job
/// table) the moment every task reaches a terminal state, the job fails,
/// or it times out.
pub struct JobState {
    pub n: usize,
    pub results: Vec<Option<ArgValue>>,
    pub remaining: usize,
    pub completion: oneshot::Sender<JobOutcome>,
}

/// Terminal outcome of a job, delivered to the waiting `map` call.
pub enum JobOutcome {
    Success(Vec<ArgValue>),
    Failed { index: usize, message: String },
}

/// Errors `map` can raise, per §7 of the protocol spec: either a complete
/// ordered result vector, or exactly one of these.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobError {
    #[error("task {index} failed: {message}")]
    Failed { index: usize, message: String },

    #[error("job timed out with {completed} task(s) completed")]
    TimedOut { completed: usize },
}
