//! The dispatch engine: job decomposition, task assignment, re-queueing,
//! and ordered result collection across an unreliable worker pool.
//!
//! A single [`tokio::sync::Mutex`]-guarded [`DispatcherState`] holds the
//! pending queue, the worker table, and every task's state, exactly as
//! specified — generalized from the teacher's single-owner `Sentinel`
//! struct into message-passing: sessions and the heartbeat sweeper call
//! `Dispatcher` methods instead of touching the tables directly. A
//! [`tokio::sync::Notify`] wakes the assignment loop on task push, slot
//! free, and worker registration. The mutex is never held across a socket
//! operation: the assignment loop computes what to send while holding the
//! lock, releases it, then forwards to each worker's outbound channel.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use distcompute_protocol::{
    ArgValue, FunctionId, JobId, Message, TaskAssignmentPayload, TaskId, WorkerId,
};
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tracing::{info, warn};

use crate::job::{JobError, JobOutcome, JobState, Task, TaskState};
use crate::stats::{DispatcherStats, WorkerStat};
use crate::worker_table::{WorkerRecord, WorkerState};

/// Tunables that affect dispatch policy (as opposed to wire-level
/// settings, which live in `distcompute_protocol::config::SystemConfig`).
#[derive(Debug, Clone, Default)]
pub struct DispatcherConfig {
    /// Per-task retry cap. `None` (the default) means unlimited, per the
    /// spec's open question 3.
    pub max_attempts_per_task: Option<u32>,
}

struct DispatcherState {
    workers: HashMap<WorkerId, WorkerRecord>,
    tasks: HashMap<TaskId, Task>,
    pending: VecDeque<TaskId>,
    jobs: HashMap<JobId, JobState>,
    tasks_completed_total: u64,
    next_registered_seq: u64,
}

impl DispatcherState {
    fn new() -> Self {
        Self {
            workers: HashMap::new(),
            tasks: HashMap::new(),
            pending: VecDeque::new(),
            jobs: HashMap::new(),
            tasks_completed_total: 0,
            next_registered_seq: 0,
        }
    }

    /// Select the best eligible worker for the next pending task:
    /// least-in-flight first, then earliest-registered.
    fn pick_worker(&self) -> Option<WorkerId> {
        let mut best: Option<WorkerId> = None;
        for (id, w) in self.workers.iter() {
            if !w.has_free_slot() {
                continue;
            }
            best = Some(match best {
                None => *id,
                Some(cur) => {
                    let cur_w = &self.workers[&cur];
                    let better = w.in_flight < cur_w.in_flight
                        || (w.in_flight == cur_w.in_flight
                            && w.registered_seq < cur_w.registered_seq);
                    if better {
                        *id
                    } else {
                        cur
                    }
                }
            });
        }
        best
    }

    /// Work-conserving assignment pass: assign pending tasks to idle slots
    /// until either the queue is empty or no worker has a free slot.
    /// Returns the sends that must happen once the lock is released.
    fn compute_assignments(&mut self) -> Vec<(mpsc::Sender<Message>, Message)> {
        let mut sends = Vec::new();
        loop {
            if self.pending.is_empty() {
                break;
            }
            let Some(worker_id) = self.pick_worker() else {
                break;
            };
            let task_id = self.pending.pop_front().expect("checked non-empty above");
            let Some(task) = self.tasks.get_mut(&task_id) else {
                // Task was discarded (job failed/timed out) while still queued.
                continue;
            };
            task.state = TaskState::Assigned(worker_id);
            let function = task.function.clone();
            let arg = task.arg.clone();

            let worker = self
                .workers
                .get_mut(&worker_id)
                .expect("worker existed a moment ago under the same lock");
            worker.assigned.insert(task_id);
            worker.in_flight += 1;

            sends.push((
                worker.outbound.clone(),
                Message::TaskAssignment(TaskAssignmentPayload {
                    task_id,
                    function,
                    arg,
                }),
            ));
        }
        sends
    }

    fn handle_task_result(&mut self, worker_id: WorkerId, task_id: TaskId, value: ArgValue) {
        let Some(worker) = self.workers.get_mut(&worker_id) else {
            return;
        };
        if !worker.assigned.remove(&task_id) {
            return; // stale: not assigned to this worker
        }
        worker.in_flight = worker.in_flight.saturating_sub(1);

        let Some(task) = self.tasks.remove(&task_id) else {
            return;
        };

        let Some(job) = self.jobs.get_mut(&task.job_id) else {
            return; // job already gone (failed/timed out); drop the late result, uncounted
        };

        if let Some(worker) = self.workers.get_mut(&worker_id) {
            worker.completed += 1;
        }
        self.tasks_completed_total += 1;

        job.results[task.index] = Some(value);
        job.remaining -= 1;
        if job.remaining == 0 {
            if let Some(job) = self.jobs.remove(&task.job_id) {
                let results = job
                    .results
                    .into_iter()
                    .map(|slot| slot.expect("every hole was filled before remaining hit 0"))
                    .collect();
                let _ = job.completion.send(JobOutcome::Success(results));
            }
        }
    }

    fn handle_task_error(&mut self, worker_id: WorkerId, task_id: TaskId, message: String) {
        let Some(worker) = self.workers.get_mut(&worker_id) else {
            return;
        };
        if !worker.assigned.remove(&task_id) {
            return; // stale
        }
        worker.in_flight = worker.in_flight.saturating_sub(1);

        let Some(task) = self.tasks.get(&task_id) else {
            return;
        };
        let (job_id, index) = (task.job_id, task.index);
        self.fail_job(job_id, index, message);
    }

    /// Job-fatal failure: discard every other task belonging to `job_id`
    /// (pending or still assigned elsewhere), release the slots they held,
    /// and wake the waiting `map` call with `JobOutcome::Failed`.
    fn fail_job(&mut self, job_id: JobId, index: usize, message: String) {
        let Some(job) = self.jobs.remove(&job_id) else {
            return; // already failed/timed out
        };

        let doomed: HashSet<TaskId> = self
            .tasks
            .iter()
            .filter(|(_, t)| t.job_id == job_id)
            .map(|(id, _)| *id)
            .collect();

        self.pending.retain(|tid| !doomed.contains(tid));

        for w in self.workers.values_mut() {
            let before = w.assigned.len();
            w.assigned.retain(|tid| !doomed.contains(tid));
            let removed = before - w.assigned.len();
            w.in_flight = w.in_flight.saturating_sub(removed as u32);
        }

        for tid in doomed {
            self.tasks.remove(&tid);
        }

        let _ = job.completion.send(JobOutcome::Failed { index, message });
    }

    /// Remove `job_id` (if still live) and report how many of its tasks
    /// had already completed. Called when a `map` deadline elapses.
    fn discard_timed_out_job(&mut self, job_id: JobId) -> Option<usize> {
        let job = self.jobs.remove(&job_id)?;
        let completed = job.n - job.remaining;

        let doomed: HashSet<TaskId> = self
            .tasks
            .iter()
            .filter(|(_, t)| t.job_id == job_id)
            .map(|(id, _)| *id)
            .collect();

        self.pending.retain(|tid| !doomed.contains(tid));
        for w in self.workers.values_mut() {
            let before = w.assigned.len();
            w.assigned.retain(|tid| !doomed.contains(tid));
            let removed = before - w.assigned.len();
            w.in_flight = w.in_flight.saturating_sub(removed as u32);
        }
        for tid in doomed {
            self.tasks.remove(&tid);
        }

        Some(completed)
    }

    /// Move every task assigned to `worker_id` back to the front of the
    /// pending queue (highest original index first, so the final queue
    /// order is ascending by index), dropping the worker from the table.
    fn requeue_dead_worker(&mut self, worker_id: WorkerId, config: &DispatcherConfig) {
        let Some(mut worker) = self.workers.remove(&worker_id) else {
            return;
        };
        worker.state = WorkerState::Dead;

        let mut requeued: Vec<TaskId> = worker.assigned.iter().copied().collect();
        requeued.sort_by_key(|tid| self.tasks.get(tid).map(|t| t.index).unwrap_or(usize::MAX));

        for tid in requeued.into_iter().rev() {
            if !self.tasks.contains_key(&tid) {
                continue; // a sibling task's fail_job already discarded it
            }

            let mut exceeded = None;
            if let Some(task) = self.tasks.get_mut(&tid) {
                task.state = TaskState::Pending;
                task.attempts += 1;
                if let Some(limit) = config.max_attempts_per_task {
                    if task.attempts >= limit {
                        exceeded = Some((task.job_id, task.index));
                    }
                }
            }

            match exceeded {
                Some((job_id, index)) => {
                    self.fail_job(job_id, index, "max attempts exceeded".to_string())
                }
                None => self.pending.push_front(tid),
            }
        }
    }

    fn snapshot_stats(&self) -> DispatcherStats {
        DispatcherStats {
            registered_workers: self.workers.len(),
            tasks_completed_total: self.tasks_completed_total,
            workers: self
                .workers
                .values()
                .map(|w| WorkerStat {
                    name: w.name.clone(),
                    in_flight: w.in_flight,
                    completed: w.completed,
                })
                .collect(),
        }
    }
}

struct DispatcherInner {
    state: Mutex<DispatcherState>,
    notify: Notify,
    config: DispatcherConfig,
}

/// Handle to the dispatch engine. Cheaply `Clone`-able (an `Arc` under the
/// hood); every session and the heartbeat sweeper hold one.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                state: Mutex::new(DispatcherState::new()),
                notify: Notify::new(),
                config,
            }),
        }
    }

    /// Register a newly-authenticated worker and return its fresh id.
    pub async fn register_worker(
        &self,
        name: String,
        endpoint: SocketAddr,
        max_concurrent_tasks: u32,
        outbound: mpsc::Sender<Message>,
    ) -> WorkerId {
        let worker_id = WorkerId::new();
        let mut state = self.inner.state.lock().await;
        let seq = state.next_registered_seq;
        state.next_registered_seq += 1;
        state.workers.insert(
            worker_id,
            WorkerRecord {
                worker_id,
                name,
                endpoint,
                max_concurrent_tasks,
                in_flight: 0,
                completed: 0,
                last_heartbeat_at: Instant::now(),
                state: WorkerState::Registered,
                assigned: HashSet::new(),
                registered_seq: seq,
                outbound,
            },
        );
        drop(state);
        self.inner.notify.notify_waiters();
        worker_id
    }

    pub async fn heartbeat(&self, worker_id: WorkerId, _in_flight: u32, _completed_count: u64) {
        let mut state = self.inner.state.lock().await;
        if let Some(w) = state.workers.get_mut(&worker_id) {
            w.last_heartbeat_at = Instant::now();
        }
    }

    pub async fn task_result(&self, worker_id: WorkerId, task_id: TaskId, value: ArgValue) {
        let mut state = self.inner.state.lock().await;
        state.handle_task_result(worker_id, task_id, value);
        drop(state);
        self.inner.notify.notify_waiters();
    }

    pub async fn task_error(&self, worker_id: WorkerId, task_id: TaskId, message: String) {
        let mut state = self.inner.state.lock().await;
        state.handle_task_error(worker_id, task_id, message);
        drop(state);
        self.inner.notify.notify_waiters();
    }

    /// Declare a worker dead (heartbeat timeout, or its session ended) and
    /// requeue its in-flight tasks. Idempotent.
    pub async fn worker_dead(&self, worker_id: WorkerId) {
        let mut state = self.inner.state.lock().await;
        let had_work = state
            .workers
            .get(&worker_id)
            .map(|w| !w.assigned.is_empty())
            .unwrap_or(false);
        state.requeue_dead_worker(worker_id, &self.inner.config);
        drop(state);
        if had_work {
            info!(%worker_id, "requeued tasks from dead worker");
        }
        self.inner.notify.notify_waiters();
    }

    /// Scan the worker table and declare dead any worker whose last
    /// heartbeat is older than `liveness_window`.
    pub async fn sweep_dead_workers(&self, liveness_window: Duration) {
        let stale: Vec<WorkerId> = {
            let state = self.inner.state.lock().await;
            let now = Instant::now();
            state
                .workers
                .values()
                .filter(|w| now.duration_since(w.last_heartbeat_at) > liveness_window)
                .map(|w| w.worker_id)
                .collect()
        };
        for worker_id in stale {
            warn!(%worker_id, "worker missed its heartbeat window");
            self.worker_dead(worker_id).await;
        }
    }

    pub async fn stats(&self) -> DispatcherStats {
        self.inner.state.lock().await.snapshot_stats()
    }

    /// Decompose `inputs` into indexed tasks, push them to the pending
    /// queue, and block until every task reaches a terminal state or
    /// `timeout` elapses.
    pub async fn map(
        &self,
        function: FunctionId,
        inputs: Vec<ArgValue>,
        timeout: Duration,
    ) -> Result<Vec<ArgValue>, JobError> {
        if inputs.is_empty() {
            // No tasks means no TASK_RESULT will ever arrive to drive the
            // remaining-count-reaches-zero completion path below.
            return Ok(Vec::new());
        }

        let job_id = JobId::new();
        let n = inputs.len();
        let (tx, rx) = oneshot::channel();

        {
            let mut state = self.inner.state.lock().await;
            state.jobs.insert(
                job_id,
                JobState {
                    n,
                    results: vec![None; n],
                    remaining: n,
                    completion: tx,
                },
            );
            for (index, arg) in inputs.into_iter().enumerate() {
                let task_id = TaskId::new();
                state.tasks.insert(
                    task_id,
                    Task {
                        task_id,
                        job_id,
                        index,
                        function: function.clone(),
                        arg,
                        state: TaskState::Pending,
                        attempts: 0,
                    },
                );
                state.pending.push_back(task_id);
            }
        }
        self.inner.notify.notify_waiters();

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(JobOutcome::Success(results))) => Ok(results),
            Ok(Ok(JobOutcome::Failed { index, message })) => {
                Err(JobError::Failed { index, message })
            }
            Ok(Err(_)) => Err(JobError::Failed {
                index: 0,
                message: "dispatcher dropped the job before it completed".to_string(),
            }),
            Err(_elapsed) => {
                let completed = {
                    let mut state = self.inner.state.lock().await;
                    state.discard_timed_out_job(job_id).unwrap_or(n)
                };
                Err(JobError::TimedOut { completed })
            }
        }
    }

    /// Runs forever, assigning pending tasks to idle worker slots whenever
    /// woken. Spawned once by the coordinator's acceptor loop.
    pub async fn run_assignment_loop(self) {
        loop {
            // Registered before computing assignments (and before the lock
            // is even taken) so a `notify_waiters()` fired by a concurrent
            // `task_result`/`worker_dead`/`register_worker` call in the
            // window between releasing the lock below and awaiting this
            // future is still observed, rather than lost.
            let notified = self.inner.notify.notified();

            let sends = {
                let mut state = self.inner.state.lock().await;
                state.compute_assignments()
            };

            if sends.is_empty() {
                notified.await;
                continue;
            }

            for (sender, msg) in sends {
                if sender.send(msg).await.is_err() {
                    // The session's writer task is gone; its reader loop
                    // will notice the closed socket and call worker_dead.
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn loopback() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
    }

    async fn register(dispatcher: &Dispatcher, slots: u32) -> (WorkerId, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(16);
        let worker_id = dispatcher
            .register_worker(format!("w-{}", rand_seed()), loopback(), slots, tx)
            .await;
        (worker_id, rx)
    }

    // Deterministic-enough disambiguator without depending on a RNG crate
    // in the test module; only needs to vary per call within one test.
    fn rand_seed() -> u64 {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        COUNTER.fetch_add(1, Ordering::Relaxed)
    }

    #[tokio::test]
    async fn map_with_empty_inputs_completes_immediately_with_no_results() {
        let dispatcher = Dispatcher::new(DispatcherConfig::default());
        let result = dispatcher
            .map(FunctionId::new("identity"), Vec::new(), Duration::from_millis(50))
            .await;
        assert_eq!(result.unwrap(), Vec::<ArgValue>::new());
    }

    #[tokio::test]
    async fn at_most_one_worker_holds_a_given_task() {
        let dispatcher = Dispatcher::new(DispatcherConfig::default());
        let (_id_a, mut rx_a) = register(&dispatcher, 1).await;
        let (_id_b, mut rx_b) = register(&dispatcher, 1).await;

        tokio::spawn(dispatcher.clone().run_assignment_loop());

        let inputs = vec![ArgValue::Int(1), ArgValue::Int(2)];
        let dispatcher2 = dispatcher.clone();
        let map_task = tokio::spawn(async move {
            dispatcher2
                .map(FunctionId::new("identity"), inputs, Duration::from_secs(5))
                .await
        });

        let assignment_a = rx_a.recv().await.expect("worker a should get a task");
        let assignment_b = rx_b.recv().await.expect("worker b should get a task");

        let task_id_a = match assignment_a {
            Message::TaskAssignment(p) => p.task_id,
            other => panic!("unexpected message: {other:?}"),
        };
        let task_id_b = match assignment_b {
            Message::TaskAssignment(p) => p.task_id,
            other => panic!("unexpected message: {other:?}"),
        };
        assert_ne!(task_id_a, task_id_b, "the two tasks must not alias");

        dispatcher.task_result(_id_a, task_id_a, ArgValue::Int(1)).await;
        dispatcher.task_result(_id_b, task_id_b, ArgValue::Int(2)).await;

        let result = map_task.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn single_slot_worker_serializes_pending_tasks_to_completion() {
        // A single worker with exactly one slot and three pending tasks:
        // the assignment loop must pick the next pending task back up every
        // time the slot frees, even though each free-up and the next
        // `compute_assignments()` pass race against each other. This is a
        // regression test for a lost-wakeup window between releasing the
        // dispatcher lock and registering interest in the next `Notify`.
        let dispatcher = Dispatcher::new(DispatcherConfig::default());
        let (worker_id, mut rx) = register(&dispatcher, 1).await;

        tokio::spawn(dispatcher.clone().run_assignment_loop());

        let inputs: Vec<ArgValue> = (0..3).map(ArgValue::Int).collect();
        let dispatcher2 = dispatcher.clone();
        let map_task = tokio::spawn(async move {
            dispatcher2
                .map(FunctionId::new("identity"), inputs, Duration::from_secs(5))
                .await
        });

        for _ in 0..3 {
            let assignment = recv_assignment(&mut rx).await;
            dispatcher
                .task_result(worker_id, assignment.task_id, assignment.arg.clone())
                .await;
        }

        let result = map_task.await.unwrap().unwrap();
        assert_eq!(result, vec![ArgValue::Int(0), ArgValue::Int(1), ArgValue::Int(2)]);
    }

    #[tokio::test]
    async fn work_conserving_assignment_prefers_least_in_flight() {
        let dispatcher = Dispatcher::new(DispatcherConfig::default());
        let (id_busy, _rx_busy) = register(&dispatcher, 2).await;
        let (id_idle, mut rx_idle) = register(&dispatcher, 2).await;

        // Saturate the first worker's slots with a task each so the
        // assignment loop has to prefer the idle one.
        {
            let mut state = dispatcher.inner.state.lock().await;
            let worker = state.workers.get_mut(&id_busy).unwrap();
            worker.in_flight = 2;
        }

        tokio::spawn(dispatcher.clone().run_assignment_loop());

        let dispatcher2 = dispatcher.clone();
        let map_task = tokio::spawn(async move {
            dispatcher2
                .map(FunctionId::new("identity"), vec![ArgValue::Int(7)], Duration::from_secs(5))
                .await
        });

        let assignment = rx_idle.recv().await.expect("idle worker should get the task");
        let task_id = match assignment {
            Message::TaskAssignment(p) => p.task_id,
            other => panic!("unexpected message: {other:?}"),
        };
        dispatcher.task_result(id_idle, task_id, ArgValue::Int(49)).await;

        let result = map_task.await.unwrap().unwrap();
        assert_eq!(result, vec![ArgValue::Int(49)]);
    }

    #[tokio::test]
    async fn worker_death_requeues_in_flight_tasks_and_job_still_completes() {
        let dispatcher = Dispatcher::new(DispatcherConfig::default());
        // Registered first, so ties in the assignment policy favor it —
        // this pins which worker ends up with which tasks below.
        let (worker_a, mut rx_a) = register(&dispatcher, 4).await;
        let (worker_b, mut rx_b) = register(&dispatcher, 4).await;

        tokio::spawn(dispatcher.clone().run_assignment_loop());

        let inputs: Vec<ArgValue> = (0..4).map(ArgValue::Int).collect();
        let dispatcher2 = dispatcher.clone();
        let map_task = tokio::spawn(async move {
            dispatcher2
                .map(FunctionId::new("identity"), inputs, Duration::from_secs(5))
                .await
        });

        // Least-in-flight-then-earliest-registered hands worker_a indices
        // 0 and 2, worker_b indices 1 and 3.
        let _a0 = recv_assignment(&mut rx_a).await;
        let b0 = recv_assignment(&mut rx_b).await;
        let _a1 = recv_assignment(&mut rx_a).await;
        let b1 = recv_assignment(&mut rx_b).await;

        dispatcher
            .task_result(worker_b, b0.task_id, b0.arg.clone())
            .await;
        dispatcher
            .task_result(worker_b, b1.task_id, b1.arg.clone())
            .await;

        // worker_a dies holding a0 and a1; both must be requeued and
        // reassigned (to worker_b, the only survivor) for the job to
        // complete at all.
        dispatcher.worker_dead(worker_a).await;

        let requeued_1 = recv_assignment(&mut rx_b).await;
        let requeued_2 = recv_assignment(&mut rx_b).await;
        dispatcher
            .task_result(worker_b, requeued_1.task_id, requeued_1.arg.clone())
            .await;
        dispatcher
            .task_result(worker_b, requeued_2.task_id, requeued_2.arg.clone())
            .await;

        let result = map_task.await.unwrap().unwrap();
        assert_eq!(
            result,
            vec![ArgValue::Int(0), ArgValue::Int(1), ArgValue::Int(2), ArgValue::Int(3)]
        );
    }

    async fn recv_assignment(rx: &mut mpsc::Receiver<Message>) -> TaskAssignmentPayload {
        match rx.recv().await.expect("channel closed before an assignment arrived") {
            Message::TaskAssignment(p) => p,
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
