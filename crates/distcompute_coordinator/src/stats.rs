//! Dispatcher statistics snapshot.

/// Per-worker counters. Exact, not an approximated even distribution —
/// see `DESIGN.md` for why this departs from the original prototype.
#[derive(Debug, Clone)]
pub struct WorkerStat {
    pub name: String,
    pub in_flight: u32,
    pub completed: u64,
}

#[derive(Debug, Clone)]
pub struct DispatcherStats {
    pub registered_workers: usize,
    pub tasks_completed_total: u64,
    pub workers: Vec<WorkerStat>,
}
