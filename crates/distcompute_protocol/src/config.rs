//! System configuration shared by the coordinator and worker binaries.

use std::time::Duration;

use crate::defaults;

/// Coordinator-side tunables. Constructed by the CLI from flags/env vars,
/// then handed to the dispatcher and acceptor loop.
#[derive(Debug, Clone)]
pub struct SystemConfig {
    /// Address the coordinator's TCP listener binds to.
    pub bind_addr: String,
    /// Optional shared token workers must present at registration.
    pub shared_token: Option<String>,
    /// How often workers are expected to heartbeat.
    pub heartbeat_interval: Duration,
    /// How long without a heartbeat before a worker is declared dead.
    pub liveness_window: Duration,
    /// Per-task retry cap; `None` means unlimited (the spec's default).
    pub max_attempts_per_task: Option<u32>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("127.0.0.1:{}", defaults::DEFAULT_COORDINATOR_PORT),
            shared_token: None,
            heartbeat_interval: defaults::DEFAULT_HEARTBEAT_INTERVAL,
            liveness_window: defaults::DEFAULT_HEARTBEAT_INTERVAL
                * defaults::DEFAULT_LIVENESS_MULTIPLIER,
            max_attempts_per_task: None,
        }
    }
}

/// Worker-side tunables.
#[derive(Debug, Clone)]
pub struct WorkerRuntimeConfig {
    pub coordinator_addr: String,
    pub name: String,
    pub max_concurrent_tasks: u32,
    pub token: Option<String>,
    pub heartbeat_interval: Duration,
}

impl WorkerRuntimeConfig {
    pub fn new(coordinator_addr: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            coordinator_addr: coordinator_addr.into(),
            name: name.into(),
            max_concurrent_tasks: 2,
            token: None,
            heartbeat_interval: defaults::DEFAULT_HEARTBEAT_INTERVAL,
        }
    }
}
