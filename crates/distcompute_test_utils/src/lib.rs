//! In-process coordinator+worker spin-up for integration tests.
//!
//! Binds a real coordinator to an ephemeral loopback port and runs real
//! workers against it over real TCP, so tests exercise the full wire
//! protocol rather than calling dispatcher methods directly.

use std::net::SocketAddr;

use anyhow::Result;
use distcompute_coordinator::{Coordinator, Dispatcher};
use distcompute_protocol::config::{SystemConfig, WorkerRuntimeConfig};
use distcompute_worker::{CancellationToken, FunctionRegistry, WorkerClient};

/// A running coordinator plus a fixed pool of workers, all in-process.
pub struct TestCluster {
    pub dispatcher: Dispatcher,
    pub addr: SocketAddr,
    workers: Vec<WorkerHandle>,
}

struct WorkerHandle {
    cancel_token: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl TestCluster {
    /// Kill worker `index` by cancelling its client loop and dropping its
    /// connection, so the coordinator's heartbeat sweeper (or the next
    /// read error) declares it dead and requeues its in-flight tasks.
    pub async fn kill_worker(&mut self, index: usize) {
        let handle = &self.workers[index];
        handle.cancel_token.cancel();
        handle.task.abort();
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

/// Spin up a coordinator and `num_workers` workers, each allowed
/// `max_concurrent_tasks` tasks in flight, all bound to loopback.
pub async fn spawn_test_cluster(
    num_workers: usize,
    max_concurrent_tasks: u32,
) -> Result<TestCluster> {
    spawn_test_cluster_with_config(num_workers, max_concurrent_tasks, SystemConfig::default()).await
}

/// Like [`spawn_test_cluster`], but with caller-supplied coordinator
/// tunables (shared token, retry cap, heartbeat windows).
pub async fn spawn_test_cluster_with_config(
    num_workers: usize,
    max_concurrent_tasks: u32,
    mut config: SystemConfig,
) -> Result<TestCluster> {
    config.bind_addr = "127.0.0.1:0".to_string();
    let (coordinator, listener) = Coordinator::bind(config.clone()).await?;
    let addr = listener.local_addr()?;
    let dispatcher = coordinator.dispatcher();
    tokio::spawn(coordinator.run(listener));

    let mut workers = Vec::with_capacity(num_workers);
    for i in 0..num_workers {
        let mut worker_config =
            WorkerRuntimeConfig::new(addr.to_string(), format!("test-worker-{i}"));
        worker_config.max_concurrent_tasks = max_concurrent_tasks;
        worker_config.token = config.shared_token.clone();

        let registry = FunctionRegistry::with_builtins();
        let client = WorkerClient::new(worker_config, registry);
        let cancel_token = client.cancel_token();
        let task = tokio::spawn(async move {
            let _ = client.run().await;
        });
        workers.push(WorkerHandle { cancel_token, task });
    }

    // Let workers complete a registration round-trip before callers
    // submit work.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    Ok(TestCluster {
        dispatcher,
        addr,
        workers,
    })
}
