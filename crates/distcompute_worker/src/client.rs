//! Worker runtime: connects to a coordinator, registers, and services
//! assigned tasks until the connection drops or `stop()` is called.
//!
//! Design mirrors the reference worker's event loop shape (connect once,
//! loop on recv-with-timeout, dispatch by message kind) ported from a ZMQ
//! dealer socket onto a split `TcpStream`: a reader task drives
//! `handle_message`, a writer task drains an outbound channel, and a
//! heartbeat ticker fires independently of both.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use distcompute_protocol::config::WorkerRuntimeConfig;
use distcompute_protocol::{
    HeartbeatPayload, Message, RegisterWorkerPayload, TaskErrorPayload, TaskResultPayload,
};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::cancel::CancellationToken;
use crate::registry::FunctionRegistry;

const OUTBOUND_CHANNEL_CAPACITY: usize = 64;

/// A connected worker. `run` drives it to completion; `cancel_token` lets
/// an embedder request a clean shutdown from another task.
pub struct WorkerClient {
    config: WorkerRuntimeConfig,
    registry: FunctionRegistry,
    cancel_token: CancellationToken,
    in_flight: Arc<AtomicU32>,
    completed: Arc<AtomicU64>,
}

impl WorkerClient {
    pub fn new(config: WorkerRuntimeConfig, registry: FunctionRegistry) -> Self {
        Self {
            config,
            registry,
            cancel_token: CancellationToken::new(),
            in_flight: Arc::new(AtomicU32::new(0)),
            completed: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Connect, register, and service tasks until the coordinator closes
    /// the connection or `cancel_token().cancel()` is called.
    pub async fn run(self) -> Result<()> {
        let stream = TcpStream::connect(&self.config.coordinator_addr)
            .await
            .with_context(|| format!("connecting to {}", self.config.coordinator_addr))?;
        stream.set_nodelay(true).ok();
        info!(addr = %self.config.coordinator_addr, "connected to coordinator");

        let (mut read_half, mut write_half) = stream.into_split();

        distcompute_protocol::framing::send(
            &mut write_half,
            &Message::RegisterWorker(RegisterWorkerPayload {
                name: self.config.name.clone(),
                max_concurrent_tasks: self.config.max_concurrent_tasks,
                token: self.config.token.clone(),
            }),
            None,
        )
        .await
        .context("sending REGISTER_WORKER")?;

        let worker_id = match distcompute_protocol::framing::receive(&mut read_half)
            .await
            .context("awaiting WORKER_REGISTERED")?
        {
            Message::WorkerRegistered(p) => p.worker_id,
            Message::AuthFailed(p) => anyhow::bail!("registration rejected: {}", p.reason),
            other => anyhow::bail!("unexpected response to registration: {:?}", other.kind()),
        };
        info!(%worker_id, "registered with coordinator");

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(OUTBOUND_CHANNEL_CAPACITY);

        let writer_task = tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                if distcompute_protocol::framing::send(&mut write_half, &msg, None)
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        let heartbeat_task = {
            let outbound_tx = outbound_tx.clone();
            let interval = self.config.heartbeat_interval;
            let in_flight = self.in_flight.clone();
            let completed = self.completed.clone();
            let cancel_token = self.cancel_token.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    if cancel_token.is_cancelled() {
                        break;
                    }
                    let hb = Message::Heartbeat(HeartbeatPayload {
                        worker_id,
                        in_flight: in_flight.load(Ordering::Relaxed),
                        completed_count: completed.load(Ordering::Relaxed),
                    });
                    if outbound_tx.send(hb).await.is_err() {
                        break;
                    }
                }
            })
        };

        let registry = self.registry;
        let in_flight = self.in_flight;
        let completed = self.completed;
        let cancel_token = self.cancel_token;

        loop {
            if cancel_token.is_cancelled() {
                break;
            }
            match distcompute_protocol::framing::receive(&mut read_half).await {
                Ok(Message::TaskAssignment(assignment)) => {
                    in_flight.fetch_add(1, Ordering::Relaxed);
                    let registry = registry.clone();
                    let outbound_tx = outbound_tx.clone();
                    let in_flight = in_flight.clone();
                    let completed = completed.clone();
                    tokio::spawn(async move {
                        run_task(
                            assignment.task_id,
                            assignment.function,
                            assignment.arg,
                            registry,
                            outbound_tx,
                        )
                        .await;
                        in_flight.fetch_sub(1, Ordering::Relaxed);
                        completed.fetch_add(1, Ordering::Relaxed);
                    });
                }
                Ok(Message::Shutdown) => {
                    info!(%worker_id, "coordinator requested shutdown");
                    break;
                }
                Ok(other) => {
                    warn!(%worker_id, kind = ?other.kind(), "unexpected message from coordinator");
                }
                Err(e) => {
                    error!(%worker_id, error = %e, "connection to coordinator ended");
                    break;
                }
            }
        }

        drop(outbound_tx);
        heartbeat_task.abort();
        writer_task.abort();
        Ok(())
    }
}

/// Execute one task's registered function off the async runtime's worker
/// threads (registered functions may block, e.g. `sleep_ms`) and report
/// the outcome back to the coordinator.
async fn run_task(
    task_id: distcompute_protocol::TaskId,
    function: distcompute_protocol::FunctionId,
    arg: distcompute_protocol::ArgValue,
    registry: FunctionRegistry,
    outbound_tx: mpsc::Sender<Message>,
) {
    let outcome =
        tokio::task::spawn_blocking(move || registry.call(&function, arg)).await;

    let reply = match outcome {
        Ok(Ok(value)) => Message::TaskResult(TaskResultPayload { task_id, value }),
        Ok(Err(e)) => Message::TaskError(TaskErrorPayload {
            task_id,
            error_message: e.to_string(),
        }),
        Err(join_err) => Message::TaskError(TaskErrorPayload {
            task_id,
            error_message: format!("task panicked: {join_err}"),
        }),
    };

    if outbound_tx.send(reply).await.is_err() {
        warn!(%task_id, "outbound channel closed before result could be sent");
    }
}
