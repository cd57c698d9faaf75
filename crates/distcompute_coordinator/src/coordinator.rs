//! Top-level coordinator: binds the listener, accepts worker connections,
//! and runs the background sweeper and assignment loop alongside them.

use distcompute_protocol::config::SystemConfig;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::dispatch::{Dispatcher, DispatcherConfig};

/// A running coordinator. `map` is the entry point user code calls to
/// submit work; `stats` exposes the current worker table snapshot.
pub struct Coordinator {
    dispatcher: Dispatcher,
    config: SystemConfig,
}

impl Coordinator {
    /// Bind the listening socket and spawn the background tasks (the
    /// heartbeat sweeper and the assignment loop). Accepting connections
    /// happens in [`Coordinator::run`], so callers that only want `map`
    /// in-process without serving real worker TCP connections can skip it
    /// — though in practice every worker needs somewhere to connect to.
    pub async fn bind(config: SystemConfig) -> std::io::Result<(Self, TcpListener)> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        info!(addr = %config.bind_addr, "coordinator listening");

        let dispatcher = Dispatcher::new(DispatcherConfig {
            max_attempts_per_task: config.max_attempts_per_task,
        });

        Ok((
            Self {
                dispatcher,
                config,
            },
            listener,
        ))
    }

    pub fn dispatcher(&self) -> Dispatcher {
        self.dispatcher.clone()
    }

    /// Accept connections and run the sweeper/assignment loop forever.
    /// Spawns one task per accepted connection; never returns under normal
    /// operation.
    pub async fn run(self, listener: TcpListener) {
        let Coordinator { dispatcher, config } = self;

        tokio::spawn(dispatcher.clone().run_assignment_loop());

        let sweep_dispatcher = dispatcher.clone();
        let liveness_window = config.liveness_window;
        let sweep_interval = distcompute_protocol::defaults::DEFAULT_SWEEP_INTERVAL;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            loop {
                ticker.tick().await;
                sweep_dispatcher.sweep_dead_workers(liveness_window).await;
            }
        });

        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "accept failed");
                    continue;
                }
            };
            let dispatcher = dispatcher.clone();
            let shared_token = config.shared_token.clone();
            tokio::spawn(async move {
                crate::session::run_session(stream, peer_addr, dispatcher, shared_token).await;
            });
        }
    }
}
