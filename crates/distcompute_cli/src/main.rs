//! Command-line entry point: run a coordinator, run a worker, or run an
//! in-process demo exercising both ends of the cluster.
//!
//! Mirrors the reference CLI's three modes (`coordinator`, `worker`,
//! `demo`) minus its terminal presentation (logo, animated progress,
//! ANSI color), which is out of scope here.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use distcompute_coordinator::Coordinator;
use distcompute_protocol::config::{SystemConfig, WorkerRuntimeConfig};
use distcompute_protocol::defaults::DEFAULT_COORDINATOR_PORT;
use distcompute_protocol::{ArgValue, FunctionId};
use distcompute_worker::{FunctionRegistry, WorkerClient};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "distcompute", about = "Distributed task-execution cluster")]
struct Cli {
    /// Enable verbose (info/debug) console logging.
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a coordinator, accepting worker connections and serving `map`.
    Coordinator {
        /// Address to bind the listener to.
        #[arg(long, default_value_t = format!("127.0.0.1:{DEFAULT_COORDINATOR_PORT}"))]
        bind: String,

        /// Shared token workers must present at registration.
        #[arg(long, env = "DISTCOMPUTE_TOKEN")]
        token: Option<String>,

        /// Per-task retry cap before a job is failed outright. Unlimited
        /// if unset.
        #[arg(long)]
        max_attempts: Option<u32>,
    },

    /// Run a worker, connecting to a coordinator and executing tasks.
    Worker {
        /// Coordinator address to connect to.
        #[arg(long, default_value_t = format!("127.0.0.1:{DEFAULT_COORDINATOR_PORT}"))]
        coordinator: String,

        /// Human-readable worker name. Defaults to a random identifier.
        #[arg(long)]
        name: Option<String>,

        /// Maximum number of tasks this worker runs concurrently.
        #[arg(long, default_value_t = 4)]
        max_concurrent_tasks: u32,

        /// Shared token presented at registration.
        #[arg(long, env = "DISTCOMPUTE_TOKEN")]
        token: Option<String>,
    },

    /// Spin up a coordinator and a handful of workers in-process and run a
    /// sample `map` over `square`.
    Demo {
        /// Number of in-process workers.
        #[arg(long, default_value_t = 3)]
        workers: u32,

        /// Number of inputs to map over.
        #[arg(long, default_value_t = 20)]
        inputs: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    distcompute_logging::init_logging(distcompute_logging::LogConfig {
        app_name: "distcompute",
        verbose: cli.verbose,
    })
    .context("failed to initialize logging")?;

    match cli.command {
        Commands::Coordinator {
            bind,
            token,
            max_attempts,
        } => run_coordinator(bind, token, max_attempts).await,
        Commands::Worker {
            coordinator,
            name,
            max_concurrent_tasks,
            token,
        } => run_worker(coordinator, name, max_concurrent_tasks, token).await,
        Commands::Demo { workers, inputs } => run_demo(workers, inputs).await,
    }
}

async fn run_coordinator(
    bind: String,
    token: Option<String>,
    max_attempts: Option<u32>,
) -> Result<()> {
    let config = SystemConfig {
        bind_addr: bind,
        shared_token: token,
        max_attempts_per_task: max_attempts,
        ..SystemConfig::default()
    };

    let (coordinator, listener) = Coordinator::bind(config)
        .await
        .context("failed to bind coordinator listener")?;
    coordinator.run(listener).await;
    Ok(())
}

async fn run_worker(
    coordinator_addr: String,
    name: Option<String>,
    max_concurrent_tasks: u32,
    token: Option<String>,
) -> Result<()> {
    let name = name.unwrap_or_else(random_worker_name);
    let mut config = WorkerRuntimeConfig::new(coordinator_addr, name);
    config.max_concurrent_tasks = max_concurrent_tasks;
    config.token = token;

    let registry = FunctionRegistry::with_builtins();
    let client = WorkerClient::new(config, registry);
    client.run().await
}

async fn run_demo(num_workers: u32, num_inputs: usize) -> Result<()> {
    let bind_addr = "127.0.0.1:0".to_string();
    let config = SystemConfig {
        bind_addr,
        ..SystemConfig::default()
    };
    let (coordinator, listener) = Coordinator::bind(config).await?;
    let addr = listener.local_addr()?;
    let dispatcher = coordinator.dispatcher();
    tokio::spawn(coordinator.run(listener));

    for i in 0..num_workers {
        let worker_config = WorkerRuntimeConfig::new(addr.to_string(), format!("demo-worker-{i}"));
        let registry = FunctionRegistry::with_builtins();
        let client = WorkerClient::new(worker_config, registry);
        tokio::spawn(async move {
            if let Err(e) = client.run().await {
                tracing::warn!(error = %e, "demo worker exited");
            }
        });
    }

    // Give workers a moment to connect and register before dispatching.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let inputs: Vec<ArgValue> = (0..num_inputs as i64).map(ArgValue::Int).collect();
    info!(n = num_inputs, "dispatching demo map over square()");
    let results = dispatcher
        .map(FunctionId::new("square"), inputs, Duration::from_secs(30))
        .await
        .map_err(|e| anyhow::anyhow!("demo map failed: {e}"))?;

    for (i, r) in results.iter().enumerate() {
        println!("{i}: {r:?}");
    }
    Ok(())
}

fn random_worker_name() -> String {
    use rand::Rng;
    let suffix: u32 = rand::thread_rng().gen_range(0..1_000_000);
    format!("worker-{suffix:06}")
}
