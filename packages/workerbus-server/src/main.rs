use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};
use workerbus_core::{Hub, HubConfig, Worker, WorkerConfig, DEFAULT_PORT};
use workerbus_server::{routes, AppState};

/// How long the worker gets to close its browser at shutdown
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(
    name = "workerbus",
    about = "Supervise a worker process and stream its job progress over WebSocket"
)]
struct Cli {
    /// Port to listen on
    #[arg(long, env = "PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Worker executable
    #[arg(long, env = "WORKER_PROGRAM", default_value = "python3")]
    worker_program: PathBuf,

    /// Argument passed to the worker (repeatable)
    #[arg(
        long = "worker-arg",
        allow_hyphen_values = true,
        default_values_t = [String::from("-m"), String::from("worker")]
    )]
    worker_args: Vec<String>,

    /// Working directory of the worker
    #[arg(long, env = "WORKER_DIR")]
    worker_dir: Option<PathBuf>,

    /// Seconds to wait for a disconnected owner before cleaning up its sessions
    #[arg(long, env = "GRACE_SECS", default_value_t = 25)]
    grace_secs: u64,

    /// Seconds a completed job suppresses repeated completions
    #[arg(long, env = "COMPLETION_WINDOW_SECS", default_value_t = 5)]
    completion_window_secs: u64,

    /// Log at debug level (overrides RUST_LOG)
    #[arg(long, short)]
    verbose: bool,
}

impl Cli {
    fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            program: self.worker_program.clone(),
            args: self.worker_args.clone(),
            working_dir: self.worker_dir.clone(),
            completion_window: Duration::from_secs(self.completion_window_secs),
            ..WorkerConfig::default()
        }
    }

    fn hub_config(&self) -> HubConfig {
        HubConfig {
            grace_period: Duration::from_secs(self.grace_secs),
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug,hyper=warn,tower_http=warn")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_filter(filter))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let hub = Hub::spawn(cli.hub_config());
    let worker = Worker::spawn(cli.worker_config(), Arc::new(hub.clone()));
    let state = Arc::new(AppState::new(worker.clone(), hub.clone()));

    let app = routes().with_state(state);

    let addr: SocketAddr = format!("{}:{}", cli.host, cli.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", cli.host, cli.port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    info!(
        %addr,
        worker = %cli.worker_program.display(),
        "workerbus server running"
    );

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("shutting down worker");
    if let Err(e) = worker.close(CLOSE_TIMEOUT).await {
        warn!("failed to close worker: {}", e);
    }
    worker.shutdown().await;
    hub.shutdown();
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
