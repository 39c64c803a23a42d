//! VitalStream - live medical telemetry server
//!
//! Accepts device streams over WebSocket, keeps a rolling window of recent
//! readings per patient and records trial sessions into durable records.
//!
//! # Usage
//!
//! ```bash
//! # Run with defaults (0.0.0.0:8080, ./data/vitalstream)
//! cargo run --release
//!
//! # Custom bind address and data directory
//! ./vitalstream --addr 127.0.0.1:9000 --data-dir /var/lib/vitalstream
//!
//! # Stream a simulated device at it
//! ./device-simulator --patient-id 42
//! ```
//!
//! # Environment Variables
//!
//! - `VITALSTREAM_CONFIG`: Path to a TOML config file
//! - `VITALSTREAM_ADDR`: Server bind address
//! - `VITALSTREAM_CORS_ORIGINS`: Comma-separated allowed CORS origins
//! - `RUST_LOG`: Logging level (default: info)
//! - `RESET_DB`: Set to "true" to wipe all persistent data on startup (for testing)

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use axum::Router;
use vitalstream::api::{create_app, ApiState};
use vitalstream::background::BufferSweeper;
use vitalstream::config::ServiceConfig;
use vitalstream::service::TelemetryService;

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "vitalstream")]
#[command(about = "VitalStream live telemetry and trial recording server")]
#[command(version)]
struct CliArgs {
    /// Override the server address (default: "0.0.0.0:8080")
    #[arg(short, long, env = "VITALSTREAM_ADDR")]
    addr: Option<String>,

    /// Path to a TOML config file (overrides VITALSTREAM_CONFIG and ./vitalstream.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the sled data directory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Reset all persistent data (trials, logs, records) on startup.
    /// WARNING: This is destructive and cannot be undone!
    /// Can also be set via RESET_DB=true environment variable.
    #[arg(long)]
    reset_db: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

/// Check if database reset is requested via CLI flag or environment variable.
fn should_reset_db(cli_flag: bool) -> bool {
    if cli_flag {
        return true;
    }
    if let Ok(val) = std::env::var("RESET_DB") {
        let val_lower = val.to_lowercase();
        return val_lower == "true" || val_lower == "1" || val_lower == "yes";
    }
    false
}

/// Remove the sled directory so the service starts with an empty store.
fn reset_data_directory(data_path: &Path) -> Result<()> {
    if !data_path.exists() {
        info!(path = %data_path.display(), "No trial store to reset");
        return Ok(());
    }

    warn!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    warn!("  RESET_DB: deleting trials, trial logs and finalized records");
    warn!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    warn!(path = %data_path.display(), "Removing trial store");

    std::fs::remove_dir_all(data_path).context("Failed to remove data directory")?;

    warn!("  Data directory removed. A fresh database will be created on startup.");
    Ok(())
}

fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

fn load_config(args: &CliArgs) -> Result<ServiceConfig> {
    let mut config = match &args.config {
        Some(path) => ServiceConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => ServiceConfig::load(),
    };

    if let Some(addr) = &args.addr {
        config.server.addr.clone_from(addr);
    }
    if let Some(dir) = &args.data_dir {
        config.storage.data_dir.clone_from(dir);
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

// ============================================================================
// Task Names for Supervisor Logging
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum TaskName {
    HttpServer,
    BufferSweeper,
}

impl std::fmt::Display for TaskName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskName::HttpServer => write!(f, "HttpServer"),
            TaskName::BufferSweeper => write!(f, "BufferSweeper"),
        }
    }
}

// ============================================================================
// Task Spawning
// ============================================================================

/// Spawn the HTTP server task into the JoinSet.
fn spawn_http_server(
    task_set: &mut JoinSet<Result<TaskName>>,
    listener: tokio::net::TcpListener,
    app: Router,
    cancel_token: CancellationToken,
) {
    task_set.spawn(async move {
        info!("[HttpServer] Task starting");

        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                cancel_token.cancelled().await;
                info!("[HttpServer] Received shutdown signal");
            })
            .await;

        match result {
            Ok(()) => {
                info!("[HttpServer] Graceful shutdown complete");
                Ok(TaskName::HttpServer)
            }
            Err(e) => {
                error!("[HttpServer] Server error: {}", e);
                Err(anyhow::anyhow!("HTTP server error: {}", e))
            }
        }
    });
}

/// Spawn the rolling buffer expiry sweeper.
fn spawn_buffer_sweeper(
    task_set: &mut JoinSet<Result<TaskName>>,
    service: &TelemetryService,
    cancel_token: CancellationToken,
) {
    let rb = &service.config().rolling_buffer;
    let sweeper = BufferSweeper::new(
        Arc::clone(service.buffer()),
        rb.max_age(),
        rb.cleanup_interval(),
    );
    task_set.spawn(async move {
        sweeper.run(cancel_token).await;
        Ok(TaskName::BufferSweeper)
    });
}

// ============================================================================
// Supervisor
// ============================================================================

async fn run_supervisor(
    task_set: &mut JoinSet<Result<TaskName>>,
    cancel_token: CancellationToken,
) -> Result<()> {
    info!("Supervisor: All tasks spawned, monitoring...");

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                info!("Supervisor: Shutdown signal received");
                break;
            }
            result = task_set.join_next() => {
                match result {
                    Some(Ok(Ok(task_name))) => {
                        info!("Supervisor: Task {} completed normally", task_name);
                    }
                    Some(Ok(Err(e))) => {
                        error!("Supervisor: Task failed with error: {}", e);
                        cancel_token.cancel();
                        return Err(e);
                    }
                    Some(Err(e)) => {
                        error!("Supervisor: Task panicked: {}", e);
                        cancel_token.cancel();
                        return Err(anyhow::anyhow!("Task panicked: {}", e));
                    }
                    None => {
                        info!("Supervisor: All tasks completed");
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}

/// Wait for the remaining tasks to wind down after cancellation.
async fn drain_tasks(task_set: &mut JoinSet<Result<TaskName>>) {
    while let Some(result) = task_set.join_next().await {
        match result {
            Ok(Ok(task_name)) => info!("Task {} stopped", task_name),
            Ok(Err(e)) => warn!("Task stopped with error: {}", e),
            Err(e) => warn!("Task panicked during shutdown: {}", e),
        }
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_json);

    let config = load_config(&args)?;

    // Reset DB check, before any storage initialization
    if should_reset_db(args.reset_db) {
        reset_data_directory(&config.storage.data_dir)?;
    }

    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!("  VitalStream - Live Telemetry & Trial Recording");
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!("   Data directory: {}", config.storage.data_dir.display());
    info!(
        "   Rolling buffer: {} readings/patient, max age {}s, sweep every {}s",
        config.rolling_buffer.capacity,
        config.rolling_buffer.max_age_secs,
        config.rolling_buffer.cleanup_interval_secs
    );
    info!("   end_trial timeout: {}s", config.trials.end_timeout_secs);

    let server_addr = config.server.addr.clone();
    let service = TelemetryService::open(config).with_context(|| {
        "Failed to open trial store (is another instance using the data directory?)"
    })?;
    let recovery = service.recovery();
    info!(
        "   Recovery: {} trial(s) resumed, {} trial(s) completed",
        recovery.resumed, recovery.completed
    );
    let service = Arc::new(service);

    let app = create_app(ApiState::new(Arc::clone(&service)));
    let listener = tokio::net::TcpListener::bind(&server_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", server_addr))?;
    info!("✓ Listening on {}", server_addr);
    info!("   Device streams: ws://{}/ws/stream/<patient_id>", server_addr);

    // Graceful shutdown via Ctrl+C
    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received Ctrl+C, initiating shutdown...");
        shutdown_token.cancel();
    });

    let mut task_set: JoinSet<Result<TaskName>> = JoinSet::new();
    spawn_http_server(&mut task_set, listener, app, cancel_token.clone());
    spawn_buffer_sweeper(&mut task_set, &service, cancel_token.clone());

    let outcome = run_supervisor(&mut task_set, cancel_token.clone()).await;

    // Open sockets keep graceful shutdown waiting; close them first.
    cancel_token.cancel();
    if let Err(e) = service.shutdown().await {
        error!("Failed to flush trial store: {}", e);
    }
    drain_tasks(&mut task_set).await;

    info!("VitalStream stopped");
    outcome
}
