//! Bedside Device Simulator
//!
//! Streams synthetic vital signs for one patient to a running VitalStream
//! server over WebSocket, reconnecting with exponential backoff.
//!
//! # Usage
//! ```bash
//! ./device-simulator --patient-id 42 --server ws://127.0.0.1:8080
//! ./device-simulator --patient-id 42 --count 120 --seed 7
//! ```

use anyhow::{bail, Result};
use clap::Parser;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use vitalstream::config::defaults;
use vitalstream::device::{DeviceStreamer, ReconnectPolicy, StreamerConfig, VitalsGenerator};

#[derive(Parser, Debug)]
#[command(name = "device-simulator")]
#[command(about = "Synthetic vital-sign device for VitalStream testing")]
#[command(version)]
struct Args {
    /// Patient to stream readings for
    #[arg(short, long)]
    patient_id: i64,

    /// Device identifier reported to the server (default: sim-<patient_id>)
    #[arg(short, long)]
    device_id: Option<String>,

    /// Server base URL
    #[arg(short, long, env = "VITALSTREAM_URL", default_value = "ws://127.0.0.1:8080")]
    server: String,

    /// Milliseconds between readings
    #[arg(short, long, default_value_t = defaults::SIMULATOR_INTERVAL_MS)]
    interval_ms: u64,

    /// Stop after this many readings (default: run until Ctrl+C)
    #[arg(short, long)]
    count: Option<u64>,

    /// Maximum reconnect delay in milliseconds
    #[arg(long, default_value_t = defaults::RECONNECT_MAX_DELAY_MS)]
    max_backoff_ms: u64,

    /// Let the server stamp readings instead of sending device timestamps
    #[arg(long)]
    server_timestamps: bool,

    /// Random seed for reproducibility
    #[arg(long)]
    seed: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    if args.patient_id <= 0 {
        bail!("patient id must be positive, got {}", args.patient_id);
    }
    if args.interval_ms == 0 {
        bail!("interval must be greater than 0 ms");
    }

    let config = StreamerConfig {
        server_url: args.server,
        patient_id: args.patient_id,
        device_id: args
            .device_id
            .unwrap_or_else(|| format!("sim-{}", args.patient_id)),
        interval: Duration::from_millis(args.interval_ms),
        max_readings: args.count,
        device_timestamps: !args.server_timestamps,
    };
    let policy = ReconnectPolicy::new(
        Duration::from_millis(defaults::RECONNECT_INITIAL_DELAY_MS),
        Duration::from_millis(args.max_backoff_ms),
    );

    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received Ctrl+C, stopping simulator...");
        shutdown_token.cancel();
    });

    let streamer = DeviceStreamer::new(config, VitalsGenerator::new(args.seed), policy);
    let stats = streamer.run(cancel_token).await;

    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
