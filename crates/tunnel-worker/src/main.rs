//! Tunnel worker binary.
//!
//! Dials the broker, registers, and replays every forwarded request against
//! `--local-url` until Ctrl+C.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tunnel_worker::{HttpForwardHandler, WorkerClient, WorkerConfig};

/// Reverse-tunnel worker
#[derive(Parser, Debug)]
#[command(name = "tunnel-worker")]
#[command(about = "Dial out to a tunnel broker and serve forwarded requests locally")]
struct Args {
    /// Broker tunnel endpoint
    #[arg(long, default_value = "ws://127.0.0.1:8080/tunnel")]
    broker_url: String,

    /// Local service that forwarded requests are replayed against
    #[arg(long, default_value = "http://127.0.0.1:3000")]
    local_url: String,

    /// Registration metadata, repeatable (`--metadata addr=10.0.0.5`)
    #[arg(long = "metadata", value_parser = parse_key_value)]
    metadata: Vec<(String, String)>,

    /// Heartbeat interval in seconds
    #[arg(long, default_value_t = 20)]
    heartbeat_secs: u64,

    /// Timeout for each local request in seconds
    #[arg(long, default_value_t = 30)]
    local_timeout_secs: u64,

    /// Give up after this many consecutive failed connects (retry forever if unset)
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn parse_key_value(s: &str) -> Result<(String, String)> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| anyhow!("expected key=value, got {s}"))?;
    Ok((key.to_string(), value.to_string()))
}

fn init_logging(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let mut config = WorkerConfig::new(args.broker_url);
    config.heartbeat_interval = Duration::from_secs(args.heartbeat_secs);
    config.max_reconnect_attempts = args.max_attempts;
    config.metadata.extend(args.metadata);
    config
        .validate()
        .map_err(|e| anyhow!(e))
        .context("invalid configuration")?;

    let handler = HttpForwardHandler::new(
        args.local_url.as_str(),
        Duration::from_secs(args.local_timeout_secs),
    )
    .context("building HTTP client")?;

    info!(broker = %config.broker_url, local = %args.local_url, "Starting tunnel worker");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutting down");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => error!(error = %e, "Failed to listen for Ctrl+C"),
        }
    });

    let client = WorkerClient::new(config, Arc::new(handler));
    client.run(shutdown_rx).await?;
    Ok(())
}
