//! Tunnel broker binary.
//!
//! ## Startup Sequence
//!
//! 1. Load configuration (file, then `TUNNEL_*` environment, then flags)
//! 2. Validate it
//! 3. Bind the single public port and start the heartbeat sweeper
//! 4. Serve until Ctrl+C, then close every tunnel

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tunnel_broker::{BrokerConfig, BrokerService, VERSION};

/// Reverse-tunnel request broker
#[derive(Parser, Debug)]
#[command(name = "tunnel-broker")]
#[command(about = "Forward public requests to workers connected over outbound tunnels")]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address (overrides config and environment)
    #[arg(long)]
    host: Option<IpAddr>,

    /// Listen port (overrides config and environment)
    #[arg(short, long)]
    port: Option<u16>,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_logging(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

fn load_config(args: &Args) -> Result<BrokerConfig> {
    let mut config = match &args.config {
        Some(path) => BrokerConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => BrokerConfig::default(),
    };

    config.apply_env_overrides();

    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    info!(version = VERSION, "Starting tunnel broker");

    let config = load_config(&args)?;
    let service = Arc::new(BrokerService::new(config).context("invalid configuration")?);

    {
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Shutting down");
                    service.shutdown();
                }
                Err(e) => error!(error = %e, "Failed to listen for Ctrl+C"),
            }
        });
    }

    if let Err(e) = service.start().await {
        error!(error = %e, "Broker stopped with an error");
        return Err(e.into());
    }
    Ok(())
}
