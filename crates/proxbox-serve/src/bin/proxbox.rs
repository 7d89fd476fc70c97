//! proxbox binary entry point

use anyhow::{Context, Result};
use clap::Parser;
use proxbox_serve::config::{AppConfig, DEFAULT_CONFIG_FILE};
use proxbox_serve::ProxboxServer;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Proxbox - Proxmox to NetBox reconciliation server
#[derive(Parser, Debug)]
#[command(name = "proxbox")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Syncs Proxmox nodes and virtual machines into NetBox", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Listen address, overriding the configuration
    #[arg(long)]
    host: Option<String>,

    /// Listen port, overriding the configuration
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).context("Failed to set tracing subscriber")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load(&cli.config)?;
    config.apply_env();

    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if cli.verbose {
        config.server.log_level = "debug".to_string();
    }

    init_logging(&config.server.log_level)?;

    info!("Proxbox {} starting", env!("CARGO_PKG_VERSION"));
    info!("Configuration: {:?}", cli.config);
    info!("Clusters configured: {}", config.proxmox.len());

    let server = ProxboxServer::new(config)?;
    info!("Press Ctrl+C to stop");

    server.start().await?;

    info!("Proxbox stopped");
    Ok(())
}
