//! Itinera daemon: loads configuration, wires the orchestration core, and
//! runs it until interrupted.

use anyhow::{anyhow, Context};
use clap::Parser;
use itinera_core::{CoreConfig, CoreContext};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "itinera-daemon", about = "Holonic travel-planning orchestration core")]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "itinera.toml")]
    config: PathBuf,

    /// Log level override (tracing env-filter syntax)
    #[arg(long)]
    log_level: Option<String>,

    /// Validate the configuration and exit
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = CoreConfig::load(&args.config).map_err(|e| anyhow!(e))?;

    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    let filter = EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info"));
    if config.logging.compact {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .compact()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    if args.check_config {
        println!("configuration ok: {}", args.config.display());
        return Ok(());
    }

    let context = CoreContext::build(config)
        .map_err(|e| anyhow!(e))
        .context("failed to build core context")?;
    context
        .start()
        .await
        .map_err(|e| anyhow!(e))
        .context("failed to start core context")?;

    info!("itinera daemon running, press ctrl-c to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    info!("shutdown signal received");
    context.shutdown().await;
    Ok(())
}
