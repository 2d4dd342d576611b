mod app;
mod config;
mod domain;
mod infrastructure;
mod logging;
mod modules;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use crate::app::{Sweeper, SweeperSettings};

#[derive(Debug, Parser)]
#[command(
    name = "sweeper",
    version,
    about = "Sweeper: moves ERC-20 balances off a watched account as soon as they land"
)]
struct Args {
    /// Config file (defaults to $SWEEPER_CONFIG or ~/.config/sweeper/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// HTTP JSON-RPC endpoint; repeat for more (e.g. http://localhost:8545)
    #[arg(long)]
    rpc: Vec<String>,

    /// WebSocket endpoint; repeat for more (e.g. ws://localhost:8546)
    #[arg(long)]
    ws: Vec<String>,

    /// Safe address that receives swept balances
    #[arg(long)]
    destination: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(args.log_json)?;

    let config = config::load(args.config.as_deref())?;
    let settings = SweeperSettings::from_config(
        &config,
        &args.rpc,
        &args.ws,
        args.destination.as_deref(),
    )?;

    let sweeper = Sweeper::connect(settings).await?;
    sweeper.start().await;

    wait_for_signal().await?;
    sweeper.shutdown().await;

    match sweeper.status_json().await {
        Ok(status) => info!("final status\n{status}"),
        Err(err) => error!(error = %format!("{err:#}"), "failed to render final status"),
    }
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.context("Failed to listen for ctrl-c")?,
        _ = term.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")
}
