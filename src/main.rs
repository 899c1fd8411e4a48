//! collector-downstream
//!
//! Accepts agent-initiated streams and keeps a session per connected agent
//! so that commands can be issued back to it.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use collector_downstream::{config::Config, transport::AgentListener, AgentSessionRegistry};

#[derive(Parser, Debug)]
#[command(name = "collector-downstream")]
#[command(about = "Collector-side command channel for connected monitoring agents")]
struct Args {
    /// JSON configuration file (defaults to $COLLECTOR_DOWNSTREAM_CONFIG)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address agents connect to (overrides the configuration)
    #[arg(long)]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path),
        None => Config::from_env(),
    }
    .context("Failed to load configuration")?;
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    let session_config = config.session_config();

    info!(
        listen_addr = %config.listen_addr,
        call_timeout = ?session_config.call_timeout,
        pending_retention = ?session_config.pending_retention,
        "Loaded configuration"
    );

    let registry = Arc::new(AgentSessionRegistry::new());
    let reaper = registry.start_reaper(session_config.reaper_interval);

    let listener = Arc::new(
        AgentListener::bind(&config.listen_addr, Arc::clone(&registry), session_config).await?,
    );
    let accept = tokio::spawn(listener.accept_loop());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down");

    accept.abort();
    reaper.abort();
    registry.close_all().await;

    Ok(())
}
