//! devyard - dashboard server entry point

use anyhow::Context;
use clap::Parser;
use devyard_foundation::DevyardConfig;
use devyard_server::{router, AppState};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// devyard - deploy, watch and drive development containers
#[derive(Parser, Debug)]
#[command(name = "devyard")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Explicit config file (skips the global/project merge)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on (overrides `server.bind`)
    #[arg(short, long)]
    bind: Option<String>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = match &args.config {
        Some(path) => DevyardConfig::load_from(path),
        None => DevyardConfig::load(),
    }
    .context("Failed to load configuration")?;

    let state = AppState::from_config(&config).context("Failed to initialise runtime")?;
    let app = router(state.clone());

    let bind = args.bind.unwrap_or_else(|| config.server.bind.clone());
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    info!(bind = %bind, projects = config.projects.len(), "devyard listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Shutting down");
    state.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}
