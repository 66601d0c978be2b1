#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use mcrs::config::{Args, ServerConfig};
use mcrs::monitor::start_monitor_server;
use mcrs::server::ServerState;
use mcrs::run_with_shutdown;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // A panic in any connection task takes the whole relay down; the supervisor restarts it.
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_hook(info);
        std::process::abort();
    }));

    let args = Args::parse();
    let config: ServerConfig = args.into();

    // Validate configuration before starting
    if let Err(e) = config.validate() {
        anyhow::bail!("configuration error: {}", e);
    }

    let state = Arc::new(ServerState::new(config.clone()));

    let listener = TcpListener::bind(config.listen).await?;
    info!("bound to {}", config.listen);

    tokio::spawn({
        let state = Arc::clone(&state);
        async move {
            if let Err(e) = start_monitor_server(config.monitor_addr, state).await {
                warn!("monitor server error: {}", e);
            }
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(());
    let server = tokio::spawn(run_with_shutdown(listener, state, shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("received shutdown signal");
    let _ = shutdown_tx.send(());

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("server error: {}", e),
        Err(e) => tracing::error!("server task failed: {}", e),
    }

    Ok(())
}
