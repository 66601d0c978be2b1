use crate::admission::{Authenticator, MinLengthAuthenticator};
use crate::config::ServerConfig;
use crate::connection::handle_connection;
use crate::error::RelayError;
use crate::reaper::StaleReaper;
use crate::registry::ConnectionRegistry;
use crate::router::Router;
use mcr_common::MessageCodec;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared state for the relay server.
pub struct ServerState {
    /// Connected peers.
    pub registry: Arc<ConnectionRegistry>,
    /// Message dispatcher over [`registry`](Self::registry).
    pub router: Router,
    /// Admission policy.
    pub authenticator: Box<dyn Authenticator>,
    /// Runtime server configuration.
    pub config: ServerConfig,
    /// Atomic counter for open connections, admitted or not.
    pub active_connections: AtomicUsize,
    /// Process start, for uptime reporting.
    pub started_at: Instant,
    next_conn_id: AtomicU64,
}

impl ServerState {
    /// State with the default length-only authenticator.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        Self::with_authenticator(config, Box::new(MinLengthAuthenticator::default()))
    }

    /// State with a caller-supplied authenticator.
    #[must_use]
    pub fn with_authenticator(config: ServerConfig, authenticator: Box<dyn Authenticator>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let codec = MessageCodec::new(config.shared_secret.clone());
        Self {
            router: Router::new(Arc::clone(&registry), codec),
            registry,
            authenticator,
            config,
            active_connections: AtomicUsize::new(0),
            started_at: Instant::now(),
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Allocates a process-unique connection id.
    pub fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// # Errors
///
/// Returns an error if the accept loop encounters an I/O failure.
pub async fn run(listener: TcpListener, state: Arc<ServerState>) -> Result<(), RelayError> {
    let (_shutdown_tx, shutdown_rx) = watch::channel(());
    run_with_shutdown(listener, state, shutdown_rx).await
}

/// Run the server accept loop with an externally-controlled shutdown signal.
///
/// Starts the stale reaper. When `shutdown` changes or its sender is dropped,
/// the loop stops accepting, the reaper stops, open connections are told to
/// close, and in-flight connection tasks get up to 30 seconds to finish.
///
/// # Errors
///
/// Returns an error if the listener's local address cannot be read.
pub async fn run_with_shutdown(
    listener: TcpListener,
    state: Arc<ServerState>,
    shutdown: watch::Receiver<()>,
) -> Result<(), RelayError> {
    let local_addr = listener.local_addr()?;
    info!("relay listening on {}", local_addr);

    let reaper = StaleReaper::new(
        Arc::clone(&state.registry),
        state.config.reap_interval(),
        state.config.stale_after(),
    )
    .spawn(shutdown.clone());

    let mut shutdown_rx = shutdown.clone();
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        if state.active_connections.load(Ordering::Relaxed) >= state.config.max_conns {
                            warn!("max connections reached, rejecting {}", addr);
                            drop(stream);
                            continue;
                        }
                        let state = Arc::clone(&state);
                        let shutdown = shutdown.clone();
                        connections.spawn(async move {
                            if let Err(e) = handle_connection(stream, addr, state, shutdown).await {
                                tracing::debug!("connection from {} closed: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("failed to accept connection: {}", e);
                    }
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = shutdown_rx.changed() => {
                info!("shutdown signal received, draining {} connections", connections.len());
                break;
            }
        }
    }

    if reaper.await.is_err() {
        warn!("reaper task ended abnormally");
    }

    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            "drain timeout reached with {} connections still active",
            connections.len()
        );
        connections.abort_all();
    }

    info!("relay shut down gracefully");
    Ok(())
}
