use crate::registry::PeerView;
use crate::server::ServerState;
use axum::extract::State;
use axum::{http::StatusCode, response::Json, routing::get, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use sysinfo::{ProcessesToUpdate, System};

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
}

/// Service information response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InfoResponse {
    service: &'static str,
    version: &'static str,
    uptime_seconds: u64,
    memory_bytes: u64,
    connected_servers: usize,
}

/// Connected peer listing.
#[derive(Debug, Serialize)]
pub struct ServersResponse {
    count: usize,
    servers: Vec<PeerView>,
}

/// # Errors
///
/// Returns an error if installing the recorder or binding the HTTP server fails.
pub async fn start_monitor_server(addr: SocketAddr, state: Arc<ServerState>) -> anyhow::Result<()> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    let app = Router::new()
        .route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
        .route("/health", get(health_handler))
        .route("/info", get(info_handler))
        .route("/servers", get(servers_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("monitor server listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

/// Health check handler - returns 200 if server is running.
async fn health_handler() -> (StatusCode, Json<HealthResponse>) {
    (StatusCode::OK, Json(HealthResponse { status: "healthy" }))
}

async fn info_handler(State(state): State<Arc<ServerState>>) -> Json<InfoResponse> {
    Json(InfoResponse {
        service: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        memory_bytes: current_process_memory_bytes(),
        connected_servers: state.registry.size(),
    })
}

/// Resident memory of this process, or 0 where the platform cannot report it.
fn current_process_memory_bytes() -> u64 {
    let mut system = System::new();
    let Ok(pid) = sysinfo::get_current_pid() else {
        return 0;
    };
    let _ = system.refresh_processes(ProcessesToUpdate::Some(&[pid]), false);
    system.process(pid).map_or(0, sysinfo::Process::memory)
}

async fn servers_handler(State(state): State<Arc<ServerState>>) -> Json<ServersResponse> {
    let servers = state.registry.snapshot();
    Json(ServersResponse {
        count: servers.len(),
        servers,
    })
}

/// Connection count gauges.
pub mod gauges {
    /// Increment the active connections gauge.
    pub fn inc_connections_active() {
        metrics::gauge!("mcr_connections_active").increment(1.0);
    }

    /// Decrement the active connections gauge.
    pub fn dec_connections_active() {
        metrics::gauge!("mcr_connections_active").decrement(1.0);
    }
}

/// Event counters.
pub mod counters {
    /// Record an admission attempt with the given status label.
    pub fn admissions_total(status: &'static str) {
        metrics::counter!("mcr_admissions_total", "status" => status).increment(1);
    }

    /// Count an accepted inbound message by type.
    pub fn messages_total(kind: &str) {
        metrics::counter!("mcr_messages_total", "kind" => kind.to_owned()).increment(1);
    }

    /// Count a rejected inbound frame by error code.
    pub fn validation_failures_total(code: &'static str) {
        metrics::counter!("mcr_validation_failures_total", "code" => code).increment(1);
    }

    /// Count an unresolved teleport request by routing code.
    pub fn routing_failures_total(code: &'static str) {
        metrics::counter!("mcr_routing_failures_total", "code" => code).increment(1);
    }

    /// Count entries evicted by the reaper.
    pub fn reaper_evictions_total(count: u64) {
        metrics::counter!("mcr_reaper_evictions_total").increment(count);
    }

    /// Count an outbound message that could not be queued.
    pub fn send_failures_total(reason: &'static str) {
        metrics::counter!("mcr_send_failures_total", "reason" => reason).increment(1);
    }
}

/// Latency histograms.
pub mod histograms {
    /// Record the time spent decoding, validating and dispatching one frame.
    pub fn dispatch_seconds(value: f64) {
        metrics::histogram!("mcr_dispatch_seconds").record(value);
    }
}
