//! Health check HTTP server for Kubernetes probes.
//!
//! `/healthz` reports liveness; `/readyz` reports readiness, which requires
//! the director to be started and the watcher to have observed both the
//! cluster config and the node inventory.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::watcher::ClusterWatcher;

/// Shared state for health check endpoints.
pub struct HealthState {
    started: AtomicBool,
    watcher: Arc<ClusterWatcher>,
}

impl HealthState {
    pub fn new(watcher: Arc<ClusterWatcher>) -> Self {
        Self {
            started: AtomicBool::new(false),
            watcher,
        }
    }

    /// Mark the director as started and eligible for readiness.
    pub fn mark_started(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

/// Run the probe server until it fails. Spawn alongside the director.
///
/// Binds localhost only; probes arrive via the kubelet on the node.
pub async fn run_health_server(state: Arc<HealthState>, port: u16) -> std::io::Result<()> {
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = TcpListener::bind(addr).await?;
    info!(port, "Health check server listening");

    axum::serve(listener, app).await
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn readyz(State(state): State<Arc<HealthState>>) -> StatusCode {
    if !state.is_started() {
        debug!("Readiness probe: NOT READY (director not started)");
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    if !state.watcher.is_synced() {
        debug!("Readiness probe: NOT READY (cluster state not yet observed)");
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    StatusCode::OK
}
