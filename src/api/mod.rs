//! Control and observer server
//!
//! HTTP + WebSocket listener for the inspection UI: live summary and
//! detail streams plus the configuration endpoints. Separate from the
//! proxy listener so reconfiguring the proxy never takes the control
//! surface down.

pub mod handlers;
pub mod ws;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

use crate::capture::{EventBus, RecordRegistry};
use crate::cert::{CaStore, LeafCache};
use crate::config::ConfigStore;
use crate::proxy::upstream::UpstreamSelector;
use crate::proxy::ProxyController;

/// Shared handles behind every endpoint.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<RecordRegistry>,
    pub bus: EventBus,
    pub ca: Arc<CaStore>,
    pub leaf_cache: Arc<LeafCache>,
    pub upstream: Arc<UpstreamSelector>,
    pub proxy: Arc<ProxyController>,
    pub config: Arc<ConfigStore>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/requests", get(ws::requests_ws))
        .route("/requests/details/{id}", get(ws::details_ws))
        .route("/api/proxy/config", get(handlers::proxy_config))
        .route("/api/proxy/change", post(handlers::change_proxy))
        .route("/api/proxy/upstream/config", get(handlers::upstream_config))
        .route("/api/proxy/upstream/change", post(handlers::change_upstream))
        .route("/api/cert/status", get(handlers::cert_status))
        .route("/api/cert/install", post(handlers::cert_install))
        .route("/api/cert/uninstall", post(handlers::cert_uninstall))
        .route("/api/cert/install-script", get(handlers::install_script))
        .route("/api/cert/uninstall-script", get(handlers::uninstall_script))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Binds the control listener and serves in a background task.
///
/// Falls back to an ephemeral port when the requested one is taken, so a
/// busy port never keeps the control surface from coming up.
pub async fn serve(state: AppState, port: u16) -> Result<(SocketAddr, JoinHandle<()>)> {
    let listener = match TcpListener::bind(("0.0.0.0", port)).await {
        Ok(listener) => listener,
        Err(err) => {
            warn!(port, error = %err, "control port in use, trying a random port");
            TcpListener::bind(("0.0.0.0", 0))
                .await
                .context("failed to bind control listener")?
        }
    };
    let addr = listener.local_addr()?;
    info!(%addr, "control server started");

    let app = router(state);
    let task = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            error!(error = %err, "control server error");
        }
    });
    Ok((addr, task))
}
