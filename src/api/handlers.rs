//! Control API handlers
//!
//! JSON endpoints mirroring the proxy's runtime controls: listen address,
//! upstream proxy, and CA trust-store management. Validation failures are
//! structured `{status: false, msg}` responses, never process errors.

use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::cert::install;
use crate::config::{UpstreamMode, UpstreamProxyConfig};
use crate::proxy::upstream::UpstreamSelector;

use super::AppState;

/// GET /api/proxy/config
pub async fn proxy_config(State(state): State<AppState>) -> Json<Value> {
    let (running, host, port, error) = state.proxy.status();
    let mut body = json!({
        "status": running,
        "host": host,
        "port": port,
    });
    if let Some(message) = error {
        body["msg"] = Value::String(message);
    }
    Json(body)
}

#[derive(Debug, Deserialize)]
pub struct ChangeProxyRequest {
    #[serde(default)]
    pub host: String,
    pub port: u16,
}

/// POST /api/proxy/change — persist the new address and restart the
/// listener.
pub async fn change_proxy(
    State(state): State<AppState>,
    Json(request): Json<ChangeProxyRequest>,
) -> Json<Value> {
    let host = if request.host.is_empty() {
        "127.0.0.1".to_string()
    } else {
        request.host
    };

    if let Err(err) = state.config.update_proxy(&host, request.port) {
        return Json(json!({
            "status": false,
            "msg": format!("Failed to save proxy config: {err}"),
        }));
    }

    match state.proxy.start(&host, request.port).await {
        Ok(addr) => Json(json!({
            "status": true,
            "host": host,
            "port": addr.port(),
        })),
        Err(err) => Json(json!({
            "status": false,
            "msg": err.to_string(),
        })),
    }
}

/// GET /api/proxy/upstream/config
pub async fn upstream_config(State(state): State<AppState>) -> Json<Value> {
    let config = state.upstream.config();
    Json(json!({
        "mode": config.mode,
        "protocol": config.protocol,
        "host": config.host,
        "port": config.port,
        "envProxy": UpstreamSelector::detected_env_proxy(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct ChangeUpstreamRequest {
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
}

/// POST /api/proxy/upstream/change
pub async fn change_upstream(
    State(state): State<AppState>,
    Json(request): Json<ChangeUpstreamRequest>,
) -> Json<Value> {
    let config = match request.mode.as_str() {
        "none" => UpstreamProxyConfig {
            mode: UpstreamMode::None,
            ..Default::default()
        },
        "env" => UpstreamProxyConfig {
            mode: UpstreamMode::Env,
            ..Default::default()
        },
        "custom" => {
            if request.protocol != "http" && request.protocol != "socks5" {
                return reject(format!("unsupported protocol: {}", request.protocol));
            }
            if request.host.is_empty() {
                return reject("host must not be empty".to_string());
            }
            if request.port == 0 {
                return reject("port must be between 1 and 65535".to_string());
            }
            UpstreamProxyConfig {
                mode: UpstreamMode::Custom,
                protocol: request.protocol,
                host: request.host,
                port: request.port,
            }
        }
        other => return reject(format!("unknown mode: {other}")),
    };

    if let Err(err) = state.config.update_upstream(config.clone()) {
        return reject(format!("Failed to save config: {err}"));
    }
    if let Err(err) = state.upstream.set_config(config) {
        return reject(format!("Failed to apply config: {err}"));
    }
    Json(json!({ "status": true }))
}

fn reject(message: String) -> Json<Value> {
    warn!(msg = %message, "config update rejected");
    Json(json!({ "status": false, "msg": message }))
}

/// GET /api/cert/status
pub async fn cert_status(State(state): State<AppState>) -> Json<Value> {
    let exists = state.ca.cert_exists();
    let installed = install::is_installed(&state.ca);
    Json(json!({
        "installed": installed,
        "path": state.ca.cert_path(),
        "exists": exists,
        "platform": install::platform_label(),
    }))
}

/// POST /api/cert/install
pub async fn cert_install(State(state): State<AppState>) -> Json<Value> {
    let outcome = install::install(&state.ca);
    let mut body = serde_json::to_value(&outcome).unwrap_or_default();
    if !outcome.success {
        body["hasScript"] = Value::Bool(true);
        body["scriptEndpoint"] = Value::String("/api/cert/install-script".to_string());
    }
    Json(body)
}

/// POST /api/cert/uninstall
pub async fn cert_uninstall(State(state): State<AppState>) -> Json<Value> {
    let outcome = install::uninstall(&state.ca);
    let mut body = serde_json::to_value(&outcome).unwrap_or_default();
    if !outcome.success {
        body["hasScript"] = Value::Bool(true);
        body["scriptEndpoint"] = Value::String("/api/cert/uninstall-script".to_string());
    }
    Json(body)
}

/// GET /api/cert/install-script — shell or batch attachment.
pub async fn install_script(State(state): State<AppState>) -> Response {
    script_response(install::install_script(&state.ca))
}

/// GET /api/cert/uninstall-script
pub async fn uninstall_script(State(state): State<AppState>) -> Response {
    script_response(install::uninstall_script(&state.ca))
}

fn script_response(script: install::TrustScript) -> Response {
    (
        [
            (header::CONTENT_TYPE, script.content_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename={}", script.filename),
            ),
        ],
        script.body,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{EventBus, RecordRegistry};
    use crate::cert::{CaStore, LeafCache};
    use crate::config::ConfigStore;
    use crate::proxy::{ProxyContext, ProxyController};
    use axum::extract::State;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn test_state(dir: &TempDir) -> AppState {
        let bus = EventBus::new();
        let registry = Arc::new(RecordRegistry::new(bus.clone()));
        let ca = Arc::new(
            CaStore::initialize_with_key_bits(dir.path().join("cert"), 2048).unwrap(),
        );
        let leaf_cache = Arc::new(LeafCache::new(Arc::clone(&ca)));
        let upstream =
            Arc::new(UpstreamSelector::new(UpstreamProxyConfig::default()).unwrap());
        let proxy = Arc::new(ProxyController::new(ProxyContext {
            registry: Arc::clone(&registry),
            leaf_cache: Arc::clone(&leaf_cache),
            upstream: Arc::clone(&upstream),
        }));
        AppState {
            registry,
            bus,
            ca,
            leaf_cache,
            upstream,
            proxy,
            config: Arc::new(ConfigStore::load(dir.path()).unwrap()),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn upstream_change_rejects_port_zero() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);

        let response = change_upstream(
            State(state),
            Json(ChangeUpstreamRequest {
                mode: "custom".into(),
                protocol: "http".into(),
                host: "p".into(),
                port: 0,
            }),
        )
        .await;

        assert_eq!(response.0["status"], false);
        assert_eq!(response.0["msg"], "port must be between 1 and 65535");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn upstream_change_rejects_unknown_mode_and_protocol() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);

        let response = change_upstream(
            State(state.clone()),
            Json(ChangeUpstreamRequest {
                mode: "direct".into(),
                protocol: String::new(),
                host: String::new(),
                port: 0,
            }),
        )
        .await;
        assert_eq!(response.0["status"], false);

        let response = change_upstream(
            State(state),
            Json(ChangeUpstreamRequest {
                mode: "custom".into(),
                protocol: "socket5".into(),
                host: "p".into(),
                port: 1080,
            }),
        )
        .await;
        assert_eq!(response.0["status"], false);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn upstream_change_applies_and_persists_custom_config() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);

        let response = change_upstream(
            State(state.clone()),
            Json(ChangeUpstreamRequest {
                mode: "custom".into(),
                protocol: "socks5".into(),
                host: "parent.proxy".into(),
                port: 1080,
            }),
        )
        .await;
        assert_eq!(response.0["status"], true);

        let applied = state.upstream.config();
        assert_eq!(applied.mode, UpstreamMode::Custom);
        assert_eq!(applied.protocol, "socks5");
        assert_eq!(state.config.snapshot().upstream_proxy, applied);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cert_status_reports_platform_and_path() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);

        let response = cert_status(State(state)).await;
        assert_eq!(response.0["exists"], true);
        assert!(response.0["platform"].is_string());
        assert!(response.0["path"].as_str().unwrap().ends_with("ca.crt"));
    }
}
