//! Upstream proxy selection
//!
//! Decides how outbound requests reach the origin: directly, through the
//! environment's proxy settings, or through a configured parent proxy
//! (HTTP or SOCKS5). The selection is compiled into an outbound client
//! when the configuration changes; in-flight requests keep the client
//! they started with.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::config::{UpstreamMode, UpstreamProxyConfig};

struct State {
    config: UpstreamProxyConfig,
    client: Arc<reqwest::Client>,
}

/// Runtime-mutable upstream configuration plus the client built from it.
pub struct UpstreamSelector {
    state: RwLock<State>,
}

impl UpstreamSelector {
    pub fn new(config: UpstreamProxyConfig) -> Result<Self, reqwest::Error> {
        let client = Arc::new(build_client(&config)?);
        Ok(Self {
            state: RwLock::new(State { config, client }),
        })
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> UpstreamProxyConfig {
        self.state.read().config.clone()
    }

    /// Swaps in a new configuration. Requests already holding the old
    /// client are unaffected.
    pub fn set_config(&self, config: UpstreamProxyConfig) -> Result<(), reqwest::Error> {
        let client = Arc::new(build_client(&config)?);
        info!(mode = ?config.mode, "upstream proxy configuration updated");
        *self.state.write() = State { config, client };
        Ok(())
    }

    /// The outbound client for one request. Read once at request start.
    pub fn client(&self) -> Arc<reqwest::Client> {
        Arc::clone(&self.state.read().client)
    }

    /// First proxy URL found in the conventional environment variables,
    /// for display in the configuration API.
    pub fn detected_env_proxy() -> String {
        ["HTTP_PROXY", "http_proxy", "HTTPS_PROXY", "https_proxy"]
            .iter()
            .find_map(|name| std::env::var(name).ok().filter(|v| !v.is_empty()))
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for UpstreamSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamSelector")
            .field("config", &self.state.read().config)
            .finish()
    }
}

fn build_client(config: &UpstreamProxyConfig) -> Result<reqwest::Client, reqwest::Error> {
    let builder = reqwest::Client::builder();
    let builder = match config.mode {
        UpstreamMode::None => builder.no_proxy(),
        // reqwest consults HTTP_PROXY/HTTPS_PROXY/NO_PROXY by default.
        UpstreamMode::Env => builder,
        UpstreamMode::Custom => {
            if config.protocol.is_empty() || config.host.is_empty() || config.port == 0 {
                warn!("incomplete custom upstream proxy, using direct connections");
                builder.no_proxy()
            } else {
                let url = format!("{}://{}:{}", config.protocol, config.host, config.port);
                match reqwest::Proxy::all(&url) {
                    Ok(proxy) => builder.proxy(proxy),
                    Err(err) => {
                        warn!(url = %url, error = %err, "invalid upstream proxy url, using direct connections");
                        builder.no_proxy()
                    }
                }
            }
        }
    };
    builder.build()
}
