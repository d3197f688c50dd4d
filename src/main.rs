use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use proxyman::api::{self, AppState};
use proxyman::capture::{EventBus, RecordRegistry};
use proxyman::cert::{CaStore, LeafCache};
use proxyman::config::{self, ConfigStore, DEFAULT_OBSERVER_PORT};
use proxyman::proxy::upstream::UpstreamSelector;
use proxyman::proxy::{ProxyContext, ProxyController};

/// HTTPS-intercepting forward proxy with live capture streaming.
#[derive(Debug, Parser)]
#[command(name = "proxyman", version)]
struct Cli {
    /// Control/observer server port
    #[arg(long, default_value_t = DEFAULT_OBSERVER_PORT)]
    port: u16,

    /// Proxy listener port (defaults to the persisted config)
    #[arg(long = "pport")]
    proxy_port: Option<u16>,

    /// Proxy listen address (defaults to the persisted config)
    #[arg(long = "phost")]
    proxy_host: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let base_dir = config::data_dir()?;
    let _log_guard = proxyman::logger::init(&config::log_dir(&base_dir))?;

    let config_store = Arc::new(ConfigStore::load(&base_dir)?);
    let snapshot = config_store.snapshot();

    // CA problems are fatal: without it no TLS interception is possible.
    let ca = Arc::new(
        CaStore::initialize(config::cert_dir(&base_dir))
            .context("failed to initialize certificate authority")?,
    );
    let leaf_cache = Arc::new(LeafCache::new(Arc::clone(&ca)));
    let _sweeper = leaf_cache.spawn_sweeper();

    let bus = EventBus::new();
    let registry = Arc::new(RecordRegistry::new(bus.clone()));
    let upstream = Arc::new(
        UpstreamSelector::new(snapshot.upstream_proxy.clone())
            .context("failed to build outbound client")?,
    );

    let proxy = Arc::new(ProxyController::new(ProxyContext {
        registry: Arc::clone(&registry),
        leaf_cache: Arc::clone(&leaf_cache),
        upstream: Arc::clone(&upstream),
    }));

    let state = AppState {
        registry,
        bus,
        ca,
        leaf_cache,
        upstream,
        proxy: Arc::clone(&proxy),
        config: config_store,
    };

    // The control surface must come up; the proxy listener can be fixed
    // through it afterwards.
    let (api_addr, api_task) = api::serve(state, cli.port).await?;
    info!(addr = %api_addr, "observer endpoints ready");

    let proxy_host = cli.proxy_host.unwrap_or(snapshot.proxy_host);
    let proxy_port = cli.proxy_port.unwrap_or(snapshot.proxy_port);
    if let Err(err) = proxy.start(&proxy_host, proxy_port).await {
        error!(error = %err, "proxy listener failed to start; adjust it via /api/proxy/change");
    }

    api_task.await.context("control server terminated")?;
    Ok(())
}
