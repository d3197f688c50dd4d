//! ProxyMan - HTTPS-intercepting forward proxy with live capture
//!
//! A man-in-the-middle proxy for inspecting your own application traffic:
//! it relays HTTP/1.1 and CONNECT-tunneled TLS byte-for-byte while
//! decoding a copy of every body and streaming request details to
//! WebSocket observers.
//!
//! ## Subsystems
//!
//! - `cert` - process CA plus the bounded per-host leaf cache
//! - `capture` - per-request records, the in-flight ring, the summary bus
//! - `proxy` - listener, CONNECT sniffing, forwarding, the capture tee
//! - `api` - control and observer HTTP/WebSocket server
//! - `config` - persisted settings under `~/.proxyMan`
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use proxyman::capture::{EventBus, RecordRegistry};
//! use proxyman::cert::{CaStore, LeafCache};
//! use proxyman::config::UpstreamProxyConfig;
//! use proxyman::proxy::upstream::UpstreamSelector;
//! use proxyman::proxy::{ProxyContext, ProxyController};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let ca = Arc::new(CaStore::initialize("/tmp/proxyman-ca")?);
//!     let ctx = ProxyContext {
//!         registry: Arc::new(RecordRegistry::new(EventBus::new())),
//!         leaf_cache: Arc::new(LeafCache::new(ca)),
//!         upstream: Arc::new(UpstreamSelector::new(UpstreamProxyConfig::default())?),
//!     };
//!     ProxyController::new(ctx).start("127.0.0.1", 8888).await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod capture;
pub mod cert;
pub mod config;
pub mod logger;
pub mod proxy;

pub use capture::{CaptureRecord, DataChunk, DataType, EventBus, RecordRegistry, RequestSummary};
pub use cert::{CaStore, LeafCache};
pub use config::{AppConfig, ConfigStore, UpstreamMode, UpstreamProxyConfig};
pub use proxy::{ProxyContext, ProxyController};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
        assert_eq!(NAME, "proxyman");
    }
}
