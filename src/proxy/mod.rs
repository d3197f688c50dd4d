//! Interception engine
//!
//! The proxy listener and everything a connection passes through: CONNECT
//! handling with protocol sniffing, on-the-fly TLS with minted leaves,
//! the forwarding loop, the capture tee, and upstream selection.

pub mod forward;
pub mod rewind;
pub mod server;
pub mod tee;
pub mod upstream;

use std::sync::Arc;

use crate::capture::RecordRegistry;
use crate::cert::LeafCache;
use upstream::UpstreamSelector;

pub use server::{ProxyController, ProxyError};

/// Shared handles every connection needs.
#[derive(Debug, Clone)]
pub struct ProxyContext {
    pub registry: Arc<RecordRegistry>,
    pub leaf_cache: Arc<LeafCache>,
    pub upstream: Arc<UpstreamSelector>,
}
