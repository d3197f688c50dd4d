//! Certificate infrastructure
//!
//! The process CA, the per-host leaf cache in front of it, and the
//! trust-store helpers the control API exposes.

pub mod authority;
pub mod cache;
pub mod install;

pub use authority::{CaStore, CertError};
pub use cache::{LeafCache, LeafError, MintedLeaf, CACHE_CAPACITY};
