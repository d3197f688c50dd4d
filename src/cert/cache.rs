//! Leaf certificate cache
//!
//! Mints per-host server certificates signed by the process CA and caches
//! them with a TTL shorter than the leaf validity, so a cache hit can
//! never serve an expired certificate. Capacity is bounded; each insert at
//! capacity evicts the entry closest to expiry, and an hourly sweeper
//! drops entries that already expired.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rcgen::{
    CertificateParams, DnType, ExtendedKeyUsagePurpose, KeyPair, KeyUsagePurpose, SerialNumber,
};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::debug;

use super::authority::{CaStore, LEAF_KEY_BITS};

/// Maximum cached leaves.
pub const CACHE_CAPACITY: usize = 1000;

/// Cache TTL; one hour shorter than the leaf's 24 h validity.
const CACHE_TTL: Duration = Duration::from_secs(23 * 60 * 60);

const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

const LEAF_VALIDITY_DAYS: i64 = 1;
// Constant serial; collisions are acceptable for a private intercepting CA.
const LEAF_SERIAL: u64 = 1658;

#[derive(Debug, Error)]
pub enum LeafError {
    #[error("failed to generate leaf key: {0}")]
    KeyGeneration(String),

    #[error("failed to sign leaf for {host}: {reason}")]
    Signing { host: String, reason: String },

    #[error("failed to build TLS config: {0}")]
    TlsConfig(String),

    #[error("signing task failed: {0}")]
    Join(String),
}

/// A minted leaf: DER material plus the ready-to-serve rustls config.
pub struct MintedLeaf {
    cert_der: Vec<u8>,
    server_config: Arc<ServerConfig>,
}

impl MintedLeaf {
    pub fn cert_der(&self) -> &[u8] {
        &self.cert_der
    }

    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.server_config)
    }
}

struct CacheEntry {
    leaf: Arc<MintedLeaf>,
    expires_at: Instant,
}

/// Host -> minted leaf cache in front of the CA.
pub struct LeafCache {
    ca: Arc<CaStore>,
    entries: RwLock<HashMap<String, CacheEntry>>,
    capacity: usize,
    ttl: Duration,
}

impl LeafCache {
    pub fn new(ca: Arc<CaStore>) -> Self {
        Self::with_capacity(ca, CACHE_CAPACITY)
    }

    pub fn with_capacity(ca: Arc<CaStore>, capacity: usize) -> Self {
        Self::with_options(ca, capacity, CACHE_TTL)
    }

    pub fn with_options(ca: Arc<CaStore>, capacity: usize, ttl: Duration) -> Self {
        Self {
            ca,
            entries: RwLock::new(HashMap::new()),
            capacity,
            ttl,
        }
    }

    /// Returns the certificate for `host`, minting one on miss or expiry.
    ///
    /// The host string (with any `:port`) is the cache key verbatim; the
    /// certificate itself is issued for the port-stripped name. Signing
    /// runs on the blocking executor without holding the lock, so two
    /// concurrent misses for one host may both sign; the harmless
    /// duplicate is overwritten on insert.
    pub async fn get(&self, host: &str) -> Result<Arc<MintedLeaf>, LeafError> {
        let now = Instant::now();
        {
            let entries = self.entries.read();
            if let Some(entry) = entries.get(host) {
                if now < entry.expires_at {
                    debug!(host, "certificate cache hit");
                    return Ok(Arc::clone(&entry.leaf));
                }
            }
        }
        // Drop any expired entry before re-minting.
        self.entries.write().remove(host);

        debug!(host, "minting certificate");
        let ca = Arc::clone(&self.ca);
        let owned_host = host.to_string();
        let leaf = tokio::task::spawn_blocking(move || sign_host(&ca, &owned_host))
            .await
            .map_err(|e| LeafError::Join(e.to_string()))??;
        let leaf = Arc::new(leaf);

        let mut entries = self.entries.write();
        if entries.len() >= self.capacity {
            evict_closest_to_expiry(&mut entries);
        }
        entries.insert(
            host.to_string(),
            CacheEntry {
                leaf: Arc::clone(&leaf),
                expires_at: Instant::now() + self.ttl,
            },
        );

        Ok(leaf)
    }

    /// Drops all cached entries.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// `(total, expired)` entry counts.
    pub fn stats(&self) -> (usize, usize) {
        let entries = self.entries.read();
        let now = Instant::now();
        let expired = entries.values().filter(|e| now >= e.expires_at).count();
        (entries.len(), expired)
    }

    pub fn contains(&self, host: &str) -> bool {
        self.entries.read().contains_key(host)
    }

    /// Spawns the hourly best-effort sweep of already-expired entries.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = cache.sweep_expired();
                if removed > 0 {
                    debug!(removed, "swept expired certificates");
                }
            }
        })
    }

    fn sweep_expired(&self) -> usize {
        let mut entries = self.entries.write();
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, entry| now < entry.expires_at);
        before - entries.len()
    }
}

impl std::fmt::Debug for LeafCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (total, expired) = self.stats();
        f.debug_struct("LeafCache")
            .field("capacity", &self.capacity)
            .field("total", &total)
            .field("expired", &expired)
            .finish()
    }
}

fn evict_closest_to_expiry(entries: &mut HashMap<String, CacheEntry>) {
    let oldest = entries
        .iter()
        .min_by_key(|(_, entry)| entry.expires_at)
        .map(|(host, _)| host.clone());
    if let Some(host) = oldest {
        debug!(host = %host, "evicting certificate closest to expiry");
        entries.remove(&host);
    }
}

/// The certificate subject: any `:port` suffix removed.
fn san_host(host: &str) -> &str {
    host.split(':').next().unwrap_or(host)
}

fn sign_host(ca: &CaStore, host: &str) -> Result<MintedLeaf, LeafError> {
    let host_name = san_host(host);

    let rsa_key = RsaPrivateKey::new(&mut rand::rngs::OsRng, LEAF_KEY_BITS)
        .map_err(|e| LeafError::KeyGeneration(e.to_string()))?;
    let key_pem = rsa_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| LeafError::KeyGeneration(e.to_string()))?;
    let key_pair = KeyPair::from_pem(&key_pem).map_err(|e| LeafError::KeyGeneration(e.to_string()))?;

    // CertificateParams::new derives the SAN from the name: IP literals
    // become IP SANs, anything else a DNS SAN.
    let mut params = CertificateParams::new(vec![host_name.to_string()]).map_err(|e| {
        LeafError::Signing {
            host: host.to_string(),
            reason: e.to_string(),
        }
    })?;
    params.distinguished_name.push(DnType::CommonName, host_name);
    params
        .distinguished_name
        .push(DnType::OrganizationName, "ProxyMan Inc.");
    params.key_usages = vec![
        KeyUsagePurpose::KeyEncipherment,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.serial_number = Some(SerialNumber::from(LEAF_SERIAL));
    params.not_before = time::OffsetDateTime::now_utc();
    params.not_after = time::OffsetDateTime::now_utc() + time::Duration::days(LEAF_VALIDITY_DAYS);

    let cert = params
        .signed_by(&key_pair, ca.issuer())
        .map_err(|e| LeafError::Signing {
            host: host.to_string(),
            reason: e.to_string(),
        })?;

    let cert_der = cert.der().to_vec();
    let key_der = PrivatePkcs8KeyDer::from(key_pair.serialize_der());

    let mut server_config = ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::aws_lc_rs::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| LeafError::TlsConfig(e.to_string()))?
    .with_no_client_auth()
    .with_single_cert(vec![CertificateDer::from(cert_der.clone())], key_der.into())
    .map_err(|e| LeafError::TlsConfig(e.to_string()))?;

    // HTTP/1.1 only: the inner parser does not speak h2.
    server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(MintedLeaf {
        cert_der,
        server_config: Arc::new(server_config),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_ca(dir: &TempDir) -> Arc<CaStore> {
        Arc::new(CaStore::initialize_with_key_bits(dir.path(), 2048).unwrap())
    }

    #[test]
    fn san_host_strips_port() {
        assert_eq!(san_host("example.test:443"), "example.test");
        assert_eq!(san_host("example.test"), "example.test");
        assert_eq!(san_host("10.0.0.1:8443"), "10.0.0.1");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cache_returns_same_leaf_within_ttl() {
        let dir = TempDir::new().unwrap();
        let cache = LeafCache::with_capacity(test_ca(&dir), 4);

        let first = cache.get("example.test:443").await.unwrap();
        let second = cache.get("example.test:443").await.unwrap();
        assert_eq!(first.cert_der(), second.cert_der());

        let (total, expired) = cache.stats();
        assert_eq!(total, 1);
        assert_eq!(expired, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn expired_entries_are_reminted() {
        let dir = TempDir::new().unwrap();
        let cache = LeafCache::with_options(test_ca(&dir), 4, Duration::from_millis(0));

        let first = cache.get("example.test:443").await.unwrap();
        let second = cache.get("example.test:443").await.unwrap();
        assert_ne!(first.cert_der(), second.cert_der());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn insert_at_capacity_evicts_closest_to_expiry() {
        let dir = TempDir::new().unwrap();
        let cache = LeafCache::with_capacity(test_ca(&dir), 3);

        cache.get("a.test:443").await.unwrap();
        cache.get("b.test:443").await.unwrap();
        cache.get("c.test:443").await.unwrap();
        cache.get("d.test:443").await.unwrap();

        let (total, _) = cache.stats();
        assert_eq!(total, 3);
        // "a" was inserted first, so its expiry is the earliest.
        assert!(!cache.contains("a.test:443"));
        assert!(cache.contains("d.test:443"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn clear_drops_everything() {
        let dir = TempDir::new().unwrap();
        let cache = LeafCache::with_capacity(test_ca(&dir), 4);

        cache.get("a.test:443").await.unwrap();
        cache.clear();
        assert_eq!(cache.stats(), (0, 0));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sweep_removes_only_expired() {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(LeafCache::with_options(
            test_ca(&dir),
            4,
            Duration::from_millis(0),
        ));
        cache.get("a.test:443").await.unwrap();

        assert_eq!(cache.sweep_expired(), 1);
        assert_eq!(cache.stats(), (0, 0));
    }
}
