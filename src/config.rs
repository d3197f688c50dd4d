//! Persisted application configuration
//!
//! Everything lives under `~/.proxyMan`: the JSON config, the CA key pair
//! and the log files. The config file holds the proxy listen address and
//! the upstream-proxy settings; API updates are written back immediately
//! so they survive restarts.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

pub const DEFAULT_PROXY_HOST: &str = "127.0.0.1";
pub const DEFAULT_PROXY_PORT: u16 = 8888;
pub const DEFAULT_OBSERVER_PORT: u16 = 8080;

const CONFIG_FILENAME: &str = "config.json";

/// How outbound requests reach the origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamMode {
    /// Direct connections.
    #[default]
    None,
    /// Follow HTTP_PROXY / HTTPS_PROXY / NO_PROXY.
    Env,
    /// A configured parent proxy.
    Custom,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamProxyConfig {
    pub mode: UpstreamMode,
    /// `http` or `socks5`; only meaningful in custom mode.
    pub protocol: String,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub proxy_host: String,
    pub proxy_port: u16,
    pub upstream_proxy: UpstreamProxyConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            proxy_host: DEFAULT_PROXY_HOST.to_string(),
            proxy_port: DEFAULT_PROXY_PORT,
            upstream_proxy: UpstreamProxyConfig::default(),
        }
    }
}

/// The per-user data directory (`~/.proxyMan`).
pub fn data_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("cannot determine home directory")?;
    Ok(home.join(".proxyMan"))
}

/// Where the CA key pair is persisted.
pub fn cert_dir(base: &Path) -> PathBuf {
    base.join("cert")
}

/// Where log files are written.
pub fn log_dir(base: &Path) -> PathBuf {
    base.join("log")
}

/// Loaded configuration with write-back persistence.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    state: RwLock<AppConfig>,
}

impl ConfigStore {
    /// Loads `<base>/config.json`, creating it with defaults on first run.
    pub fn load(base: &Path) -> Result<Self> {
        fs::create_dir_all(base)
            .with_context(|| format!("failed to create config dir {}", base.display()))?;
        let path = base.join(CONFIG_FILENAME);

        let config = if path.exists() {
            let data = fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str(&data)
                .with_context(|| format!("failed to parse {}", path.display()))?
        } else {
            let config = AppConfig::default();
            write_config(&path, &config)?;
            config
        };

        info!(path = %path.display(), "configuration loaded");
        Ok(Self {
            path,
            state: RwLock::new(config),
        })
    }

    pub fn snapshot(&self) -> AppConfig {
        self.state.read().clone()
    }

    /// Persists a new proxy listen address.
    pub fn update_proxy(&self, host: &str, port: u16) -> Result<()> {
        let mut state = self.state.write();
        let mut updated = state.clone();
        updated.proxy_host = host.to_string();
        updated.proxy_port = port;
        write_config(&self.path, &updated)?;
        *state = updated;
        Ok(())
    }

    /// Persists a new upstream-proxy configuration.
    pub fn update_upstream(&self, upstream: UpstreamProxyConfig) -> Result<()> {
        let mut state = self.state.write();
        let mut updated = state.clone();
        updated.upstream_proxy = upstream;
        write_config(&self.path, &updated)?;
        *state = updated;
        Ok(())
    }
}

fn write_config(path: &Path, config: &AppConfig) -> Result<()> {
    let data = serde_json::to_string_pretty(config).context("failed to serialize config")?;
    fs::write(path, data).with_context(|| format!("failed to write {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o644))
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }
    Ok(())
}
