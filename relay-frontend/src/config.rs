//! Frontend configuration.
//!
//! Command-line flags select the config file and log format; everything
//! else comes from a TOML file shared by the master and all workers
//! (workers re-read the same file the master was started with).
//!
//! ```toml
//! process_count = 4
//!
//! [web]
//! trust_proxy = ["127.0.0.1"]
//!
//! [[web.listeners]]
//! host = "0.0.0.0"
//! port = 8080
//! client_address = "ws.example.com:8080"
//!
//! [redis]
//! url = "redis://127.0.0.1:6379"
//! ```

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

/// Command-line arguments.
#[derive(Debug, Clone, Parser)]
#[command(name = "relay-frontend", about = "Realtime channel routing frontend")]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, env = "RELAY_CONFIG", default_value = "frontend.toml")]
    pub config: PathBuf,

    /// Emit JSON log lines instead of human-readable output.
    #[arg(long, env = "RELAY_LOG_JSON")]
    pub log_json: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid TOML in {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Root of the TOML configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FrontendConfig {
    /// Number of worker processes the master keeps alive.
    #[serde(default = "default_process_count")]
    pub process_count: usize,
    /// Prefix for per-process node ids (liveness keys).
    #[serde(default)]
    pub node_name: Option<String>,
    pub web: WebConfig,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub liveness: LivenessConfig,
    #[serde(default)]
    pub pool: PoolConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WebConfig {
    /// Direct peers whose `X-Forwarded-For` header is believed.
    #[serde(default)]
    pub trust_proxy: Vec<IpAddr>,
    /// How long the master waits for a new connection's first bytes.
    #[serde(default = "default_first_data_timeout_ms")]
    pub first_data_timeout_ms: u64,
    pub listeners: Vec<ListenerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenerConfig {
    pub host: String,
    pub port: u16,
    /// Connections on this listener are TLS and are terminated by the worker.
    #[serde(default)]
    pub tls: bool,
    /// Address advertised to clients through the frontend pool.
    #[serde(default)]
    pub client_address: Option<String>,
}

impl ListenerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn advertised_addr(&self) -> String {
        self.client_address.clone().unwrap_or_else(|| self.bind_addr())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self { url: default_redis_url() }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoutingConfig {
    /// Ownership records and pool entries older than this are stale.
    #[serde(default = "default_stale_ms")]
    pub ownership_stale_ms: u64,
    #[serde(default = "default_backend_pool")]
    pub backend_pool: String,
    #[serde(default = "default_ownership_key")]
    pub ownership_key: String,
    /// Exit the worker with the fatal code when no backend can own a channel.
    #[serde(default = "default_true")]
    pub fatal_on_no_backend: bool,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            ownership_stale_ms: default_stale_ms(),
            backend_pool: default_backend_pool(),
            ownership_key: default_ownership_key(),
            fatal_on_no_backend: true,
        }
    }
}

impl RoutingConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.ownership_stale_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LivenessConfig {
    #[serde(default = "default_liveness_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_liveness_ttl_ms")]
    pub ttl_ms: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_liveness_interval_ms(),
            ttl_ms: default_liveness_ttl_ms(),
        }
    }
}

impl LivenessConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolConfig {
    #[serde(default = "default_frontend_pool")]
    pub frontend_pool: String,
    #[serde(default = "default_pool_update_ms")]
    pub update_interval_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            frontend_pool: default_frontend_pool(),
            update_interval_ms: default_pool_update_ms(),
        }
    }
}

fn default_process_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
fn default_first_data_timeout_ms() -> u64 {
    10_000
}
fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}
fn default_stale_ms() -> u64 {
    10_000
}
fn default_backend_pool() -> String {
    "backend-hosts".to_string()
}
fn default_ownership_key() -> String {
    "channel-ownership".to_string()
}
fn default_true() -> bool {
    true
}
fn default_liveness_interval_ms() -> u64 {
    5_000
}
fn default_liveness_ttl_ms() -> u64 {
    7_500
}
fn default_frontend_pool() -> String {
    "frontend-hosts".to_string()
}
fn default_pool_update_ms() -> u64 {
    5_000
}

impl FrontendConfig {
    /// Load and validate the configuration file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.process_count == 0 {
            return Err(ConfigError::Invalid("process_count must be at least 1".into()));
        }
        if self.web.listeners.is_empty() {
            return Err(ConfigError::Invalid("at least one [[web.listeners]] entry is required".into()));
        }
        if self.liveness.interval_ms == 0 {
            return Err(ConfigError::Invalid("liveness.interval_ms must be positive".into()));
        }
        if self.pool.update_interval_ms == 0 {
            return Err(ConfigError::Invalid("pool.update_interval_ms must be positive".into()));
        }
        if self.liveness.ttl_ms < self.liveness.interval_ms {
            return Err(ConfigError::Invalid(format!(
                "liveness.ttl_ms ({}) must not be shorter than liveness.interval_ms ({})",
                self.liveness.ttl_ms, self.liveness.interval_ms
            )));
        }
        Ok(())
    }

    pub fn is_trusted_proxy(&self, ip: &IpAddr) -> bool {
        self.web.trust_proxy.contains(ip)
    }

    pub fn first_data_timeout(&self) -> Duration {
        Duration::from_millis(self.web.first_data_timeout_ms)
    }
}
