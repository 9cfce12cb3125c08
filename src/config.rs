//! Proxy configuration, loaded from TOML.
//!
//! ```toml
//! listen_address = "127.0.0.1:6432"
//! dsn = "postgres://app:secret@db:5432/orders"
//!
//! [pool]
//! max_idle = 3
//! max_open = 3
//! max_lifetime_secs = 3600
//! max_idle_time_secs = 300
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{PoolerError, Result};
use crate::pool::PoolConfig;
use crate::server::DEFAULT_SERVER_VERSION;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Address clients connect to
    pub listen_address: String,
    /// Backend connection string
    pub dsn: String,
    /// `server_version` announced to clients
    pub server_version: String,
    pub pool: PoolSettings,
}

/// Pool limits as written in the config file. Zero disables a duration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub max_idle: i32,
    pub max_open: i32,
    pub max_lifetime_secs: u64,
    pub max_idle_time_secs: u64,
    pub acquire_timeout_ms: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1:6432".to_string(),
            dsn: "postgres://postgres@localhost:5432/postgres".to_string(),
            server_version: DEFAULT_SERVER_VERSION.to_string(),
            pool: PoolSettings::default(),
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_idle: 3,
            max_open: 3,
            max_lifetime_secs: 60 * 60,
            max_idle_time_secs: 5 * 60,
            acquire_timeout_ms: 0,
        }
    }
}

impl ProxyConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            PoolerError::ConfigError(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| PoolerError::ConfigError(e.to_string()))
    }

    pub fn pool_config(&self) -> PoolConfig {
        let secs = |s: u64| (s > 0).then_some(Duration::from_secs(s));

        PoolConfig {
            dsn: self.dsn.clone(),
            max_idle: self.pool.max_idle,
            max_open: self.pool.max_open,
            max_lifetime: secs(self.pool.max_lifetime_secs),
            max_idle_time: secs(self.pool.max_idle_time_secs),
            acquire_timeout: (self.pool.acquire_timeout_ms > 0)
                .then_some(Duration::from_millis(self.pool.acquire_timeout_ms)),
        }
    }
}
