//! Server configuration, read from a TOML file.
//!
//! ```toml
//! bind_address = "0.0.0.0:8080"
//! bandwidth_interval_secs = 10
//!
//! [log]
//! level = "debug"
//!
//! [http]
//! max_keep_alive = 50
//! proxy_ips = ["10.0.0.0/8"]
//! ```

use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use conduit_http::config::HttpConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("can't read config file: {0}")]
    Io(#[from] io::Error),

    #[error("can't parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,

    /// TLS is terminated in front of this server; only reported to dispatchers.
    pub ssl: bool,

    pub bandwidth_interval_secs: u64,

    pub log: LogConfig,

    pub http: HttpConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            ssl: false,
            bandwidth_interval_secs: 10,
            log: LogConfig::default(),
            http: HttpConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    /// Used when `RUST_LOG` is not set.
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

impl ServerConfig {
    /// Reads, parses and validates `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: ServerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Semantic checks; address ranges are already checked while parsing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bind_address()?;
        if self.bandwidth_interval_secs == 0 {
            return Err(ConfigError::Invalid("bandwidth_interval_secs must be greater than 0".to_string()));
        }
        if self.log.level.parse::<tracing::Level>().is_err() {
            return Err(ConfigError::Invalid(format!("unknown log level `{}`", self.log.level)));
        }
        if self.http.max_keep_alive == 0 {
            return Err(ConfigError::Invalid("http.max_keep_alive must be greater than 0".to_string()));
        }
        Ok(())
    }

    pub fn bind_address(&self) -> Result<SocketAddr, ConfigError> {
        self.bind_address
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("bind_address `{}`: {e}", self.bind_address)))
    }

    pub fn bandwidth_interval(&self) -> Duration {
        Duration::from_secs(self.bandwidth_interval_secs)
    }
}
