//! Configuration for the Switchboard relay
//!
//! Supports TOML configuration files with sensible defaults. The
//! resulting [`Config`] is immutable once handed to the server.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::{DEFAULT_HEALTH_PATH, DEFAULT_KEEPALIVE_TIMEOUT_SECS, DEFAULT_PORT};

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bind address
    pub bind: IpAddr,
    /// Port to listen on
    pub port: u16,
    /// Keepalive timeout in seconds (idle time before a ping is sent)
    pub keepalive_timeout_secs: u64,
    /// Health check route
    pub health_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            keepalive_timeout_secs: DEFAULT_KEEPALIVE_TIMEOUT_SECS,
            health_path: DEFAULT_HEALTH_PATH.to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, falling back to defaults
    /// when the file does not exist.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        Ok(config)
    }

    /// Socket address to bind the listener to
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    /// Keepalive timeout as a [`Duration`]
    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_secs(self.keepalive_timeout_secs)
    }
}

/// Configuration errors
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("parse error: {0}")]
    Parse(String),
}
