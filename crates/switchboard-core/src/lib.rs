//! Switchboard Core - Shared types, configuration, and wire protocol
//!
//! This crate contains the foundational types used by the Switchboard
//! signaling relay. It has no dependencies on networking code.

pub mod config;
pub mod error;
pub mod protocol;

pub use config::{Config, ConfigError};
pub use error::*;
pub use protocol::*;

/// Default WebSocket port
pub const DEFAULT_PORT: u16 = 8443;

/// Default keepalive timeout in seconds
pub const DEFAULT_KEEPALIVE_TIMEOUT_SECS: u64 = 30;

/// Default health-check route
pub const DEFAULT_HEALTH_PATH: &str = "/health";
