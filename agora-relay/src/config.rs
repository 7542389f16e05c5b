//! Relay configuration.
//!
//! Loaded from environment variables with defaults. The Redis endpoint may
//! carry credentials and is redacted in Debug output.

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::hub::{HubConfig, DEFAULT_CHANNEL, DEFAULT_OUTBOUND_CAPACITY};

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 25_000;
pub const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 20_000;
pub const DEFAULT_PRESENCE_KEY: &str = "agora-relay:presence";
pub const DEFAULT_REDIS_PORT: u16 = 6379;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

#[derive(Clone)]
pub struct RelayConfig {
    /// WebSocket listen address.
    pub bind_addr: String,
    /// Server ping interval.
    pub heartbeat_interval: Duration,
    /// Extra grace after the interval before a silent connection is closed.
    pub heartbeat_timeout: Duration,
    /// Redis URL for presence and backplane. `None` runs single-process.
    pub redis_url: Option<String>,
    /// RocksDB directory for the durable log. `None` keeps events in memory.
    pub storage_path: Option<PathBuf>,
    pub backplane_channel: String,
    pub presence_key: String,
    pub outbound_capacity: usize,
}

impl fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayConfig")
            .field("bind_addr", &self.bind_addr)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("heartbeat_timeout", &self.heartbeat_timeout)
            .field("redis_url", &self.redis_url.as_ref().map(|_| "[REDACTED]"))
            .field("storage_path", &self.storage_path)
            .field("backplane_channel", &self.backplane_channel)
            .field("presence_key", &self.presence_key)
            .field("outbound_capacity", &self.outbound_capacity)
            .finish()
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            heartbeat_timeout: Duration::from_millis(DEFAULT_HEARTBEAT_TIMEOUT_MS),
            redis_url: None,
            storage_path: None,
            backplane_channel: DEFAULT_CHANNEL.to_string(),
            presence_key: DEFAULT_PRESENCE_KEY.to_string(),
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let bind_addr = vars
            .get("BIND_ADDR")
            .cloned()
            .unwrap_or(defaults.bind_addr);

        let heartbeat_interval = match vars.get("HEARTBEAT_INTERVAL") {
            Some(raw) => Duration::from_millis(parse_number("HEARTBEAT_INTERVAL", raw)?),
            None => defaults.heartbeat_interval,
        };
        let heartbeat_timeout = match vars.get("HEARTBEAT_TIMEOUT") {
            Some(raw) => Duration::from_millis(parse_number("HEARTBEAT_TIMEOUT", raw)?),
            None => defaults.heartbeat_timeout,
        };
        if heartbeat_interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "HEARTBEAT_INTERVAL must be greater than zero".to_string(),
            ));
        }

        let redis_url = vars
            .get("REDIS_ENDPOINT")
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(redis_url_for);

        let storage_path = vars
            .get("STORAGE_PATH")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        let backplane_channel = vars
            .get("BACKPLANE_CHANNEL")
            .cloned()
            .unwrap_or(defaults.backplane_channel);

        let presence_key = vars
            .get("PRESENCE_KEY")
            .cloned()
            .unwrap_or(defaults.presence_key);

        let outbound_capacity = match vars.get("OUTBOUND_CAPACITY") {
            Some(raw) => parse_number("OUTBOUND_CAPACITY", raw)?,
            None => defaults.outbound_capacity,
        };
        if outbound_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "OUTBOUND_CAPACITY must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            bind_addr,
            heartbeat_interval,
            heartbeat_timeout,
            redis_url,
            storage_path,
            backplane_channel,
            presence_key,
            outbound_capacity,
        })
    }

    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            channel: self.backplane_channel.clone(),
            outbound_capacity: self.outbound_capacity,
        }
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue(format!("{name} must be a number, got {raw:?}")))
}

/// A bare host becomes `redis://host:6379`; full URLs pass through.
fn redis_url_for(endpoint: &str) -> String {
    if endpoint.contains("://") {
        endpoint.to_string()
    } else if endpoint.contains(':') {
        format!("redis://{endpoint}")
    } else {
        format!("redis://{endpoint}:{DEFAULT_REDIS_PORT}")
    }
}
