//! Engine configuration.
//!
//! [`EngineConfig`] carries the knobs of one engine instance. Values come from
//! `Default`, from the fluent setters on
//! [`EngineBuilder`](crate::engine::EngineBuilder), or from JSON:
//!
//! ```
//! use std::time::Duration;
//! use snep_exchange::config::EngineConfig;
//!
//! let config = EngineConfig::from_json(r#"{ "max_connections": 8, "response_timeout_ms": 250 }"#).unwrap();
//! assert_eq!(config.max_connections, 8);
//! assert_eq!(config.response_timeout, Duration::from_millis(250));
//! assert_eq!(config.version, 0x10);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SnepError};
use crate::protocol::{MAJOR_VERSION_MASK, VERSION};

/// Default number of records (registrations and connections).
pub const DEFAULT_MAX_CONNECTIONS: usize = 6;

/// Default response timer.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Default capacity of the driver's command channel.
pub const DEFAULT_COMMAND_CAPACITY: usize = 64;

/// Default interval at which a driven engine re-polls its link.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Configuration of one engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Size of the record arena. Registrations count against it too.
    pub max_connections: usize,
    /// How long a client waits for the peer after a request or continuation.
    pub response_timeout: Duration,
    /// Protocol version byte sent and checked.
    pub version: u8,
    /// Capacity of the driver's command channel.
    pub command_capacity: usize,
    /// How often the driver polls the link when nothing else woke it.
    pub poll_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            version: VERSION,
            command_capacity: DEFAULT_COMMAND_CAPACITY,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// JSON shape of [`EngineConfig`]. Missing fields take their defaults.
#[derive(Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct EngineConfigFile {
    max_connections: usize,
    response_timeout_ms: u64,
    version: u8,
    command_capacity: usize,
    poll_interval_ms: u64,
}

impl Default for EngineConfigFile {
    fn default() -> Self {
        EngineConfig::default().into()
    }
}

impl From<EngineConfig> for EngineConfigFile {
    fn from(config: EngineConfig) -> Self {
        Self {
            max_connections: config.max_connections,
            response_timeout_ms: config.response_timeout.as_millis() as u64,
            version: config.version,
            command_capacity: config.command_capacity,
            poll_interval_ms: config.poll_interval.as_millis() as u64,
        }
    }
}

impl EngineConfig {
    /// Parse and validate a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self> {
        let file: EngineConfigFile = serde_json::from_str(json)?;
        let config = Self {
            max_connections: file.max_connections,
            response_timeout: Duration::from_millis(file.response_timeout_ms),
            version: file.version,
            command_capacity: file.command_capacity,
            poll_interval: Duration::from_millis(file.poll_interval_ms),
        };
        config.validate()?;
        Ok(config)
    }

    /// Serialize to the JSON shape accepted by [`from_json`](Self::from_json).
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&EngineConfigFile::from(self.clone()))?)
    }

    /// Check every field is usable.
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 || self.max_connections > usize::from(u16::MAX) {
            return Err(SnepError::Config(format!(
                "max_connections must be 1..={}, got {}",
                u16::MAX,
                self.max_connections
            )));
        }
        if self.response_timeout.is_zero() || self.poll_interval.is_zero() {
            return Err(SnepError::Config(
                "response_timeout and poll_interval must be non-zero".to_string(),
            ));
        }
        if self.version & MAJOR_VERSION_MASK == 0 {
            return Err(SnepError::Config(format!(
                "version 0x{:02X} has no major version",
                self.version
            )));
        }
        if self.command_capacity == 0 {
            return Err(SnepError::Config(
                "command_capacity must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
