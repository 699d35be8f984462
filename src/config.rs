//! Reporter configuration.
//!
//! All knobs the reporter consumes live in one [`Config`]; the binary fills
//! it from CLI flags, tests build it directly.

use std::time::Duration;

use thiserror::Error;

use crate::packet::path_segments;

/// IANA-assigned CoAP port.
pub const DEFAULT_PORT: u16 = 5683;

/// How long one exchange waits for its reply.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause between the end of one report and the start of the next.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

/// Delay before the first report after startup.
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("server host must not be empty")]
    EmptyHost,
    #[error("server port must not be 0")]
    ZeroPort,
    #[error("receive timeout must be greater than zero")]
    ZeroTimeout,
    #[error("device id must be a single non-empty path segment, got {0:?}")]
    InvalidDeviceId(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Server host name or IP literal.
    pub host: String,
    pub port: u16,
    /// Receive deadline for every exchange.
    pub timeout: Duration,
    /// Device access token embedded in the telemetry path.
    pub device_id: String,
    pub interval: Duration,
    pub initial_delay: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            timeout: DEFAULT_TIMEOUT,
            device_id: String::new(),
            interval: DEFAULT_INTERVAL,
            initial_delay: DEFAULT_INITIAL_DELAY,
        }
    }
}

impl Config {
    pub fn new(host: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            device_id: device_id.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        if self.port == 0 {
            return Err(ConfigError::ZeroPort);
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        // The id must survive as exactly one Uri-Path segment.
        if self.device_id.contains('/') || path_segments(&self.telemetry_path()).is_err() {
            return Err(ConfigError::InvalidDeviceId(self.device_id.clone()));
        }
        Ok(())
    }

    /// Resource the telemetry is POSTed to.
    pub fn telemetry_path(&self) -> String {
        telemetry_path(&self.device_id)
    }
}

pub fn telemetry_path(device_id: &str) -> String {
    format!("api/v1/{device_id}/telemetry")
}
