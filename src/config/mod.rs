//! Gateway and client configuration.
//!
//! Every knob is an explicit value with a documented default; nothing is read
//! from global state. Durations are expressed in milliseconds in TOML:
//!
//! ```toml
//! event_capacity = 1024
//! max_frame_size = 16777216
//! send_queue_capacity = 256
//! send_timeout_ms = 10000
//!
//! [liveness]
//! tick_interval_ms = 30000
//! probe_timeout_ms = 10000
//!
//! [reconnect]
//! max_attempts = 10
//! base_delay_ms = 1000
//! max_delay_ms = 30000
//! multiplier = 2.0
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::frame::DEFAULT_MAX_FRAME_SIZE;
use crate::reconnect::ReconnectPolicy;

/// Errors produced while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for `{field}`: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

/// Liveness monitor timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    /// Interval between probe ticks. Default: 30 s.
    #[serde(rename = "tick_interval_ms", with = "millis")]
    pub tick_interval: Duration,
    /// Upper bound on a single probe send. Default: 10 s.
    #[serde(rename = "probe_timeout_ms", with = "millis")]
    pub probe_timeout: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(10),
        }
    }
}

/// Top-level configuration shared by the gateway and the client.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub liveness: LivenessConfig,
    pub reconnect: ReconnectPolicy,
    /// Per-subscriber notification backlog. Default: 1024.
    pub event_capacity: usize,
    /// Largest accepted frame payload in bytes. Default: 16 MiB.
    pub max_frame_size: usize,
    /// Outbound frame queue per connection. Default: 256.
    pub send_queue_capacity: usize,
    /// Upper bound on queueing one outbound message. Default: 10 s.
    #[serde(rename = "send_timeout_ms", with = "millis")]
    pub send_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            liveness: LivenessConfig::default(),
            reconnect: ReconnectPolicy::default(),
            event_capacity: 1024,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            send_queue_capacity: 256,
            send_timeout: Duration::from_secs(10),
        }
    }
}

impl GatewayConfig {
    /// Parses and validates a TOML document. Missing keys take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed TOML and
    /// [`ConfigError::Invalid`] when a value is out of range.
    pub fn from_toml_str(src: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(src)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let src = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_toml_str(&src)
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.liveness.tick_interval.is_zero() {
            return Err(ConfigError::Invalid {
                field: "liveness.tick_interval_ms",
                reason: "must be greater than zero",
            });
        }
        if self.liveness.probe_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                field: "liveness.probe_timeout_ms",
                reason: "must be greater than zero",
            });
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "event_capacity",
                reason: "must be greater than zero",
            });
        }
        if self.send_queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "send_queue_capacity",
                reason: "must be greater than zero",
            });
        }
        if self.send_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                field: "send_timeout_ms",
                reason: "must be greater than zero",
            });
        }
        if self.max_frame_size == 0 || self.max_frame_size > u32::MAX as usize {
            return Err(ConfigError::Invalid {
                field: "max_frame_size",
                reason: "must fit in 1..=u32::MAX",
            });
        }
        self.reconnect.validate()
    }
}

/// Reads a [`Duration`] from whole milliseconds.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
