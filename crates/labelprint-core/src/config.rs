//! Printer configuration
//!
//! Loaded from JSON; every field has a default so a partial file is fine.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::protocol::{DEFAULT_BAUD_RATE, DEFAULT_READ_TIMEOUT_MS};

/// Valid print density levels
pub const DENSITY_RANGE: (u8, u8) = (1, 5);

/// Valid label type codes
pub const LABEL_TYPE_RANGE: (u8, u8) = (1, 3);

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{setting} must be between {min} and {max}, got {value}")]
    OutOfRange {
        setting: &'static str,
        value: u8,
        min: u8,
        max: u8,
    },

    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_json::Error),
}

fn check_range(setting: &'static str, value: u8, (min, max): (u8, u8)) -> Result<u8, ConfigError> {
    if (min..=max).contains(&value) {
        Ok(value)
    } else {
        Err(ConfigError::OutOfRange {
            setting,
            value,
            min,
            max,
        })
    }
}

/// Validate a print density level
pub fn validate_density(value: u8) -> Result<u8, ConfigError> {
    check_range("density", value, DENSITY_RANGE)
}

/// Validate a label type code
pub fn validate_label_type(value: u8) -> Result<u8, ConfigError> {
    check_range("label type", value, LABEL_TYPE_RANGE)
}

/// Which serial port to use
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PortSelection {
    /// Use the only serial port present
    #[default]
    Auto,
    /// Use this port
    Explicit(String),
}

impl From<String> for PortSelection {
    fn from(value: String) -> Self {
        if value.eq_ignore_ascii_case("auto") || value.is_empty() {
            PortSelection::Auto
        } else {
            PortSelection::Explicit(value)
        }
    }
}

impl From<PortSelection> for String {
    fn from(value: PortSelection) -> Self {
        match value {
            PortSelection::Auto => "auto".to_string(),
            PortSelection::Explicit(name) => name,
        }
    }
}

/// Serial link settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Port name or "auto"
    pub port: PortSelection,
    /// Baud rate
    pub baud_rate: u32,
    /// Per-read timeout in milliseconds
    pub read_timeout_ms: u64,
    /// Pause between closing and reopening the port
    pub reconnect_delay_ms: u64,
    /// Pause after reopening before talking to the printer
    pub reopen_settle_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            port: PortSelection::Auto,
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            reconnect_delay_ms: 2000,
            reopen_settle_ms: 1000,
        }
    }
}

impl LinkConfig {
    /// Per-read timeout
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Pause inside a reconnect
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Settle time after reopening
    pub fn reopen_settle(&self) -> Duration {
        Duration::from_millis(self.reopen_settle_ms)
    }
}

/// Label media settings applied at initialization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LabelConfig {
    /// Print density (1-5)
    pub density: u8,
    /// Label type (1-3)
    pub label_type: u8,
    /// Lowest acceptable battery level reported by heartbeat
    pub min_power_level: u8,
}

impl Default for LabelConfig {
    fn default() -> Self {
        Self {
            density: 5,
            label_type: 1,
            min_power_level: 1,
        }
    }
}

impl LabelConfig {
    /// Check density and label type
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_density(self.density)?;
        validate_label_type(self.label_type)?;
        Ok(())
    }
}

/// Protocol timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Polling rounds before a request times out
    pub response_rounds: u32,
    /// Delay between polling rounds
    pub round_delay_ms: u64,
    /// Upper bound for waiting on page completion
    pub progress_timeout_ms: u64,
    /// Delay between print status polls
    pub progress_poll_ms: u64,
    /// Pause between reconnecting and retrying a failed health heartbeat
    pub health_retry_delay_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            response_rounds: 6,
            round_delay_ms: 100,
            progress_timeout_ms: 30_000,
            progress_poll_ms: 10,
            health_retry_delay_ms: 1000,
        }
    }
}

impl TimingConfig {
    /// Delay between polling rounds
    pub fn round_delay(&self) -> Duration {
        Duration::from_millis(self.round_delay_ms)
    }

    /// Page completion bound
    pub fn progress_timeout(&self) -> Duration {
        Duration::from_millis(self.progress_timeout_ms)
    }

    /// Print status poll interval
    pub fn progress_poll(&self) -> Duration {
        Duration::from_millis(self.progress_poll_ms)
    }

    /// Pause before retrying the heartbeat in a health check
    pub fn health_retry_delay(&self) -> Duration {
        Duration::from_millis(self.health_retry_delay_ms)
    }
}

/// Connection monitor settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    /// Heartbeat interval
    pub interval_ms: u64,
    /// Consecutive failed reinitializations before giving up
    pub max_reinit_attempts: u32,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval_ms: 5000,
            max_reinit_attempts: 3,
        }
    }
}

impl MonitorSettings {
    /// Heartbeat interval
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Complete printer configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrinterConfig {
    /// Serial link
    pub link: LinkConfig,
    /// Label media
    pub label: LabelConfig,
    /// Protocol timing
    pub timing: TimingConfig,
    /// Connection monitor
    pub monitor: MonitorSettings,
}

impl PrinterConfig {
    /// Parse from a JSON string and validate
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.label.validate()?;
        Ok(config)
    }

    /// Load from a JSON file and validate
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&content)
    }
}
