//! # Configuration
//!
//! TOML configuration for the link supervisor and the command-line tool. Every
//! section is optional and falls back to its defaults.
//!
//! ```toml
//! [supervisor]
//! reconnect_delay_ms = 1000
//! op_timeout_ms = 5000
//! rescan_after_link_loss = false
//! channel = 0
//!
//! [devices]
//! preferred_device_id = "C4:DE:E2:11:22:33"
//!
//! [logging]
//! level = "info"
//! file = "meshlink.log"
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use meshlink::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     config.validate()?;
//!     println!("reconnect delay: {} ms", config.supervisor.reconnect_delay_ms);
//!     Ok(())
//! }
//! ```

use crate::transport::DeviceId;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::fs;

/// Upper bound for the reconnect delay.
pub const MAX_RECONNECT_DELAY_MS: u64 = 60_000;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub supervisor: SupervisorSection,
    #[serde(default)]
    pub devices: DevicesConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorSection {
    /// Fixed delay before the single retry after a link timeout.
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// Bound applied to every transport operation.
    #[serde(default = "default_op_timeout_ms")]
    pub op_timeout_ms: u64,
    /// Start a fresh scan after an unsolicited disconnect drops the session to idle.
    #[serde(default)]
    pub rescan_after_link_loss: bool,
    /// Channel index used for outbound text.
    #[serde(default)]
    pub channel: u32,
}

fn default_reconnect_delay_ms() -> u64 {
    1000
}

fn default_op_timeout_ms() -> u64 {
    5000
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: default_reconnect_delay_ms(),
            op_timeout_ms: default_op_timeout_ms(),
            rescan_after_link_loss: false,
            channel: 0,
        }
    }
}

/// Remembered devices consulted by the reconnect path of `send`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DevicesConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_connected_device_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let s = &self.supervisor;
        if s.reconnect_delay_ms == 0 || s.reconnect_delay_ms > MAX_RECONNECT_DELAY_MS {
            return Err(anyhow!(
                "supervisor.reconnect_delay_ms must be within 1..={} (got {})",
                MAX_RECONNECT_DELAY_MS,
                s.reconnect_delay_ms
            ));
        }
        if s.op_timeout_ms == 0 {
            return Err(anyhow!("supervisor.op_timeout_ms must be greater than 0"));
        }
        for (key, value) in [
            ("preferred_device_id", &self.devices.preferred_device_id),
            ("last_connected_device_id", &self.devices.last_connected_device_id),
        ] {
            if matches!(value, Some(v) if v.trim().is_empty()) {
                return Err(anyhow!("devices.{} must not be empty when set", key));
            }
        }
        if self.logging.level.parse::<log::LevelFilter>().is_err() {
            return Err(anyhow!("logging.level '{}' is not a log level", self.logging.level));
        }
        Ok(())
    }
}

/// Runtime settings of the connection supervisor.
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorConfig {
    pub reconnect_delay: Duration,
    pub op_timeout: Duration,
    pub rescan_after_link_loss: bool,
    pub channel: u32,
    pub preferred_device: Option<DeviceId>,
    pub last_connected_device: Option<DeviceId>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for SupervisorConfig {
    fn from(config: &Config) -> Self {
        let s = &config.supervisor;
        Self {
            reconnect_delay: Duration::from_millis(s.reconnect_delay_ms),
            op_timeout: Duration::from_millis(s.op_timeout_ms),
            rescan_after_link_loss: s.rescan_after_link_loss,
            channel: s.channel,
            preferred_device: config.devices.preferred_device_id.clone().map(DeviceId),
            last_connected_device: config
                .devices
                .last_connected_device_id
                .clone()
                .map(DeviceId),
        }
    }
}
