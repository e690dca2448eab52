// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Configuration file support for plm-server.
//!
//! Reads the `[plm-server]` section of `plm-rs.toml`, searched in:
//! 1. `./plm-rs.toml`
//! 2. `~/.config/plm-rs/plm-rs.toml`
//! 3. `/etc/plm-rs/plm-rs.toml`

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use plm_app::{ConfigError, ConfigFile};
use plm_core::{DeviceAddress, FeatureConfig};

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub general: GeneralConfig,
    pub modem: ModemConfig,
    pub polling: PollingConfig,
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// One of trace, debug, info, warn, error.
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModemConfig {
    /// Transport name as registered with the backend.
    pub transport: String,
    /// Address of the modem itself.
    pub address: DeviceAddress,
    /// Reply latency of simulated devices.
    pub reply_delay_ms: u64,
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            transport: "loopback".to_string(),
            address: DeviceAddress::new(0x44, 0x85, 0x11),
            reply_delay_ms: 150,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Poll interval for devices that don't set their own.
    pub poll_interval_ms: u64,
    /// Minimum gap between any two poll entries.
    pub min_spacing_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 300_000,
            min_spacing_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub address: DeviceAddress,
    #[serde(default)]
    pub battery: bool,
    /// Overrides `[polling].poll_interval_ms`. Zero disables polling.
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
    #[serde(default)]
    pub features: Vec<FeatureConfig>,
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), String> {
        validate_log_level(self.general.log_level.as_deref())?;

        if self.modem.transport.trim().is_empty() {
            return Err("[modem].transport must not be empty".to_string());
        }
        if self.polling.min_spacing_ms == 0 {
            return Err("[polling].min_spacing_ms must be > 0".to_string());
        }
        if self.polling.poll_interval_ms == 0 {
            return Err("[polling].poll_interval_ms must be > 0".to_string());
        }

        let mut seen = HashSet::new();
        for device in &self.devices {
            if !seen.insert(device.address) {
                return Err(format!("[[devices]] address {} listed twice", device.address));
            }
            if device.address == self.modem.address {
                return Err(format!(
                    "[[devices]] address {} is the modem address",
                    device.address
                ));
            }
            let mut names = HashSet::new();
            for feature in &device.features {
                if !names.insert(feature.name.as_str()) {
                    return Err(format!(
                        "device {}: feature '{}' listed twice",
                        device.address, feature.name
                    ));
                }
            }
        }
        Ok(())
    }

    /// Load from `path` when given, otherwise from the default search paths.
    /// Returns default config if no config file is found.
    pub fn resolve(path: Option<&Path>) -> Result<(Self, Option<PathBuf>), ConfigError> {
        <Self as ConfigFile>::resolve(path)
    }

    pub fn min_poll_spacing(&self) -> Duration {
        Duration::from_millis(self.polling.min_spacing_ms)
    }

    /// Effective poll interval for a device, `None` when polling is off.
    pub fn poll_interval(&self, device: &DeviceConfig) -> Option<Duration> {
        match device.poll_interval_ms.unwrap_or(self.polling.poll_interval_ms) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// Example configuration under the `[plm-server]` section header,
    /// suitable for use in a combined `plm-rs.toml` file.
    pub fn example_combined_toml() -> String {
        r#"[plm-server.general]
log_level = "info"

[plm-server.modem]
transport = "loopback"
address = "44.85.11"
reply_delay_ms = 150

[plm-server.polling]
poll_interval_ms = 300000
min_spacing_ms = 2000

[[plm-server.devices]]
address = "1A.2B.3C"

[[plm-server.devices.features]]
name = "dimmer"
poll = "status"
answer = "ack"

[[plm-server.devices.features]]
name = "ping"
poll = "ping"
answer = "ack"
poll_always = false

[[plm-server.devices]]
address = "2A.B0.01"
battery = true
poll_interval_ms = 0

[[plm-server.devices.features]]
name = "contact"
group = 1
"#
        .to_string()
    }
}

fn validate_log_level(level: Option<&str>) -> Result<(), String> {
    if let Some(level) = level {
        match level {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(format!(
                    "[general].log_level '{}' is invalid (expected one of: trace, debug, info, warn, error)",
                    level
                ))
            }
        }
    }
    Ok(())
}

impl ConfigFile for ServerConfig {
    fn section_key() -> &'static str {
        "plm-server"
    }

    fn validate(&self) -> Result<(), ConfigError> {
        ServerConfig::validate(self).map_err(ConfigError::Invalid)
    }
}
