// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Configuration module.
//!
//! Handles loading and saving link settings.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::state::Transport;
use crate::transport::{BleConfig, ConnectOptions};

/// Application configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default link settings.
    pub link: LinkConfig,

    /// Bluetooth settings.
    pub ble: BleConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Transport used when none is given on the command line.
    pub transport: Transport,

    /// Device address or port path to connect to by default.
    pub device: Option<String>,

    pub options: ConnectOptions,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            transport: Transport::Ble,
            device: None,
            options: ConnectOptions::default(),
        }
    }
}

impl Config {
    /// Default location of the configuration file.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("devicelink")
            .join("config.toml")
    }

    /// Load configuration from file or create default.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path())
    }

    /// Load from `path`, writing the defaults there if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let config = toml::from_str(&content)
                .with_context(|| format!("parsing {}", path.display()))?;
            Ok(config)
        } else {
            let config = Self::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save configuration to file.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::DelimiterMode;
    use tempfile::TempDir;

    #[test]
    fn test_creates_default_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("devicelink").join("config.toml");

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config, Config::default());
        assert!(path.exists());

        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[link]
transport = "serial"
device = "/dev/ttyUSB0"

[link.options]
baud_rate = 9600
reconnect = true
delimiter_mode = "binary"
"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.link.transport, Transport::Serial);
        assert_eq!(config.link.device.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(config.link.options.baud_rate, 9600);
        assert!(config.link.options.reconnect);
        assert_eq!(config.link.options.delimiter_mode, DelimiterMode::Binary);
        assert_eq!(config.link.options.reconnect_policy.max_attempts, 3);
        assert_eq!(config.ble, BleConfig::default());
    }

    #[test]
    fn test_save_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.ble.name_filter = Some("ESP32".to_string());
        config.link.options.reconnect_policy.max_delay_ms = 4_000;
        config.save_to(&path).unwrap();

        assert_eq!(Config::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[link]\ntransport = \"carrier-pigeon\"\n").unwrap();

        assert!(Config::load_from(&path).is_err());
    }
}
