// Copyright 2026 the sppbench authors
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
//! Handles loading and saving application settings.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::speed::{TestConfig, TestLimit, TestMode};

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Transport settings.
    pub net: NetConfig,

    /// Default throughput test parameters.
    pub test: TestSettings,

    /// Chat path settings.
    pub chat: ChatConfig,

    /// In-memory history caps.
    pub history: HistoryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    /// Address the server binds when none is given on the command line.
    pub listen_addr: String,

    /// Disable Nagle on accepted/dialed sockets.
    pub nodelay: bool,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:7400".to_string(),
            nodelay: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TestSettings {
    /// Free-running test duration in milliseconds.
    pub duration_ms: u64,

    /// Per-write payload size in bytes.
    pub payload_size: usize,

    /// Directions to exercise: "tx_only", "rx_only" or "duplex".
    pub mode: TestMode,

    /// Verify inbound payload against the expected pattern.
    pub verify: bool,
}

impl Default for TestSettings {
    fn default() -> Self {
        Self {
            duration_ms: 5000,
            payload_size: 4096,
            mode: TestMode::Duplex,
            verify: false,
        }
    }
}

impl TestSettings {
    /// Build an engine configuration from these defaults.
    pub fn to_test_config(&self) -> TestConfig {
        TestConfig {
            mode: self.mode,
            limit: TestLimit::Duration(Duration::from_millis(self.duration_ms)),
            payload_size: self.payload_size,
            verify: self.verify,
            ..TestConfig::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Per-read cap on the chat path, in bytes.
    pub read_size: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self { read_size: 1024 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Retained chat messages.
    pub chat_cap: usize,

    /// Retained throughput samples per run.
    pub sample_cap: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            chat_cap: 500,
            sample_cap: 400,
        }
    }
}

impl Config {
    /// Load configuration from the user config directory, creating the
    /// default file on first run.
    pub fn load() -> Result<Self> {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sppbench");

        std::fs::create_dir_all(&config_dir)?;

        Self::load_from(&config_dir.join("config.toml"))
    }

    /// Load configuration from a specific path, writing the default there
    /// if the file does not exist yet.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&content)?)
        } else {
            let config = Self::default();
            let content = toml::to_string_pretty(&config)?;
            std::fs::write(path, content)?;
            Ok(config)
        }
    }

    /// Save configuration to file.
    #[allow(dead_code)]
    pub fn save(&self) -> Result<()> {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sppbench");

        let config_path = config_dir.join("config.toml");
        let content = toml::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_survive_a_toml_roundtrip() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back.test.duration_ms, 5000);
        assert_eq!(back.test.payload_size, 4096);
        assert_eq!(back.test.mode, TestMode::Duplex);
        assert_eq!(back.chat.read_size, 1024);
        assert_eq!(back.net.listen_addr, "0.0.0.0:7400");
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let back: Config = toml::from_str("[test]\nduration_ms = 250\n").unwrap();
        assert_eq!(back.test.duration_ms, 250);
        assert_eq!(back.test.payload_size, 4096);
        assert_eq!(back.history.chat_cap, 500);
    }

    #[test]
    fn first_load_writes_the_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let first = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(first.test.payload_size, 4096);
        // Second load reads the file it just wrote.
        let second = Config::load_from(&path).unwrap();
        assert_eq!(second.net.nodelay, first.net.nodelay);
    }

    #[test]
    fn test_settings_map_to_engine_config() {
        let settings = TestSettings {
            duration_ms: 2000,
            payload_size: 512,
            mode: TestMode::TxOnly,
            verify: true,
        };
        let config = settings.to_test_config();
        assert_eq!(config.mode, TestMode::TxOnly);
        assert_eq!(config.limit, TestLimit::Duration(Duration::from_millis(2000)));
        assert_eq!(config.payload_size, 512);
        assert!(config.verify);
    }
}
