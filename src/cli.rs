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

//! Command line interface.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::anyhow;
use clap::{Args, Parser, Subcommand};

use crate::config::TestSettings;
use crate::speed::{TestConfig, TestLimit, TestMode};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "sppbench",
    about = "Duplex throughput tester for serial-style byte streams",
    version
)]
pub struct Cli {
    /// Use this config file instead of the default location
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Cmd {
    /// Listen for one inbound connection; chat and peer-triggered tests
    Serve(ServeOpts),
    /// Connect to a peer, then chat and run tests
    Dial(DialOpts),
    /// Run one test over an in-process loopback pair (no network)
    Loopback(TestOpts),
}

#[derive(Args, Debug, Clone)]
pub struct ServeOpts {
    /// Bind address (defaults to the configured listen address)
    #[arg(long)]
    pub addr: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct DialOpts {
    /// Peer address, host:port
    pub addr: String,

    #[command(flatten)]
    pub test: TestOpts,

    /// Send this text once connected instead of running a test
    #[arg(long)]
    pub send: Option<String>,

    /// Ask the peer to receive this many bytes instead of running locally
    #[arg(long, conflicts_with_all = ["duration_ms", "bytes", "mode"])]
    pub remote_rx: Option<u64>,
}

#[derive(Args, Debug, Clone)]
pub struct TestOpts {
    /// Test duration in milliseconds
    #[arg(long)]
    pub duration_ms: Option<u64>,

    /// Stop after this many bytes instead of a duration
    #[arg(long, conflicts_with = "duration_ms")]
    pub bytes: Option<u64>,

    /// Per-write payload size in bytes
    #[arg(long)]
    pub payload_size: Option<usize>,

    /// Directions: tx, rx or duplex
    #[arg(long)]
    pub mode: Option<String>,

    /// Verify inbound payload against the expected pattern
    #[arg(long, default_value_t = false)]
    pub verify: bool,

    /// Print the final report as JSON
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

impl TestOpts {
    /// Merge command line overrides onto the configured defaults.
    pub fn to_test_config(&self, defaults: &TestSettings) -> anyhow::Result<TestConfig> {
        let mut config = defaults.to_test_config();
        if let Some(mode) = &self.mode {
            config.mode = parse_mode(mode)?;
        }
        if let Some(ms) = self.duration_ms {
            config.limit = TestLimit::Duration(Duration::from_millis(ms));
        }
        if let Some(bytes) = self.bytes {
            config.limit = TestLimit::Bytes(bytes);
        }
        if let Some(size) = self.payload_size {
            config.payload_size = size;
        }
        if self.verify {
            config.verify = true;
        }
        Ok(config)
    }
}

pub fn parse_mode(text: &str) -> anyhow::Result<TestMode> {
    match text.to_ascii_lowercase().as_str() {
        "tx" | "tx_only" => Ok(TestMode::TxOnly),
        "rx" | "rx_only" => Ok(TestMode::RxOnly),
        "duplex" => Ok(TestMode::Duplex),
        other => Err(anyhow!(
            "unknown mode '{}', expected tx, rx or duplex",
            other
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_names_parse() {
        assert_eq!(parse_mode("tx").unwrap(), TestMode::TxOnly);
        assert_eq!(parse_mode("RX_ONLY").unwrap(), TestMode::RxOnly);
        assert_eq!(parse_mode("duplex").unwrap(), TestMode::Duplex);
        assert!(parse_mode("both").is_err());
    }

    #[test]
    fn overrides_replace_configured_defaults() {
        let defaults = TestSettings::default();
        let opts = TestOpts {
            duration_ms: None,
            bytes: Some(4096),
            payload_size: Some(256),
            mode: Some("tx".into()),
            verify: true,
            json: false,
        };
        let config = opts.to_test_config(&defaults).unwrap();
        assert_eq!(config.mode, TestMode::TxOnly);
        assert_eq!(config.limit, TestLimit::Bytes(4096));
        assert_eq!(config.payload_size, 256);
        assert!(config.verify);
    }

    #[test]
    fn no_overrides_keeps_defaults() {
        let defaults = TestSettings::default();
        let opts = TestOpts {
            duration_ms: None,
            bytes: None,
            payload_size: None,
            mode: None,
            verify: false,
            json: false,
        };
        let config = opts.to_test_config(&defaults).unwrap();
        assert_eq!(
            config.limit,
            TestLimit::Duration(Duration::from_millis(5000))
        );
        assert_eq!(config.payload_size, 4096);
    }
}
