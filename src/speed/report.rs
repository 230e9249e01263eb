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

//! Result, sample and diagnostics records produced by a throughput run.
//!
//! Rates are bytes per second throughout, not bits.

use serde::{Deserialize, Serialize};

/// Periodic progress snapshot, emitted every monitor tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThroughputSample {
    pub elapsed_ms: u64,
    /// Rate over the last tick interval.
    pub tx_instant_bps: f64,
    pub rx_instant_bps: f64,
    /// Rate since the first byte of that direction (zero until then).
    pub tx_avg_bps: f64,
    pub rx_avg_bps: f64,
    pub tx_total_bytes: u64,
    pub rx_total_bytes: u64,
}

/// Latency aggregates for the run so far. Fields are `None` until the
/// corresponding operation has happened at least once.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LinkDiagnostics {
    pub tx_write_avg_ms: Option<f64>,
    pub tx_write_max_ms: Option<f64>,
    pub rx_read_avg_ms: Option<f64>,
    pub rx_read_max_ms: Option<f64>,
    pub rx_read_avg_bytes: Option<f64>,
    /// Run start to first successful write.
    pub tx_first_write_delay_ms: Option<u64>,
    /// Run start to first received byte.
    pub rx_first_byte_delay_ms: Option<u64>,
}

/// Final aggregate of one completed run. Averages use the time since the
/// first byte of that direction, so a late-starting direction is not
/// diluted by setup idle time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThroughputResult {
    pub tx_avg_bps: f64,
    pub rx_avg_bps: f64,
    pub tx_total_bytes: u64,
    pub rx_total_bytes: u64,
    /// Wall-clock run duration.
    pub elapsed_ms: u64,
    pub diagnostics: LinkDiagnostics,
}

/// Render a bytes-per-second rate with a 1024 divisor.
pub fn human_bps(bps: f64) -> String {
    const K: f64 = 1024.0;
    if bps < K {
        format!("{:.0} B/s", bps)
    } else if bps < K * K {
        format!("{:.1} KB/s", bps / K)
    } else if bps < K * K * K {
        format!("{:.1} MB/s", bps / (K * K))
    } else {
        format!("{:.2} GB/s", bps / (K * K * K))
    }
}

/// Render a byte count with a 1024 divisor.
pub fn human_bytes(bytes: u64) -> String {
    const K: u64 = 1024;
    if bytes < K {
        format!("{} B", bytes)
    } else if bytes < K * K {
        format!("{:.1} KB", bytes as f64 / K as f64)
    } else if bytes < K * K * K {
        format!("{:.1} MB", bytes as f64 / (K * K) as f64)
    } else {
        format!("{:.2} GB", bytes as f64 / (K * K * K) as f64)
    }
}
