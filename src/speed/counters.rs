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

//! Shared run counters.
//!
//! Sender and receiver tasks accumulate into task-local tallies and merge
//! into the shared atomics in batches, so the hot path stays lock-free and
//! the monitor reads an eventually consistent view. All values are plain
//! relaxed atomics; nothing here orders anything.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Local tallies merge into the shared counter once this many bytes are
/// pending.
pub const FLUSH_BATCH: u64 = 64 * 1024;

const UNSET: u64 = u64::MAX;

/// Running count/sum/max of an operation latency.
#[derive(Debug, Default)]
pub struct LatencyStat {
    count: AtomicU64,
    total_micros: AtomicU64,
    max_micros: AtomicU64,
}

impl LatencyStat {
    pub fn record(&self, elapsed: Duration) {
        let micros = elapsed.as_micros() as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_micros.fetch_add(micros, Ordering::Relaxed);
        self.max_micros.fetch_max(micros, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn avg_ms(&self) -> Option<f64> {
        let count = self.count();
        if count == 0 {
            return None;
        }
        let total = self.total_micros.load(Ordering::Relaxed);
        Some(total as f64 / count as f64 / 1000.0)
    }

    pub fn max_ms(&self) -> Option<f64> {
        if self.count() == 0 {
            return None;
        }
        Some(self.max_micros.load(Ordering::Relaxed) as f64 / 1000.0)
    }
}

/// All state shared between sender, receiver and monitor during one run.
#[derive(Debug)]
pub struct RunCounters {
    tx_bytes: AtomicU64,
    rx_bytes: AtomicU64,
    /// Offset of the first successful write, in micros from run start.
    first_write_micros: AtomicU64,
    /// Offset of the first received byte, in micros from run start.
    first_read_micros: AtomicU64,
    pub tx_latency: LatencyStat,
    pub rx_latency: LatencyStat,
}

impl RunCounters {
    pub fn new() -> Self {
        Self {
            tx_bytes: AtomicU64::new(0),
            rx_bytes: AtomicU64::new(0),
            first_write_micros: AtomicU64::new(UNSET),
            first_read_micros: AtomicU64::new(UNSET),
            tx_latency: LatencyStat::default(),
            rx_latency: LatencyStat::default(),
        }
    }

    pub fn tx_total(&self) -> u64 {
        self.tx_bytes.load(Ordering::Relaxed)
    }

    pub fn rx_total(&self) -> u64 {
        self.rx_bytes.load(Ordering::Relaxed)
    }

    pub fn tx_tally(&self) -> LocalTally<'_> {
        LocalTally::new(&self.tx_bytes)
    }

    pub fn rx_tally(&self) -> LocalTally<'_> {
        LocalTally::new(&self.rx_bytes)
    }

    /// Record the first-write moment; later calls are no-ops.
    pub fn mark_first_write(&self, since_start: Duration) {
        let _ = self.first_write_micros.compare_exchange(
            UNSET,
            since_start.as_micros() as u64,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
    }

    /// Record the first-byte moment; later calls are no-ops.
    pub fn mark_first_read(&self, since_start: Duration) {
        let _ = self.first_read_micros.compare_exchange(
            UNSET,
            since_start.as_micros() as u64,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
    }

    pub fn first_write_micros(&self) -> Option<u64> {
        match self.first_write_micros.load(Ordering::Relaxed) {
            UNSET => None,
            v => Some(v),
        }
    }

    pub fn first_read_micros(&self) -> Option<u64> {
        match self.first_read_micros.load(Ordering::Relaxed) {
            UNSET => None,
            v => Some(v),
        }
    }
}

impl Default for RunCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// Task-local byte tally with batched merge into a shared counter.
pub struct LocalTally<'a> {
    shared: &'a AtomicU64,
    pending: u64,
    total: u64,
}

impl<'a> LocalTally<'a> {
    fn new(shared: &'a AtomicU64) -> Self {
        Self {
            shared,
            pending: 0,
            total: 0,
        }
    }

    pub fn add(&mut self, n: u64) {
        self.pending += n;
        self.total += n;
        if self.pending >= FLUSH_BATCH {
            self.flush();
        }
    }

    /// Merge any pending bytes into the shared counter. Must be called at
    /// the end of a run so the residual below the batch threshold is not
    /// lost.
    pub fn flush(&mut self) {
        if self.pending > 0 {
            self.shared.fetch_add(self.pending, Ordering::Relaxed);
            self.pending = 0;
        }
    }

    /// Exact cumulative count seen by this task (independent of flushing).
    pub fn total(&self) -> u64 {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tally_merges_in_batches() {
        let counters = RunCounters::new();
        let mut tally = counters.tx_tally();
        tally.add(FLUSH_BATCH - 1);
        assert_eq!(counters.tx_total(), 0);
        tally.add(1);
        assert_eq!(counters.tx_total(), FLUSH_BATCH);
        tally.add(10);
        assert_eq!(counters.tx_total(), FLUSH_BATCH);
        tally.flush();
        assert_eq!(counters.tx_total(), FLUSH_BATCH + 10);
        assert_eq!(tally.total(), FLUSH_BATCH + 10);
    }

    #[test]
    fn flush_without_pending_is_noop() {
        let counters = RunCounters::new();
        let mut tally = counters.rx_tally();
        tally.flush();
        assert_eq!(counters.rx_total(), 0);
    }

    #[test]
    fn latency_stat_aggregates() {
        let stat = LatencyStat::default();
        assert_eq!(stat.avg_ms(), None);
        assert_eq!(stat.max_ms(), None);
        stat.record(Duration::from_millis(2));
        stat.record(Duration::from_millis(4));
        assert_eq!(stat.count(), 2);
        let avg = stat.avg_ms().unwrap();
        assert!((avg - 3.0).abs() < 0.01, "avg {avg}");
        let max = stat.max_ms().unwrap();
        assert!((max - 4.0).abs() < 0.01, "max {max}");
    }

    #[test]
    fn first_marks_are_sticky() {
        let counters = RunCounters::new();
        assert_eq!(counters.first_write_micros(), None);
        counters.mark_first_write(Duration::from_millis(5));
        counters.mark_first_write(Duration::from_millis(50));
        assert_eq!(counters.first_write_micros(), Some(5_000));
        assert_eq!(counters.first_read_micros(), None);
    }
}
