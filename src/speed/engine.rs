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

//! The throughput engine.
//!
//! One run borrows an endpoint and drives up to three tasks over it: a
//! sender streaming patterned payload, a receiver draining (and optionally
//! verifying) inbound bytes, and a monitor that samples the shared counters
//! every 500 ms and decides when the run is over. Cancellation is
//! cooperative through a child token: the monitor cancels on duration or
//! guard expiry, a task cancels when it hits its byte target or a transport
//! failure, and the caller's token stops the run early while still
//! yielding the aggregate accumulated so far.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::control::ControlToken;
use crate::link::{Endpoint, EndpointReader, EndpointWriter};

use super::counters::RunCounters;
use super::report::{human_bytes, LinkDiagnostics, ThroughputResult, ThroughputSample};

/// Monitor tick and sample cadence.
pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

/// Hard ceiling on byte-bounded runs, in case the peer stalls.
pub const BOUNDED_RUN_GUARD: Duration = Duration::from_secs(60);

/// How long the best-effort `EOF` notification may take before teardown
/// proceeds without it.
const EOF_NOTIFY_TIMEOUT: Duration = Duration::from_secs(1);

/// Which directions a run exercises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestMode {
    TxOnly,
    RxOnly,
    Duplex,
}

impl TestMode {
    pub fn tx_enabled(&self) -> bool {
        matches!(self, TestMode::TxOnly | TestMode::Duplex)
    }

    pub fn rx_enabled(&self) -> bool {
        matches!(self, TestMode::RxOnly | TestMode::Duplex)
    }
}

/// When a run ends: after a wall-clock duration, or once a byte target has
/// moved (over rx if the run receives, otherwise over tx).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestLimit {
    Duration(Duration),
    Bytes(u64),
}

/// Payload content: the repeating 0x00-0xFF ramp, or a user pattern
/// repeated verbatim. Either way the sender produces one continuous
/// stream, carrying the offset across writes, which is also what the
/// receiver-side verifier checks against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadPattern {
    Ramp,
    Custom(Vec<u8>),
}

impl PayloadPattern {
    /// User pattern, falling back to the ramp when empty.
    pub fn custom(bytes: Vec<u8>) -> Self {
        if bytes.is_empty() {
            PayloadPattern::Ramp
        } else {
            PayloadPattern::Custom(bytes)
        }
    }

    /// Fill `buf` with the pattern as it appears at stream offset `offset`.
    pub fn fill(&self, buf: &mut [u8], offset: u64) {
        match self {
            PayloadPattern::Ramp => {
                for (i, b) in buf.iter_mut().enumerate() {
                    *b = offset.wrapping_add(i as u64) as u8;
                }
            }
            PayloadPattern::Custom(p) => {
                let len = p.len() as u64;
                for (i, b) in buf.iter_mut().enumerate() {
                    *b = p[(offset.wrapping_add(i as u64) % len) as usize];
                }
            }
        }
    }

    /// Check `buf` against the pattern at stream offset `offset`.
    pub fn verify(&self, buf: &[u8], offset: u64) -> bool {
        match self {
            PayloadPattern::Ramp => buf
                .iter()
                .enumerate()
                .all(|(i, b)| *b == offset.wrapping_add(i as u64) as u8),
            PayloadPattern::Custom(p) => {
                let len = p.len() as u64;
                buf.iter()
                    .enumerate()
                    .all(|(i, b)| *b == p[(offset.wrapping_add(i as u64) % len) as usize])
            }
        }
    }
}

/// Everything one run needs to know.
#[derive(Debug, Clone)]
pub struct TestConfig {
    pub mode: TestMode,
    pub limit: TestLimit,
    pub payload_size: usize,
    pub pattern: PayloadPattern,
    /// Verify inbound bytes against the pattern. A mismatched batch is
    /// dropped from the count, not fatal.
    pub verify: bool,
    /// Emit a diagnostics snapshot alongside each sample.
    pub diagnostics: bool,
    /// Remote-triggered ceremony: send `START_ACK` once the receive loop
    /// is listening and `EOF` when done. Only valid for a byte-bounded
    /// receive-only run.
    pub announce_ready: bool,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            mode: TestMode::Duplex,
            limit: TestLimit::Duration(Duration::from_secs(5)),
            payload_size: 4096,
            pattern: PayloadPattern::Ramp,
            verify: false,
            diagnostics: true,
            announce_ready: false,
        }
    }
}

impl TestConfig {
    /// Free-running duplex test.
    pub fn free_running(duration: Duration) -> Self {
        Self {
            limit: TestLimit::Duration(duration),
            ..Self::default()
        }
    }

    /// Receive-only run bounded to `target` bytes.
    pub fn bounded_rx(target: u64) -> Self {
        Self {
            mode: TestMode::RxOnly,
            limit: TestLimit::Bytes(target),
            ..Self::default()
        }
    }

    /// The receiver side of a remote-triggered test: bounded RX plus the
    /// ack/EOF ceremony.
    pub fn remote_rx(target: u64) -> Self {
        Self {
            announce_ready: true,
            ..Self::bounded_rx(target)
        }
    }

    /// The sender side of a remote-triggered test, bounded to the same
    /// target the peer asked for.
    pub fn bounded_tx(target: u64) -> Self {
        Self {
            mode: TestMode::TxOnly,
            limit: TestLimit::Bytes(target),
            ..Self::default()
        }
    }

    fn validate(&self) -> Result<(), EngineError> {
        if self.payload_size == 0 {
            return Err(EngineError::InvalidConfig("payload size must be positive"));
        }
        match self.limit {
            TestLimit::Duration(d) if d.is_zero() => {
                return Err(EngineError::InvalidConfig("duration must be positive"));
            }
            TestLimit::Bytes(0) => {
                return Err(EngineError::InvalidConfig("byte target must be positive"));
            }
            _ => {}
        }
        if let PayloadPattern::Custom(p) = &self.pattern {
            if p.is_empty() {
                return Err(EngineError::InvalidConfig(
                    "custom payload must not be empty",
                ));
            }
        }
        if self.announce_ready {
            if self.mode != TestMode::RxOnly {
                return Err(EngineError::InvalidConfig(
                    "ready announcement requires a receive-only run",
                ));
            }
            if !matches!(self.limit, TestLimit::Bytes(_)) {
                return Err(EngineError::InvalidConfig(
                    "ready announcement requires a byte target",
                ));
            }
        }
        Ok(())
    }
}

/// Why a run produced no result.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid test configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("stream i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("stream closed by peer mid-run")]
    StreamClosed,
    #[error("ready handshake failed")]
    Handshake,
    #[error("engine task failed: {0}")]
    Internal(String),
}

/// Progress emitted while a run is active.
#[derive(Debug, Clone)]
pub enum Progress {
    Sample(ThroughputSample),
    Diagnostics(LinkDiagnostics),
}

/// Observer callback, invoked from the monitor on every tick.
pub type ProgressFn = Box<dyn FnMut(Progress) + Send>;

/// What a finished run hands back: the outcome, and the endpoint if it is
/// still usable (absent after a transport failure).
pub struct Completed {
    pub outcome: Result<ThroughputResult, EngineError>,
    pub endpoint: Option<Endpoint>,
}

struct TickSnapshot {
    at: Duration,
    tx: u64,
    rx: u64,
}

/// Run one throughput test over `endpoint`.
///
/// `stop` ends the run early but gracefully: the aggregate accumulated so
/// far is still reported. A transport failure, peer EOF, invalid
/// configuration or failed ready handshake yields an `Err` outcome
/// instead, and the endpoint is only returned when the stream is still
/// usable.
pub async fn run(
    endpoint: Endpoint,
    config: TestConfig,
    mut progress: Option<ProgressFn>,
    stop: CancellationToken,
) -> Completed {
    if let Err(e) = config.validate() {
        warn!("refusing run: {}", e);
        return Completed {
            outcome: Err(e),
            endpoint: Some(endpoint),
        };
    }

    info!(
        "throughput run starting: mode {:?}, limit {:?}, payload {} bytes",
        config.mode, config.limit, config.payload_size
    );

    let counters = Arc::new(RunCounters::new());
    let started = Instant::now();
    let token = stop.child_token();

    let (tx_target, rx_target) = match config.limit {
        TestLimit::Bytes(t) if config.mode.rx_enabled() => (None, Some(t)),
        TestLimit::Bytes(t) => (Some(t), None),
        TestLimit::Duration(_) => (None, None),
    };

    let Endpoint { reader, writer } = endpoint;
    let mut local_reader: Option<EndpointReader> = None;
    let mut local_writer: Option<EndpointWriter> = None;

    let (ready_tx, ready_rx) = if config.announce_ready {
        let (t, r) = oneshot::channel();
        (Some(t), Some(r))
    } else {
        (None, None)
    };

    let mut rx_handle = if config.mode.rx_enabled() {
        Some(tokio::spawn(receiver_task(
            reader,
            config.payload_size,
            config.pattern.clone(),
            config.verify,
            rx_target,
            counters.clone(),
            token.clone(),
            started,
            ready_tx,
        )))
    } else {
        local_reader = Some(reader);
        None
    };

    let mut tx_handle = if config.mode.tx_enabled() {
        Some(tokio::spawn(sender_task(
            writer,
            config.payload_size,
            config.pattern.clone(),
            tx_target,
            counters.clone(),
            token.clone(),
            started,
        )))
    } else {
        local_writer = Some(writer);
        None
    };

    // Remote-triggered ceremony: wait until the receive loop is listening,
    // then acknowledge over the same stream. The writer half is free here
    // because announce_ready validates as receive-only. A failed ack
    // aborts the run before any byte is counted.
    if let Some(ready) = ready_rx {
        let acked = match ready.await {
            Ok(()) => match local_writer.as_mut() {
                Some(w) => {
                    w.write_chunk(ControlToken::StartAck.encode().as_bytes())
                        .await
                        .is_ok()
                }
                None => false,
            },
            Err(_) => false,
        };
        if !acked {
            warn!("ready handshake failed, aborting run");
            token.cancel();
            if let Some(h) = rx_handle.take() {
                let _ = h.await;
            }
            if let Some(h) = tx_handle.take() {
                let _ = h.await;
            }
            return Completed {
                outcome: Err(EngineError::Handshake),
                endpoint: None,
            };
        }
        debug!("receive loop listening, START_ACK sent");
    }

    // The monitor: sample on every tick, stop on duration or guard expiry,
    // or as soon as a task cancels the run token.
    let mut tick = tokio::time::interval_at(started + SAMPLE_INTERVAL, SAMPLE_INTERVAL);
    let mut prev = TickSnapshot {
        at: Duration::ZERO,
        tx: 0,
        rx: 0,
    };
    let end_reason = loop {
        tokio::select! {
            _ = token.cancelled() => break "stop signalled",
            _ = tick.tick() => {}
        }
        let now = started.elapsed();
        emit_progress(&mut progress, &config, &counters, now, &mut prev);
        match config.limit {
            TestLimit::Duration(d) if now >= d => break "duration reached",
            TestLimit::Bytes(_) if now >= BOUNDED_RUN_GUARD => break "bounded run guard expired",
            _ => {}
        }
    };
    debug!("run ending: {}", end_reason);
    token.cancel();

    let mut failure: Option<EngineError> = None;
    if let Some(h) = rx_handle.take() {
        match h.await {
            Ok((reader, res)) => {
                local_reader = Some(reader);
                if let Err(e) = res {
                    failure.get_or_insert(e);
                }
            }
            Err(e) => {
                failure.get_or_insert(EngineError::Internal(e.to_string()));
            }
        }
    }
    if let Some(h) = tx_handle.take() {
        match h.await {
            Ok((writer, res)) => {
                local_writer = Some(writer);
                if let Err(e) = res {
                    failure.get_or_insert(e);
                }
            }
            Err(e) => {
                failure.get_or_insert(EngineError::Internal(e.to_string()));
            }
        }
    }

    let ended = started.elapsed();
    if let Some(e) = failure {
        warn!("run failed after {} ms: {}", ended.as_millis(), e);
        return Completed {
            outcome: Err(e),
            endpoint: None,
        };
    }

    // Counters are fully flushed once the tasks have joined; emit one last
    // sample so observers see the exact totals the report carries.
    emit_progress(&mut progress, &config, &counters, ended, &mut prev);

    // Bounded-receive ceremony ends with a best-effort EOF notification.
    if config.announce_ready {
        if let Some(w) = local_writer.as_mut() {
            let frame = ControlToken::Eof.encode();
            match tokio::time::timeout(EOF_NOTIFY_TIMEOUT, w.write_chunk(frame.as_bytes())).await {
                Ok(Ok(())) => debug!("EOF sent"),
                Ok(Err(e)) => debug!("EOF write failed: {}", e),
                Err(_) => debug!("EOF write timed out"),
            }
        }
    }

    let result = final_result(&counters, ended);
    info!(
        "run complete: tx {} rx {} in {} ms",
        human_bytes(result.tx_total_bytes),
        human_bytes(result.rx_total_bytes),
        result.elapsed_ms
    );

    let endpoint = match (local_reader, local_writer) {
        (Some(r), Some(w)) => Some(Endpoint::from_halves(r, w)),
        _ => None,
    };
    Completed {
        outcome: Ok(result),
        endpoint,
    }
}

/// Streams patterned payload until cancelled or the tx byte target is met.
/// The final write of a bounded run is trimmed so the target is hit
/// exactly.
async fn sender_task(
    mut writer: EndpointWriter,
    payload_size: usize,
    pattern: PayloadPattern,
    target: Option<u64>,
    counters: Arc<RunCounters>,
    token: CancellationToken,
    started: Instant,
) -> (EndpointWriter, Result<(), EngineError>) {
    let mut buf = vec![0u8; payload_size];
    let mut tally = counters.tx_tally();
    let mut offset: u64 = 0;
    let result = loop {
        let len = match target {
            Some(t) => {
                let left = t - tally.total();
                if left == 0 {
                    debug!("tx target met at {} bytes", t);
                    token.cancel();
                    break Ok(());
                }
                left.min(payload_size as u64) as usize
            }
            None => payload_size,
        };
        let chunk = &mut buf[..len];
        pattern.fill(chunk, offset);
        let begun = Instant::now();
        let wrote = tokio::select! {
            _ = token.cancelled() => break Ok(()),
            res = writer.write_chunk(chunk) => res,
        };
        match wrote {
            Ok(()) => {
                counters.tx_latency.record(begun.elapsed());
                counters.mark_first_write(started.elapsed());
                tally.add(len as u64);
                offset += len as u64;
            }
            Err(e) => {
                warn!("write failed mid-run: {}", e);
                token.cancel();
                break Err(EngineError::Io(e));
            }
        }
    };
    tally.flush();
    drop(tally);
    (writer, result)
}

/// Drains inbound bytes until cancelled, EOF, or the rx byte target is
/// met. A batch that fails verification is dropped without advancing the
/// verify offset, so a single corrupt read does not poison the rest of the
/// stream.
#[allow(clippy::too_many_arguments)]
async fn receiver_task(
    mut reader: EndpointReader,
    payload_size: usize,
    pattern: PayloadPattern,
    verify: bool,
    target: Option<u64>,
    counters: Arc<RunCounters>,
    token: CancellationToken,
    started: Instant,
    ready: Option<oneshot::Sender<()>>,
) -> (EndpointReader, Result<(), EngineError>) {
    let mut buf = vec![0u8; payload_size];
    let mut tally = counters.rx_tally();
    let mut offset: u64 = 0;
    if let Some(gate) = ready {
        let _ = gate.send(());
    }
    let result = loop {
        let begun = Instant::now();
        let read = tokio::select! {
            _ = token.cancelled() => break Ok(()),
            res = reader.read_chunk(&mut buf) => res,
        };
        match read {
            Ok(0) => {
                warn!("peer closed the stream mid-run");
                token.cancel();
                break Err(EngineError::StreamClosed);
            }
            Ok(n) => {
                counters.rx_latency.record(begun.elapsed());
                counters.mark_first_read(started.elapsed());
                if verify && !pattern.verify(&buf[..n], offset) {
                    debug!("verification failed, dropping a {} byte batch", n);
                    continue;
                }
                tally.add(n as u64);
                offset += n as u64;
                if let Some(t) = target {
                    if tally.total() >= t {
                        debug!("rx target met at {} bytes", tally.total());
                        token.cancel();
                        break Ok(());
                    }
                }
            }
            Err(e) => {
                warn!("read failed mid-run: {}", e);
                token.cancel();
                break Err(EngineError::Io(e));
            }
        }
    };
    tally.flush();
    drop(tally);
    (reader, result)
}

fn emit_progress(
    progress: &mut Option<ProgressFn>,
    config: &TestConfig,
    counters: &RunCounters,
    now: Duration,
    prev: &mut TickSnapshot,
) {
    let Some(observer) = progress.as_mut() else {
        prev.at = now;
        prev.tx = counters.tx_total();
        prev.rx = counters.rx_total();
        return;
    };
    let sample = make_sample(counters, now, prev);
    observer(Progress::Sample(sample));
    if config.diagnostics {
        observer(Progress::Diagnostics(make_diagnostics(counters)));
    }
}

/// Instantaneous rates cover the window since the previous tick; averages
/// start at the first byte actually moved in that direction, so a slow
/// connection setup does not dilute them.
fn make_sample(counters: &RunCounters, now: Duration, prev: &mut TickSnapshot) -> ThroughputSample {
    let tx = counters.tx_total();
    let rx = counters.rx_total();
    let dt = (now - prev.at).as_secs_f64();
    let (tx_instant, rx_instant) = if dt > 0.0 {
        (
            (tx - prev.tx) as f64 / dt,
            (rx - prev.rx) as f64 / dt,
        )
    } else {
        (0.0, 0.0)
    };
    let sample = ThroughputSample {
        elapsed_ms: now.as_millis() as u64,
        tx_instant_bps: tx_instant,
        rx_instant_bps: rx_instant,
        tx_avg_bps: direction_avg(tx, counters.first_write_micros(), now),
        rx_avg_bps: direction_avg(rx, counters.first_read_micros(), now),
        tx_total_bytes: tx,
        rx_total_bytes: rx,
    };
    prev.at = now;
    prev.tx = tx;
    prev.rx = rx;
    sample
}

fn direction_avg(total: u64, first_micros: Option<u64>, now: Duration) -> f64 {
    let Some(first) = first_micros else {
        return 0.0;
    };
    let span = (now.as_micros() as u64).saturating_sub(first);
    if span == 0 {
        return 0.0;
    }
    total as f64 / (span as f64 / 1_000_000.0)
}

fn make_diagnostics(counters: &RunCounters) -> LinkDiagnostics {
    let rx_reads = counters.rx_latency.count();
    LinkDiagnostics {
        tx_write_avg_ms: counters.tx_latency.avg_ms(),
        tx_write_max_ms: counters.tx_latency.max_ms(),
        rx_read_avg_ms: counters.rx_latency.avg_ms(),
        rx_read_max_ms: counters.rx_latency.max_ms(),
        rx_read_avg_bytes: if rx_reads > 0 {
            Some(counters.rx_total() as f64 / rx_reads as f64)
        } else {
            None
        },
        tx_first_write_delay_ms: counters.first_write_micros().map(|m| m / 1000),
        rx_first_byte_delay_ms: counters.first_read_micros().map(|m| m / 1000),
    }
}

fn final_result(counters: &RunCounters, ended: Duration) -> ThroughputResult {
    ThroughputResult {
        tx_avg_bps: direction_avg(counters.tx_total(), counters.first_write_micros(), ended),
        rx_avg_bps: direction_avg(counters.rx_total(), counters.first_read_micros(), ended),
        tx_total_bytes: counters.tx_total(),
        rx_total_bytes: counters.rx_total(),
        elapsed_ms: ended.as_millis() as u64,
        diagnostics: make_diagnostics(counters),
    }
}
