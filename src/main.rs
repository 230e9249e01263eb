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

//! sppbench command line binary.
//!
//! Three ways in: `serve` waits for one peer over TCP, `dial` connects
//! out, `loopback` runs the engine against itself in process. Serving
//! and dialing expose the same session: chat both ways, local tests,
//! and peer-triggered bounded receive tests.

use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use clap::Parser;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sppbench::cli::{Cli, Cmd, DialOpts, ServeOpts, TestOpts};
use sppbench::config::Config;
use sppbench::link::{
    AcceptFuture, BindFuture, BoxStream, ClientLink, DialFuture, Endpoint, ServerLink,
};
use sppbench::session::{LinkHandle, Session, SessionEvent};
use sppbench::speed::{
    self, human_bps, human_bytes, Progress, ProgressFn, TestConfig, TestMode, ThroughputResult,
    ThroughputSample,
};
use sppbench::LinkState;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sppbench=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    info!("Starting sppbench v{}...", env!("CARGO_PKG_VERSION"));

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    info!("Configuration loaded");

    match cli.cmd {
        Cmd::Serve(opts) => serve(opts, &config).await,
        Cmd::Dial(opts) => dial(opts, &config).await,
        Cmd::Loopback(opts) => loopback(opts, &config).await,
    }
}

/// TCP dial closure for the client link.
fn tcp_dialer(addr: String, nodelay: bool) -> impl Fn() -> DialFuture + Send + Sync + 'static {
    move || {
        let addr = addr.clone();
        let fut: DialFuture = Box::pin(async move {
            let stream = TcpStream::connect(&addr).await?;
            if nodelay {
                stream.set_nodelay(true)?;
            }
            Ok(Box::new(stream) as BoxStream)
        });
        fut
    }
}

/// TCP bind closure for the server link. The accept future owns the bound
/// listener, so the listener closes after its single accept.
fn tcp_binder(addr: String, nodelay: bool) -> impl Fn() -> BindFuture + Send + Sync + 'static {
    move || {
        let addr = addr.clone();
        let fut: BindFuture = Box::pin(async move {
            let listener = TcpListener::bind(&addr).await?;
            info!("listening on {}", listener.local_addr()?);
            let accept: AcceptFuture = Box::pin(async move {
                let (stream, peer) = listener.accept().await?;
                info!("peer connected from {}", peer);
                if nodelay {
                    stream.set_nodelay(true)?;
                }
                Ok(Box::new(stream) as BoxStream)
            });
            Ok(accept)
        });
        fut
    }
}

async fn serve(opts: ServeOpts, config: &Config) -> Result<()> {
    let addr = opts.addr.unwrap_or_else(|| config.net.listen_addr.clone());
    let (server, state_rx) = ServerLink::new(tcp_binder(addr, config.net.nodelay));
    let (session, mut events) =
        Session::spawn(LinkHandle::server(server), state_rx, config.chat.read_size);
    session.connect().await;

    info!("Ready. Press Ctrl+C to exit.");
    let mut transcript: Vec<String> = Vec::new();
    loop {
        tokio::select! {
            Some(event) = events.recv() => match event {
                SessionEvent::State(state) => {
                    info!("link: {}", state.as_str());
                    if matches!(state, LinkState::Closed | LinkState::Error) {
                        info!(
                            "peer session ended, {} chat messages retained",
                            transcript.len()
                        );
                        transcript.clear();
                        // One connection per listen cycle; arm the next one.
                        session.connect().await;
                    }
                }
                SessionEvent::Inbound(bytes) => {
                    push_capped(
                        &mut transcript,
                        render_inbound(&bytes),
                        config.history.chat_cap,
                    );
                }
                SessionEvent::RemoteTestRequested { target } => {
                    info!("peer requested a {} receive test", human_bytes(target));
                }
                SessionEvent::Sample(sample) => print_sample(&sample),
                SessionEvent::Diagnostics(_) => {}
                SessionEvent::TestFinished(report) => {
                    info!(
                        "test finished: rx {} at {}",
                        human_bytes(report.rx_total_bytes),
                        human_bps(report.rx_avg_bps)
                    );
                }
                SessionEvent::TestFailed(reason) => warn!("test failed: {}", reason),
                SessionEvent::PeerReady | SessionEvent::PeerEof => {}
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }
    session.shutdown();
    info!("sppbench stopped");
    Ok(())
}

async fn dial(opts: DialOpts, config: &Config) -> Result<()> {
    let (client, state_rx) = ClientLink::new(tcp_dialer(opts.addr.clone(), config.net.nodelay));
    let (session, mut events) =
        Session::spawn(LinkHandle::client(client), state_rx, config.chat.read_size);
    session.connect().await;
    wait_connected(&mut events).await?;
    info!("connected to {}", opts.addr);

    let outcome = if let Some(text) = &opts.send {
        chat(&session, &mut events, text, config).await
    } else if let Some(target) = opts.remote_rx {
        let payload = opts
            .test
            .payload_size
            .unwrap_or(config.test.payload_size);
        remote_test(&session, &mut events, target, payload, &opts.test).await
    } else {
        local_test(&session, &mut events, &opts.test, config).await
    };

    session.shutdown();
    outcome
}

/// Consume events until the link is up (or provably is not).
async fn wait_connected(events: &mut mpsc::Receiver<SessionEvent>) -> Result<()> {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::State(LinkState::Connected) => return Ok(()),
            SessionEvent::State(LinkState::Error) => bail!("connect failed"),
            SessionEvent::State(LinkState::Closed) => bail!("connection closed during dial"),
            _ => {}
        }
    }
    bail!("session ended before connecting")
}

/// Send one message, then keep the chat open until Ctrl+C or hangup.
async fn chat(
    session: &Session,
    events: &mut mpsc::Receiver<SessionEvent>,
    text: &str,
    config: &Config,
) -> Result<()> {
    session.send(text.as_bytes().to_vec()).await;
    info!("sent {} bytes, chat open. Press Ctrl+C to exit.", text.len());
    let mut transcript: Vec<String> = Vec::new();
    loop {
        tokio::select! {
            Some(event) = events.recv() => match event {
                SessionEvent::Inbound(bytes) => {
                    push_capped(
                        &mut transcript,
                        render_inbound(&bytes),
                        config.history.chat_cap,
                    );
                }
                SessionEvent::State(state) => {
                    info!("link: {}", state.as_str());
                    if matches!(state, LinkState::Closed | LinkState::Error) {
                        break;
                    }
                }
                SessionEvent::RemoteTestRequested { target } => {
                    info!("peer requested a {} receive test", human_bytes(target));
                }
                SessionEvent::Sample(sample) => print_sample(&sample),
                SessionEvent::TestFinished(report) => {
                    info!(
                        "test finished: rx {} at {}",
                        human_bytes(report.rx_total_bytes),
                        human_bps(report.rx_avg_bps)
                    );
                }
                SessionEvent::TestFailed(reason) => warn!("test failed: {}", reason),
                _ => {}
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }
    info!("chat closed, {} messages retained", transcript.len());
    Ok(())
}

/// Run a test over the live connection and print its report.
async fn local_test(
    session: &Session,
    events: &mut mpsc::Receiver<SessionEvent>,
    opts: &TestOpts,
    config: &Config,
) -> Result<()> {
    let test_config = opts.to_test_config(&config.test)?;
    session.start_test(test_config).await;

    let mut samples: Vec<ThroughputSample> = Vec::new();
    let report = loop {
        tokio::select! {
            Some(event) = events.recv() => match event {
                SessionEvent::Sample(sample) => {
                    print_sample(&sample);
                    push_capped(&mut samples, sample, config.history.sample_cap);
                }
                SessionEvent::Diagnostics(_) => {}
                SessionEvent::TestFinished(report) => break report,
                SessionEvent::TestFailed(reason) => bail!("test failed: {}", reason),
                SessionEvent::State(state) => info!("link: {}", state.as_str()),
                _ => {}
            },
            _ = tokio::signal::ctrl_c() => {
                info!("stopping test early");
                session.stop_test().await;
            }
        }
    };

    print_peak(&samples);
    print_report(&report, opts.json)
}

/// Ask the peer to receive `target` bytes and stream them over.
async fn remote_test(
    session: &Session,
    events: &mut mpsc::Receiver<SessionEvent>,
    target: u64,
    payload_size: usize,
    opts: &TestOpts,
) -> Result<()> {
    session.request_remote_rx(target, payload_size).await;
    info!("asked peer to receive {}", human_bytes(target));

    let report = loop {
        tokio::select! {
            Some(event) = events.recv() => match event {
                SessionEvent::PeerReady => info!("peer is listening, sending"),
                SessionEvent::Sample(sample) => print_sample(&sample),
                SessionEvent::Diagnostics(_) => {}
                SessionEvent::TestFinished(report) => break report,
                SessionEvent::TestFailed(reason) => bail!("remote test failed: {}", reason),
                SessionEvent::State(state) => info!("link: {}", state.as_str()),
                _ => {}
            },
            _ = tokio::signal::ctrl_c() => {
                info!("stopping test early");
                session.stop_test().await;
            }
        }
    };

    // The peer confirms once its counter reaches the target.
    let confirmed = tokio::time::timeout(Duration::from_secs(3), async {
        while let Some(event) = events.recv().await {
            if matches!(event, SessionEvent::PeerEof) {
                return true;
            }
        }
        false
    })
    .await
    .unwrap_or(false);
    if confirmed {
        info!("peer confirmed completion");
    } else {
        warn!("no completion signal from peer");
    }

    print_report(&report, opts.json)
}

/// One engine pass against a mirrored engine over an in-process pipe.
async fn loopback(opts: TestOpts, config: &Config) -> Result<()> {
    let config_a = opts.to_test_config(&config.test)?;
    let config_b = mirrored(&config_a);
    let (a, b) = tokio::io::duplex(256 * 1024);

    let stop = CancellationToken::new();
    tokio::spawn({
        let stop = stop.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
            stop.cancel();
        }
    });

    let peer = tokio::spawn(speed::run(
        Endpoint::open(Box::new(b)),
        config_b,
        None,
        stop.clone(),
    ));
    let progress: ProgressFn = Box::new(|progress| {
        if let Progress::Sample(sample) = progress {
            print_sample(&sample);
        }
    });
    let done = speed::run(Endpoint::open(Box::new(a)), config_a, Some(progress), stop).await;
    let _ = peer.await;

    match done.outcome {
        Ok(report) => print_report(&report, opts.json),
        Err(e) => Err(anyhow!("loopback run failed: {}", e)),
    }
}

/// Swap directions so the peer engine complements ours.
fn mirrored(config: &TestConfig) -> TestConfig {
    let mode = match config.mode {
        TestMode::TxOnly => TestMode::RxOnly,
        TestMode::RxOnly => TestMode::TxOnly,
        TestMode::Duplex => TestMode::Duplex,
    };
    TestConfig {
        mode,
        ..config.clone()
    }
}

fn print_sample(sample: &ThroughputSample) {
    info!(
        "{:>6} ms  tx {} (avg {})  rx {} (avg {})",
        sample.elapsed_ms,
        human_bps(sample.tx_instant_bps),
        human_bps(sample.tx_avg_bps),
        human_bps(sample.rx_instant_bps),
        human_bps(sample.rx_avg_bps)
    );
}

fn print_peak(samples: &[ThroughputSample]) {
    let peak_tx = samples.iter().map(|s| s.tx_instant_bps).fold(0.0, f64::max);
    let peak_rx = samples.iter().map(|s| s.rx_instant_bps).fold(0.0, f64::max);
    if peak_tx > 0.0 || peak_rx > 0.0 {
        info!(
            "peak: tx {}, rx {}",
            human_bps(peak_tx),
            human_bps(peak_rx)
        );
    }
}

fn print_report(report: &ThroughputResult, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    println!("elapsed: {} ms", report.elapsed_ms);
    println!(
        "tx: {} ({})",
        human_bytes(report.tx_total_bytes),
        human_bps(report.tx_avg_bps)
    );
    println!(
        "rx: {} ({})",
        human_bytes(report.rx_total_bytes),
        human_bps(report.rx_avg_bps)
    );
    let diag = &report.diagnostics;
    if let (Some(avg), Some(max)) = (diag.tx_write_avg_ms, diag.tx_write_max_ms) {
        println!("write latency: avg {:.2} ms, max {:.2} ms", avg, max);
    }
    if let (Some(avg), Some(max)) = (diag.rx_read_avg_ms, diag.rx_read_max_ms) {
        println!("read latency: avg {:.2} ms, max {:.2} ms", avg, max);
    }
    if let Some(bytes) = diag.rx_read_avg_bytes {
        println!("read size: avg {:.0} bytes", bytes);
    }
    Ok(())
}

/// Log inbound chat, falling back to hex for non-text payloads.
fn render_inbound(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => {
            info!("peer: {}", text);
            text.to_string()
        }
        Err(_) => {
            let preview: Vec<String> = bytes.iter().take(16).map(|b| format!("{:02x}", b)).collect();
            info!("peer sent {} binary bytes: {}", bytes.len(), preview.join(" "));
            format!("[{} binary bytes]", bytes.len())
        }
    }
}

fn push_capped<T>(buf: &mut Vec<T>, item: T, cap: usize) {
    if cap > 0 && buf.len() >= cap {
        buf.remove(0);
    }
    buf.push(item);
}
