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

//! Session driver.
//!
//! One task owns the whole peer relationship: it relays link state, runs
//! the chat read loop through the control scanner while the link is
//! otherwise idle, and hands the endpoint to the throughput engine for the
//! duration of a run. Control commands picked out of the data stream
//! (`START:<n>;`, `START_ACK`, `EOF`) drive the remote-triggered test
//! handshake; everything else surfaces as inbound data events.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::control::{ControlScanner, ControlToken, Feed};
use crate::link::{ClientLink, Endpoint, LinkState, ServerLink};
use crate::speed::{
    self, Completed, EngineError, LinkDiagnostics, Progress, ProgressFn, TestConfig,
    ThroughputResult, ThroughputSample,
};

/// How long the requesting side waits for the peer's `START_ACK`.
const ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Either side of the link, behind one interface.
#[derive(Clone)]
pub enum LinkHandle {
    Client(Arc<ClientLink>),
    Server(Arc<ServerLink>),
}

impl LinkHandle {
    pub fn client(link: ClientLink) -> Self {
        LinkHandle::Client(Arc::new(link))
    }

    pub fn server(link: ServerLink) -> Self {
        LinkHandle::Server(Arc::new(link))
    }

    pub fn state(&self) -> LinkState {
        match self {
            LinkHandle::Client(c) => c.state(),
            LinkHandle::Server(s) => s.state(),
        }
    }

    /// Dial (client) or start a listen cycle (server).
    pub async fn open(&self) {
        match self {
            LinkHandle::Client(c) => c.connect().await,
            LinkHandle::Server(s) => {
                let _ = s.listen().await;
            }
        }
    }

    pub async fn disconnect(&self) {
        match self {
            LinkHandle::Client(c) => c.disconnect().await,
            LinkHandle::Server(s) => s.disconnect().await,
        }
    }

    pub async fn send(&self, bytes: &[u8]) -> bool {
        match self {
            LinkHandle::Client(c) => c.send(bytes).await,
            LinkHandle::Server(s) => s.send(bytes).await,
        }
    }

    pub async fn recv(&self, max: usize) -> Option<Vec<u8>> {
        match self {
            LinkHandle::Client(c) => c.recv(max).await,
            LinkHandle::Server(s) => s.recv(max).await,
        }
    }

    async fn take_endpoint(&self) -> Option<Endpoint> {
        match self {
            LinkHandle::Client(c) => c.take_endpoint().await,
            LinkHandle::Server(s) => s.take_endpoint().await,
        }
    }

    async fn restore_endpoint(&self, endpoint: Endpoint) -> bool {
        match self {
            LinkHandle::Client(c) => c.restore_endpoint(endpoint).await,
            LinkHandle::Server(s) => s.restore_endpoint(endpoint).await,
        }
    }
}

/// Events emitted by a session.
#[derive(Debug)]
pub enum SessionEvent {
    /// Link state transition.
    State(LinkState),
    /// Ordinary inbound data (the chat path).
    Inbound(Vec<u8>),
    /// Periodic throughput sample from a running test.
    Sample(ThroughputSample),
    /// Latency diagnostics accompanying a sample.
    Diagnostics(LinkDiagnostics),
    /// A test finished and produced a report.
    TestFinished(ThroughputResult),
    /// A test ended without a report.
    TestFailed(String),
    /// The peer asked us to receive this many bytes.
    RemoteTestRequested { target: u64 },
    /// The peer's receive loop is listening; our bounded send begins.
    PeerReady,
    /// The peer's bounded receive finished.
    PeerEof,
}

/// Commands accepted by a session.
#[derive(Debug)]
enum Command {
    Connect,
    Disconnect,
    Send(Vec<u8>),
    StartTest(TestConfig),
    StopTest,
    RequestRemoteRx { target: u64, payload_size: usize },
}

/// Handle to a spawned session driver.
pub struct Session {
    cmd_tx: mpsc::Sender<Command>,
    cancel: CancellationToken,
}

impl Session {
    /// Spawn the driver task. `state_rx` is the receiver returned when the
    /// link was built; `chat_read_size` is the per-read cap on the chat
    /// path.
    pub fn spawn(
        link: LinkHandle,
        state_rx: mpsc::Receiver<LinkState>,
        chat_read_size: usize,
    ) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (event_tx, event_rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        tokio::spawn(drive(
            link,
            cmd_rx,
            state_rx,
            event_tx,
            cancel.clone(),
            // A zero cap would spin on empty reads.
            chat_read_size.max(1),
        ));
        (Self { cmd_tx, cancel }, event_rx)
    }

    pub async fn connect(&self) {
        let _ = self.cmd_tx.send(Command::Connect).await;
    }

    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(Command::Disconnect).await;
    }

    /// Queue outbound chat data.
    pub async fn send(&self, bytes: Vec<u8>) {
        let _ = self.cmd_tx.send(Command::Send(bytes)).await;
    }

    /// Start a local throughput run.
    pub async fn start_test(&self, config: TestConfig) {
        let _ = self.cmd_tx.send(Command::StartTest(config)).await;
    }

    /// Stop a running test early; its partial report is still emitted.
    pub async fn stop_test(&self) {
        let _ = self.cmd_tx.send(Command::StopTest).await;
    }

    /// Ask the peer to receive `target` bytes, then send them once it acks.
    pub async fn request_remote_rx(&self, target: u64, payload_size: usize) {
        let _ = self
            .cmd_tx
            .send(Command::RequestRemoteRx {
                target,
                payload_size,
            })
            .await;
    }

    /// Stop the driver and close the link.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// An outstanding `START:<n>;` request of ours.
struct PendingRemote {
    target: u64,
    payload_size: usize,
    deadline: Instant,
}

async fn drive(
    link: LinkHandle,
    mut cmd_rx: mpsc::Receiver<Command>,
    mut state_rx: mpsc::Receiver<LinkState>,
    events: mpsc::Sender<SessionEvent>,
    cancel: CancellationToken,
    chat_read_size: usize,
) {
    let mut scanner = ControlScanner::new();
    let mut test: Option<JoinHandle<Completed>> = None;
    let mut test_token: Option<CancellationToken> = None;
    // Set when a disconnect aborts the run; the report is then discarded.
    let mut test_abandoned = false;
    let mut awaiting_ack: Option<PendingRemote> = None;
    let mut expect_eof = false;

    info!("session driver started");
    loop {
        // The chat read loop only runs while the link is up and the engine
        // does not own the endpoint.
        let chat_active = test.is_none() && link.state() == LinkState::Connected;
        let ack_deadline = awaiting_ack.as_ref().map(|p| p.deadline);

        tokio::select! {
            _ = cancel.cancelled() => break,

            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break };
                match cmd {
                    Command::Connect => {
                        let link = link.clone();
                        // Opening can take a while; keep the driver responsive.
                        tokio::spawn(async move { link.open().await });
                    }
                    Command::Disconnect => {
                        if let Some(token) = test_token.as_ref() {
                            debug!("disconnect aborts the running test");
                            test_abandoned = true;
                            token.cancel();
                        }
                        awaiting_ack = None;
                        expect_eof = false;
                        scanner.reset();
                        link.disconnect().await;
                    }
                    Command::Send(bytes) => {
                        if test.is_some() {
                            debug!("send ignored while a test is running");
                        } else if !link.send(&bytes).await {
                            debug!("send failed, link is down");
                        }
                    }
                    Command::StartTest(config) => {
                        if test.is_some() {
                            debug!("test already running, start ignored");
                        } else {
                            match link.take_endpoint().await {
                                Some(ep) => {
                                    let (handle, stop) = launch_test(ep, config, &events);
                                    test = Some(handle);
                                    test_token = Some(stop);
                                    test_abandoned = false;
                                    awaiting_ack = None;
                                    scanner.reset();
                                }
                                None => {
                                    let _ = events
                                        .send(SessionEvent::TestFailed(
                                            "no live connection".into(),
                                        ))
                                        .await;
                                }
                            }
                        }
                    }
                    Command::StopTest => {
                        match test_token.as_ref() {
                            Some(token) => {
                                info!("stopping test early");
                                token.cancel();
                            }
                            None => debug!("no test running, stop ignored"),
                        }
                    }
                    Command::RequestRemoteRx { target, payload_size } => {
                        if test.is_some() {
                            debug!("test already running, remote request ignored");
                        } else if link.state() != LinkState::Connected {
                            let _ = events
                                .send(SessionEvent::TestFailed("no live connection".into()))
                                .await;
                        } else {
                            let frame = ControlToken::Start(target).encode();
                            if link.send(frame.as_bytes()).await {
                                info!("requested remote receive of {} bytes", target);
                                awaiting_ack = Some(PendingRemote {
                                    target,
                                    payload_size,
                                    deadline: Instant::now() + ACK_TIMEOUT,
                                });
                            } else {
                                let _ = events
                                    .send(SessionEvent::TestFailed(
                                        "start request could not be sent".into(),
                                    ))
                                    .await;
                            }
                        }
                    }
                }
            }

            state = state_rx.recv() => {
                let Some(state) = state else { break };
                let _ = events.send(SessionEvent::State(state)).await;
                if state != LinkState::Connected {
                    // The connection is gone; pending handshake context and
                    // withheld chat text go with it.
                    awaiting_ack = None;
                    expect_eof = false;
                    scanner.reset();
                }
            }

            chunk = link.recv(chat_read_size), if chat_active => {
                if let Some(bytes) = chunk {
                    match scanner.feed(&bytes) {
                        Feed::Held => {}
                        Feed::Data(chunks) => {
                            for data in chunks {
                                let _ = events.send(SessionEvent::Inbound(data)).await;
                            }
                        }
                        Feed::Token(ControlToken::Start(target)) => {
                            let _ = events
                                .send(SessionEvent::RemoteTestRequested { target })
                                .await;
                            match link.take_endpoint().await {
                                Some(ep) => {
                                    info!("peer requested a bounded receive of {} bytes", target);
                                    let (handle, stop) =
                                        launch_test(ep, TestConfig::remote_rx(target), &events);
                                    test = Some(handle);
                                    test_token = Some(stop);
                                    test_abandoned = false;
                                    awaiting_ack = None;
                                    scanner.reset();
                                }
                                None => {
                                    let _ = events
                                        .send(SessionEvent::TestFailed(
                                            "no live connection".into(),
                                        ))
                                        .await;
                                }
                            }
                        }
                        Feed::Token(ControlToken::StartAck) => {
                            match awaiting_ack.take() {
                                Some(pending) => {
                                    let _ = events.send(SessionEvent::PeerReady).await;
                                    match link.take_endpoint().await {
                                        Some(ep) => {
                                            let mut config =
                                                TestConfig::bounded_tx(pending.target);
                                            config.payload_size = pending.payload_size;
                                            let (handle, stop) =
                                                launch_test(ep, config, &events);
                                            test = Some(handle);
                                            test_token = Some(stop);
                                            test_abandoned = false;
                                            expect_eof = true;
                                            scanner.reset();
                                        }
                                        None => {
                                            let _ = events
                                                .send(SessionEvent::TestFailed(
                                                    "no live connection".into(),
                                                ))
                                                .await;
                                        }
                                    }
                                }
                                // An ack nobody asked for is just data.
                                None => {
                                    let _ = events
                                        .send(SessionEvent::Inbound(
                                            ControlToken::StartAck.encode().into_bytes(),
                                        ))
                                        .await;
                                }
                            }
                        }
                        Feed::Token(ControlToken::Eof) => {
                            if expect_eof {
                                expect_eof = false;
                                let _ = events.send(SessionEvent::PeerEof).await;
                            } else {
                                let _ = events
                                    .send(SessionEvent::Inbound(
                                        ControlToken::Eof.encode().into_bytes(),
                                    ))
                                    .await;
                            }
                        }
                    }
                }
                // A `None` here is EOF or teardown; the state arm reports it.
            }

            outcome = join_running(&mut test), if test.is_some() => {
                test = None;
                test_token = None;
                match outcome {
                    Err(e) => {
                        error!("engine task failed: {}", e);
                        let _ = events
                            .send(SessionEvent::TestFailed("engine task failed".into()))
                            .await;
                        link.disconnect().await;
                    }
                    Ok(done) => {
                        if let Some(ep) = done.endpoint {
                            if !link.restore_endpoint(ep).await {
                                debug!("link went down during the run, endpoint dropped");
                            }
                        }
                        match done.outcome {
                            Ok(_) if test_abandoned => {
                                debug!("run aborted by disconnect, report discarded");
                            }
                            Ok(report) => {
                                let _ = events.send(SessionEvent::TestFinished(report)).await;
                            }
                            Err(e) => {
                                let fatal = matches!(
                                    e,
                                    EngineError::Io(_)
                                        | EngineError::StreamClosed
                                        | EngineError::Handshake
                                );
                                let _ =
                                    events.send(SessionEvent::TestFailed(e.to_string())).await;
                                if fatal {
                                    link.disconnect().await;
                                }
                            }
                        }
                    }
                }
            }

            _ = wait_deadline(ack_deadline), if ack_deadline.is_some() => {
                if awaiting_ack.take().is_some() {
                    warn!("peer never acknowledged the start request");
                    let _ = events
                        .send(SessionEvent::TestFailed(
                            "timed out waiting for START_ACK".into(),
                        ))
                        .await;
                }
            }
        }
    }

    // Driver shutdown: wind down any running test and close the link.
    if let Some(token) = test_token.take() {
        token.cancel();
    }
    if let Some(handle) = test.take() {
        let _ = handle.await;
    }
    link.disconnect().await;
    info!("session driver stopped");
}

fn launch_test(
    endpoint: Endpoint,
    config: TestConfig,
    events: &mpsc::Sender<SessionEvent>,
) -> (JoinHandle<Completed>, CancellationToken) {
    let stop = CancellationToken::new();
    let progress = progress_fn(events.clone());
    let handle = tokio::spawn(speed::run(endpoint, config, Some(progress), stop.clone()));
    (handle, stop)
}

/// Bridge engine progress into session events without blocking the
/// monitor.
fn progress_fn(events: mpsc::Sender<SessionEvent>) -> ProgressFn {
    Box::new(move |progress| {
        let event = match progress {
            Progress::Sample(s) => SessionEvent::Sample(s),
            Progress::Diagnostics(d) => SessionEvent::Diagnostics(d),
        };
        if events.try_send(event).is_err() {
            debug!("progress event dropped (observer not draining)");
        }
    })
}

async fn join_running(
    slot: &mut Option<JoinHandle<Completed>>,
) -> Result<Completed, tokio::task::JoinError> {
    match slot.as_mut() {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

async fn wait_deadline(at: Option<Instant>) {
    match at {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
