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

//! Plumbing shared by the client and server connection state machines:
//! the observable state cell, the endpoint slots, and the per-attempt
//! cancellation token.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::endpoint::{Endpoint, EndpointReader, EndpointWriter};

/// Connection lifecycle state.
///
/// Transitions are monotonic within one attempt; `Closed` and `Error` are
/// terminal for the attempt, and a later `connect`/`listen` starts a fresh
/// attempt from there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    /// Client dial in progress.
    Connecting,
    /// Server waiting for its single inbound connection.
    Listening,
    Connected,
    Closed,
    Error,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Idle => "idle",
            LinkState::Connecting => "connecting",
            LinkState::Listening => "listening",
            LinkState::Connected => "connected",
            LinkState::Closed => "closed",
            LinkState::Error => "error",
        }
    }
}

enum Read {
    Data(Vec<u8>),
    Eof,
    Cancelled,
}

/// Shared internals of one connection state machine.
pub(crate) struct LinkCore {
    state: RwLock<LinkState>,
    state_tx: mpsc::Sender<LinkState>,
    attempt: Mutex<CancellationToken>,
    reader: tokio::sync::Mutex<Option<EndpointReader>>,
    writer: tokio::sync::Mutex<Option<EndpointWriter>>,
}

impl LinkCore {
    pub(crate) fn new() -> (Arc<Self>, mpsc::Receiver<LinkState>) {
        let (state_tx, state_rx) = mpsc::channel(32);
        let core = Arc::new(Self {
            state: RwLock::new(LinkState::Idle),
            state_tx,
            attempt: Mutex::new(CancellationToken::new()),
            reader: tokio::sync::Mutex::new(None),
            writer: tokio::sync::Mutex::new(None),
        });
        (core, state_rx)
    }

    pub(crate) fn state(&self) -> LinkState {
        *self.state.read()
    }

    pub(crate) fn attempt_token(&self) -> CancellationToken {
        self.attempt.lock().clone()
    }

    /// Record a transition and notify the observer. Same-state calls are
    /// no-ops, which makes disconnect idempotent.
    pub(crate) fn set_state(&self, new: LinkState) {
        let mut st = self.state.write();
        if *st == new {
            return;
        }
        info!("link state: {} -> {}", st.as_str(), new.as_str());
        *st = new;
        if self.state_tx.try_send(new).is_err() {
            debug!("link state event dropped (observer not draining)");
        }
    }

    /// Start a fresh attempt if no attempt or connection is live. Returns
    /// the attempt's cancellation token, or `None` if already busy.
    pub(crate) fn try_begin(&self, entry: LinkState) -> Option<CancellationToken> {
        let mut st = self.state.write();
        match *st {
            LinkState::Connected | LinkState::Connecting | LinkState::Listening => None,
            _ => {
                info!("link state: {} -> {}", st.as_str(), entry.as_str());
                *st = entry;
                if self.state_tx.try_send(entry).is_err() {
                    debug!("link state event dropped (observer not draining)");
                }
                let token = CancellationToken::new();
                *self.attempt.lock() = token.clone();
                Some(token)
            }
        }
    }

    /// Install the endpoint produced by a successful dial/accept, unless the
    /// attempt was cancelled while it resolved.
    pub(crate) async fn install(&self, endpoint: Endpoint, token: &CancellationToken) -> bool {
        let mut reader = self.reader.lock().await;
        let mut writer = self.writer.lock().await;
        if token.is_cancelled() {
            debug!("attempt cancelled before endpoint install");
            return false;
        }
        let (r, w) = endpoint.into_halves();
        *reader = Some(r);
        *writer = Some(w);
        drop(writer);
        drop(reader);
        self.set_state(LinkState::Connected);
        true
    }

    /// Tear the connection down: cancel the attempt, drop both halves,
    /// land in `terminal` (normally `Closed`).
    pub(crate) async fn teardown(&self, terminal: LinkState) {
        self.attempt.lock().cancel();
        let mut reader = self.reader.lock().await;
        let mut writer = self.writer.lock().await;
        reader.take();
        writer.take();
        drop(writer);
        drop(reader);
        self.set_state(terminal);
    }

    /// Send on the live endpoint. A write failure closes the connection.
    pub(crate) async fn send(&self, bytes: &[u8]) -> bool {
        let ok = {
            let mut writer = self.writer.lock().await;
            match writer.as_mut() {
                None => return false,
                Some(w) => w.send(bytes).await,
            }
        };
        if !ok {
            warn!("send failed, closing link");
            self.teardown(LinkState::Closed).await;
        }
        ok
    }

    /// Receive up to `max` bytes from the live endpoint.
    ///
    /// `None` means the stream ended (the link transitions to `Closed`), the
    /// attempt was cancelled, or no endpoint is live.
    pub(crate) async fn recv(&self, max: usize) -> Option<Vec<u8>> {
        let token = self.attempt_token();
        let outcome = {
            let mut reader = self.reader.lock().await;
            let r = match reader.as_mut() {
                None => return None,
                Some(r) => r,
            };
            tokio::select! {
                _ = token.cancelled() => Read::Cancelled,
                chunk = r.recv(max) => match chunk {
                    Some(c) => Read::Data(c),
                    None => Read::Eof,
                },
            }
        };
        match outcome {
            Read::Data(c) => Some(c),
            Read::Cancelled => None,
            Read::Eof => {
                info!("stream ended, closing link");
                self.teardown(LinkState::Closed).await;
                None
            }
        }
    }

    /// Borrow the whole endpoint out of the slots (for a throughput run).
    pub(crate) async fn take_endpoint(&self) -> Option<Endpoint> {
        let mut reader = self.reader.lock().await;
        let mut writer = self.writer.lock().await;
        match (reader.take(), writer.take()) {
            (Some(r), Some(w)) => Some(Endpoint::from_halves(r, w)),
            (r, w) => {
                // Put back whatever half was there; nothing to hand out.
                *reader = r;
                *writer = w;
                None
            }
        }
    }

    /// Return a borrowed endpoint after a run, if the link is still up.
    pub(crate) async fn restore_endpoint(&self, endpoint: Endpoint) -> bool {
        let mut reader = self.reader.lock().await;
        let mut writer = self.writer.lock().await;
        if self.state() != LinkState::Connected || self.attempt_token().is_cancelled() {
            debug!("link no longer up, dropping returned endpoint");
            return false;
        }
        let (r, w) = endpoint.into_halves();
        *reader = Some(r);
        *writer = Some(w);
        true
    }
}
