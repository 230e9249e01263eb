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

//! Client-side connection state machine.
//!
//! The transport is abstract: the caller supplies a dial closure that
//! produces one connected stream per invocation (an RFCOMM dial, a TCP
//! connect, or a canned stream in tests). Outcomes surface as state
//! transitions, not errors.

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::core::{LinkCore, LinkState};
use super::endpoint::{BoxStream, Endpoint};

/// One pending dial attempt.
pub type DialFuture = BoxFuture<'static, std::io::Result<BoxStream>>;

/// Client connection manager: dials out, owns the resulting endpoint.
pub struct ClientLink {
    core: Arc<LinkCore>,
    dial: Box<dyn Fn() -> DialFuture + Send + Sync>,
}

impl ClientLink {
    /// Build a client around a dial closure. The returned receiver yields
    /// every state transition in order.
    pub fn new(
        dial: impl Fn() -> DialFuture + Send + Sync + 'static,
    ) -> (Self, mpsc::Receiver<LinkState>) {
        let (core, state_rx) = LinkCore::new();
        (
            Self {
                core,
                dial: Box::new(dial),
            },
            state_rx,
        )
    }

    /// Dial the peer. Idempotent while connected or already dialing; ends in
    /// `Connected` or `Error`. A concurrent `disconnect` cancels the dial.
    pub async fn connect(&self) {
        let token = match self.core.try_begin(LinkState::Connecting) {
            Some(token) => token,
            None => {
                debug!("connect ignored, link already active");
                return;
            }
        };
        let dialing = (self.dial)();
        tokio::select! {
            _ = token.cancelled() => {
                debug!("connect cancelled");
            }
            res = dialing => match res {
                Ok(stream) => {
                    self.core.install(Endpoint::open(stream), &token).await;
                }
                Err(e) => {
                    warn!("connect failed: {}", e);
                    self.core.set_state(LinkState::Error);
                }
            },
        }
    }

    /// Close the connection (or abort a dial in progress). Safe to call in
    /// any state; lands in `Closed`.
    pub async fn disconnect(&self) {
        self.core.teardown(LinkState::Closed).await;
    }

    pub fn state(&self) -> LinkState {
        self.core.state()
    }

    pub async fn send(&self, bytes: &[u8]) -> bool {
        self.core.send(bytes).await
    }

    pub async fn recv(&self, max: usize) -> Option<Vec<u8>> {
        self.core.recv(max).await
    }

    /// Borrow the live endpoint for a throughput run.
    pub async fn take_endpoint(&self) -> Option<Endpoint> {
        self.core.take_endpoint().await
    }

    /// Hand a borrowed endpoint back after a run.
    pub async fn restore_endpoint(&self, endpoint: Endpoint) -> bool {
        self.core.restore_endpoint(endpoint).await
    }
}
