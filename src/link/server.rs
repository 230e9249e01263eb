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

//! Server-side connection state machine.
//!
//! Binds a listener via a caller-supplied closure and accepts exactly one
//! inbound connection per listen cycle. The accept future owns the bound
//! listener, so the listener closes as soon as it has produced its single
//! stream (or the cycle is torn down).

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::core::{LinkCore, LinkState};
use super::endpoint::{BoxStream, Endpoint};

/// Resolves to the single accepted stream, then drops the listener.
pub type AcceptFuture = BoxFuture<'static, std::io::Result<BoxStream>>;

/// Binds a listener; resolves to the accept future for this cycle.
pub type BindFuture = BoxFuture<'static, std::io::Result<AcceptFuture>>;

/// Server connection manager: listens, accepts one peer, owns the endpoint.
pub struct ServerLink {
    core: Arc<LinkCore>,
    bind: Box<dyn Fn() -> BindFuture + Send + Sync>,
}

impl ServerLink {
    /// Build a server around a bind closure. The returned receiver yields
    /// every state transition in order.
    pub fn new(
        bind: impl Fn() -> BindFuture + Send + Sync + 'static,
    ) -> (Self, mpsc::Receiver<LinkState>) {
        let (core, state_rx) = LinkCore::new();
        (
            Self {
                core,
                bind: Box::new(bind),
            },
            state_rx,
        )
    }

    /// Start a listen cycle. Returns whether a listener is in place (an
    /// already-listening or connected link counts as success). The accept
    /// itself completes in the background and surfaces as a transition to
    /// `Connected` or `Error`.
    pub async fn listen(&self) -> bool {
        let token = match self.core.try_begin(LinkState::Listening) {
            Some(token) => token,
            None => {
                debug!("listen ignored, link already active");
                return matches!(
                    self.core.state(),
                    LinkState::Listening | LinkState::Connected
                );
            }
        };
        let accept = tokio::select! {
            _ = token.cancelled() => {
                debug!("listen cancelled during bind");
                return false;
            }
            res = (self.bind)() => match res {
                Ok(accept) => accept,
                Err(e) => {
                    warn!("bind failed: {}", e);
                    self.core.set_state(LinkState::Error);
                    return false;
                }
            },
        };

        let core = self.core.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("listen cancelled");
                }
                res = accept => match res {
                    Ok(stream) => {
                        if core.install(Endpoint::open(stream), &token).await {
                            info!("inbound connection accepted, listener closed");
                        }
                    }
                    Err(e) => {
                        warn!("accept failed: {}", e);
                        core.set_state(LinkState::Error);
                    }
                },
            }
        });
        true
    }

    /// Close the connection (or stop listening). Safe in any state; lands in
    /// `Closed`.
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
