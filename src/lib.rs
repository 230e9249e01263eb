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

//! Throughput measurement over serial-style byte streams.
//!
//! sppbench drives a duplex stream (RFCOMM, TCP, a pty, anything
//! `AsyncRead + AsyncWrite`) through chat traffic and throughput tests.
//! The [`link`] module holds the client/server connection state machines
//! over an abstract transport, [`speed`] the measurement engine,
//! [`control`] the in-band command protocol for remote-triggered tests,
//! and [`session`] the driver that ties them together.

pub mod cli;
pub mod config;
pub mod control;
pub mod link;
pub mod session;
pub mod speed;

pub use link::LinkState;
pub use session::{LinkHandle, Session, SessionEvent};
pub use speed::{TestConfig, TestLimit, TestMode, ThroughputResult};
