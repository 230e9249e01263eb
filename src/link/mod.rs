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

//! Connection layer: stream endpoints plus the client and server
//! connection state machines that own their lifecycle.

mod core;
mod endpoint;

pub mod client;
pub mod server;

pub use self::client::{ClientLink, DialFuture};
pub use self::core::LinkState;
pub use self::endpoint::{BoxStream, ByteStream, Endpoint, EndpointReader, EndpointWriter};
pub use self::server::{AcceptFuture, BindFuture, ServerLink};
