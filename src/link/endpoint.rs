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

//! Stream endpoint over an arbitrary duplex byte transport.
//!
//! The transport itself is supplied from outside (an RFCOMM socket, a TCP
//! socket, an in-memory duplex pair in tests); the endpoint only adds the
//! send/receive semantics the rest of the crate relies on: `send` reports
//! success as a bool, `recv` reports end-of-stream as `None` and "nothing
//! requested" as an empty, non-terminal chunk.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::debug;

/// Any duplex byte stream usable as a transport.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> ByteStream for T {}

/// Type-erased transport stream.
pub type BoxStream = Box<dyn ByteStream>;

/// Read side of an open endpoint.
pub struct EndpointReader {
    inner: ReadHalf<BoxStream>,
}

/// Write side of an open endpoint.
pub struct EndpointWriter {
    inner: WriteHalf<BoxStream>,
}

/// A live duplex endpoint: both halves, handed around as one unit.
pub struct Endpoint {
    pub reader: EndpointReader,
    pub writer: EndpointWriter,
}

impl Endpoint {
    /// Wrap a raw transport stream.
    pub fn open(stream: BoxStream) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: EndpointReader { inner: reader },
            writer: EndpointWriter { inner: writer },
        }
    }

    /// Split into independently owned halves.
    pub fn into_halves(self) -> (EndpointReader, EndpointWriter) {
        (self.reader, self.writer)
    }

    pub fn from_halves(reader: EndpointReader, writer: EndpointWriter) -> Self {
        Self { reader, writer }
    }
}

impl EndpointReader {
    /// Raw read into a caller-owned buffer. `Ok(0)` is end-of-stream.
    pub async fn read_chunk(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf).await
    }

    /// Receive up to `max` bytes.
    ///
    /// Returns `None` on end-of-stream or I/O error. `max == 0` yields an
    /// empty chunk, which is "no data requested right now", not a close.
    pub async fn recv(&mut self, max: usize) -> Option<Vec<u8>> {
        if max == 0 {
            return Some(Vec::new());
        }
        let mut buf = vec![0u8; max];
        match self.inner.read(&mut buf).await {
            Ok(0) => {
                debug!("endpoint read: end of stream");
                None
            }
            Ok(n) => {
                buf.truncate(n);
                Some(buf)
            }
            Err(e) => {
                debug!("endpoint read failed: {}", e);
                None
            }
        }
    }
}

impl EndpointWriter {
    /// Raw full write of one chunk.
    pub async fn write_chunk(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.inner.write_all(buf).await?;
        self.inner.flush().await
    }

    /// Send a chunk; any I/O error maps to `false`.
    pub async fn send(&mut self, bytes: &[u8]) -> bool {
        match self.write_chunk(bytes).await {
            Ok(()) => true,
            Err(e) => {
                debug!("endpoint write failed: {}", e);
                false
            }
        }
    }
}
