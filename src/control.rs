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

//! In-band control protocol.
//!
//! Three reserved ASCII commands ride inside the ordinary data stream:
//! `START:<digits>;` (request a bounded receive test of that many bytes),
//! `START_ACK` (receiver is listening) and `EOF` (receiver is done). There
//! is no framing; commands are recognized purely by content, so inbound
//! chunks that *look* like the beginning of a command are withheld in a
//! small rolling buffer until they either complete a command or stop
//! matching the grammar, at which point the withheld text is released to
//! the normal data path. The heuristic can briefly delay a chat message
//! shaped like a command prefix; that ambiguity is inherent to in-band
//! signaling and is left as is.

/// Command prefix for a bounded receive-test request.
pub const START_PREFIX: &str = "START:";
/// Receiver-ready acknowledgement token.
pub const START_ACK: &str = "START_ACK";
/// Receiver-done token.
pub const EOF_TOKEN: &str = "EOF";

/// Chunks longer than this are never considered control traffic.
const MAX_CONTROL_CHUNK: usize = 64;
/// Rolling lookback buffer cap; overflow trims from the front.
const MAX_PENDING: usize = 256;

/// A complete, recognized control command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlToken {
    /// Request: run a bounded RX test for this many bytes.
    Start(u64),
    /// Peer's receive loop is listening.
    StartAck,
    /// Peer's bounded run finished.
    Eof,
}

impl ControlToken {
    /// Wire encoding of this command.
    pub fn encode(&self) -> String {
        match self {
            ControlToken::Start(n) => format!("{}{};", START_PREFIX, n),
            ControlToken::StartAck => START_ACK.to_string(),
            ControlToken::Eof => EOF_TOKEN.to_string(),
        }
    }

    /// Parse an accumulated buffer into a command.
    ///
    /// A `START:` command matches as a prefix of the buffer (a hit clears
    /// the entire pending buffer, so text trailing the `;` is dropped); the
    /// standalone tokens match the buffer exactly. Non-positive or
    /// non-numeric targets are not commands.
    pub fn parse(text: &str) -> Option<ControlToken> {
        if let Some(rest) = text.strip_prefix(START_PREFIX) {
            let end = rest.find(';')?;
            let digits = &rest[..end];
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            return match digits.parse::<u64>() {
                Ok(n) if n > 0 => Some(ControlToken::Start(n)),
                _ => None,
            };
        }
        if text == START_ACK {
            return Some(ControlToken::StartAck);
        }
        if text == EOF_TOKEN {
            return Some(ControlToken::Eof);
        }
        None
    }
}

/// Outcome of feeding one inbound chunk to the scanner.
#[derive(Debug, PartialEq, Eq)]
pub enum Feed {
    /// Withheld as a possible command in progress; surface nothing yet.
    Held,
    /// A complete command was recognized (withheld text consumed).
    Token(ControlToken),
    /// Ordinary data to surface, in arrival order. Includes any previously
    /// withheld text that turned out not to be a command.
    Data(Vec<Vec<u8>>),
}

/// Rolling-buffer scanner that picks control commands out of the data
/// stream. Only active while no throughput run is in progress; during a run
/// every inbound byte is data.
#[derive(Debug, Default)]
pub struct ControlScanner {
    pending: String,
}

impl ControlScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when nothing is withheld.
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop any withheld text (mode switch into a run).
    pub fn reset(&mut self) {
        self.pending.clear();
    }

    /// Classify one inbound chunk.
    pub fn feed(&mut self, chunk: &[u8]) -> Feed {
        if chunk.is_empty() {
            return Feed::Data(Vec::new());
        }
        let text = match plausible_control_text(chunk) {
            Some(text) => text,
            None => {
                // Not control-shaped; anything withheld goes out first.
                if self.pending.is_empty() {
                    return Feed::Data(vec![chunk.to_vec()]);
                }
                let held = std::mem::take(&mut self.pending);
                return Feed::Data(vec![held.into_bytes(), chunk.to_vec()]);
            }
        };

        if self.pending.is_empty() && !could_begin_command(text) {
            return Feed::Data(vec![chunk.to_vec()]);
        }

        self.pending.push_str(text);
        if self.pending.len() > MAX_PENDING {
            // Plausible chunks are pure ASCII, so a byte drain is safe.
            let excess = self.pending.len() - MAX_PENDING;
            self.pending.drain(..excess);
        }

        if let Some(token) = ControlToken::parse(&self.pending) {
            self.pending.clear();
            return Feed::Token(token);
        }
        if could_become_command(&self.pending) {
            return Feed::Held;
        }
        let held = std::mem::take(&mut self.pending);
        Feed::Data(vec![held.into_bytes()])
    }
}

/// Short, valid UTF-8, printable ASCII/whitespace only.
fn plausible_control_text(chunk: &[u8]) -> Option<&str> {
    if chunk.len() > MAX_CONTROL_CHUNK {
        return None;
    }
    let text = std::str::from_utf8(chunk).ok()?;
    if text
        .bytes()
        .all(|b| b.is_ascii_graphic() || b.is_ascii_whitespace())
    {
        Some(text)
    } else {
        None
    }
}

fn is_prefix_of(buf: &str, token: &str) -> bool {
    token.as_bytes().starts_with(buf.as_bytes())
}

/// Could `buf` still grow into a command?
fn could_become_command(buf: &str) -> bool {
    if is_prefix_of(buf, START_PREFIX) || is_prefix_of(buf, START_ACK) || is_prefix_of(buf, EOF_TOKEN)
    {
        return true;
    }
    // "START:" plus a digit run awaiting its terminator.
    match buf.strip_prefix(START_PREFIX) {
        Some(rest) => rest.bytes().all(|b| b.is_ascii_digit()),
        None => false,
    }
}

/// Could `buf` begin a command (including already being one)?
fn could_begin_command(buf: &str) -> bool {
    ControlToken::parse(buf).is_some() || could_become_command(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_start_with_target() {
        assert_eq!(
            ControlToken::parse("START:1048576;"),
            Some(ControlToken::Start(1048576))
        );
        assert_eq!(ControlToken::parse("START:1;"), Some(ControlToken::Start(1)));
    }

    #[test]
    fn parse_rejects_bad_targets() {
        assert_eq!(ControlToken::parse("START:0;"), None);
        assert_eq!(ControlToken::parse("START:abc;"), None);
        assert_eq!(ControlToken::parse("START:;"), None);
        assert_eq!(ControlToken::parse("start:5;"), None);
        // Larger than u64: numeric but not representable.
        assert_eq!(ControlToken::parse("START:99999999999999999999;"), None);
    }

    #[test]
    fn parse_standalone_tokens_exactly() {
        assert_eq!(ControlToken::parse("START_ACK"), Some(ControlToken::StartAck));
        assert_eq!(ControlToken::parse("EOF"), Some(ControlToken::Eof));
        assert_eq!(ControlToken::parse("EOF!"), None);
        assert_eq!(ControlToken::parse("START_ACKx"), None);
    }

    #[test]
    fn encode_parse_roundtrip() {
        let start = ControlToken::Start(512);
        assert_eq!(start.encode(), "START:512;");
        assert_eq!(ControlToken::parse(&start.encode()), Some(start));
        assert_eq!(ControlToken::StartAck.encode(), "START_ACK");
        assert_eq!(ControlToken::Eof.encode(), "EOF");
    }

    #[test]
    fn single_chunk_command() {
        let mut scanner = ControlScanner::new();
        assert_eq!(
            scanner.feed(b"START:512;"),
            Feed::Token(ControlToken::Start(512))
        );
        assert!(scanner.is_idle());
    }

    #[test]
    fn fragmented_command_equals_single_chunk() {
        let mut scanner = ControlScanner::new();
        assert_eq!(scanner.feed(b"ST"), Feed::Held);
        assert_eq!(scanner.feed(b"ART:"), Feed::Held);
        assert_eq!(scanner.feed(b"512"), Feed::Held);
        assert_eq!(scanner.feed(b";"), Feed::Token(ControlToken::Start(512)));
        assert!(scanner.is_idle());
    }

    #[test]
    fn fragmented_ack() {
        let mut scanner = ControlScanner::new();
        assert_eq!(scanner.feed(b"STAR"), Feed::Held);
        assert_eq!(scanner.feed(b"T_ACK"), Feed::Token(ControlToken::StartAck));
    }

    #[test]
    fn ordinary_chat_passes_straight_through() {
        let mut scanner = ControlScanner::new();
        assert_eq!(
            scanner.feed(b"hello there"),
            Feed::Data(vec![b"hello there".to_vec()])
        );
        assert!(scanner.is_idle());
    }

    #[test]
    fn withheld_text_is_released_when_grammar_breaks() {
        let mut scanner = ControlScanner::new();
        assert_eq!(scanner.feed(b"START"), Feed::Held);
        assert_eq!(
            scanner.feed(b"LING"),
            Feed::Data(vec![b"STARTLING".to_vec()])
        );
        assert!(scanner.is_idle());
    }

    #[test]
    fn zero_target_is_released_as_chat() {
        let mut scanner = ControlScanner::new();
        assert_eq!(
            scanner.feed(b"START:0;"),
            Feed::Data(vec![b"START:0;".to_vec()])
        );
    }

    #[test]
    fn binary_chunk_flushes_withheld_text() {
        let mut scanner = ControlScanner::new();
        assert_eq!(scanner.feed(b"STA"), Feed::Held);
        let blob = vec![0u8; 16];
        assert_eq!(
            scanner.feed(&blob),
            Feed::Data(vec![b"STA".to_vec(), blob.clone()])
        );
    }

    #[test]
    fn long_chunk_is_never_control() {
        let mut scanner = ControlScanner::new();
        let long = "START:".to_string() + &"1".repeat(80);
        assert_eq!(
            scanner.feed(long.as_bytes()),
            Feed::Data(vec![long.clone().into_bytes()])
        );
    }

    #[test]
    fn pending_buffer_trims_from_front_and_releases() {
        let mut scanner = ControlScanner::new();
        assert_eq!(scanner.feed(b"START:"), Feed::Held);
        let mut released = None;
        for _ in 0..40 {
            match scanner.feed(b"1234567890") {
                Feed::Held => continue,
                Feed::Data(chunks) => {
                    released = Some(chunks);
                    break;
                }
                other => panic!("unexpected outcome: {:?}", other),
            }
        }
        // Once the front was trimmed off, the buffer no longer matches the
        // grammar and everything withheld comes back out, capped.
        let chunks = released.expect("buffer should eventually overflow");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 256);
        assert!(scanner.is_idle());
    }

    #[test]
    fn reset_drops_withheld_text() {
        let mut scanner = ControlScanner::new();
        assert_eq!(scanner.feed(b"START:12"), Feed::Held);
        scanner.reset();
        assert!(scanner.is_idle());
        assert_eq!(scanner.feed(b"9;"), Feed::Data(vec![b"9;".to_vec()]));
    }
}
