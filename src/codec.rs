//! Frame codec: backend NDJSON in, SSE delta frames out, and the client-side
//! SSE line decoder. Nothing here performs I/O.
//!
//! Both decoders are push-based: callers hand over chunks exactly as they came
//! off the wire and get back whatever complete frames those chunks finished.

use tracing::{debug, warn};

use crate::providers::{BackendChunk, DeltaChunk};

/// Terminal SSE frame written after a clean end of the backend stream.
pub const DONE_FRAME: &str = "data: [DONE]\n\n";

const DATA_PREFIX: &str = "data: ";
const DONE_MARKER: &str = "[DONE]";

// ---------------------------------------------------------------------------
// Outbound encoding
// ---------------------------------------------------------------------------

/// Serialize one content fragment as an OpenAI-style delta SSE frame.
pub fn encode_delta(content: &str) -> String {
    let payload = serde_json::json!({
        "choices": [{ "delta": { "content": content }, "index": 0 }]
    });
    format!("{DATA_PREFIX}{payload}\n\n")
}

// ---------------------------------------------------------------------------
// Backend NDJSON decoding
// ---------------------------------------------------------------------------

/// Rolling line decoder for a backend's JSON-per-line stream.
///
/// Only complete lines reach the JSON parser; at most one partial line is
/// held between pushes.
#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    buf: Vec<u8>,
    dropped: usize,
}

impl NdjsonDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return the non-empty `message.content` values of
    /// every line it completed, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            if let Some(content) = self.decode_line(&line) {
                out.push(content);
            }
        }
        out
    }

    /// Flush a trailing line that was never newline-terminated. End of
    /// stream terminates it.
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.buf);
        self.decode_line(&line)
    }

    /// Number of lines dropped because they were not valid JSON.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Bytes of the partial line currently held.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }

    fn decode_line(&mut self, line: &[u8]) -> Option<String> {
        // '\n' never occurs inside a multi-byte sequence, so a complete line
        // is complete UTF-8 unless the backend itself sent garbage.
        let text = String::from_utf8_lossy(line);
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        match serde_json::from_str::<BackendChunk>(text) {
            Ok(chunk) => {
                if let Some(err) = chunk.error {
                    warn!(error = %err, "backend reported an error line");
                }
                chunk
                    .message
                    .and_then(|m| m.content)
                    .filter(|c| !c.is_empty())
            }
            Err(e) => {
                self.dropped += 1;
                debug!(error = %e, line_len = text.len(), "dropping malformed backend line");
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Incremental UTF-8
// ---------------------------------------------------------------------------

/// Streaming UTF-8 decoder that holds an incomplete trailing sequence until
/// the rest of it arrives. Invalid bytes decode to U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::with_capacity(self.pending.len());
        let mut start = 0;
        while start < self.pending.len() {
            match std::str::from_utf8(&self.pending[start..]) {
                Ok(s) => {
                    out.push_str(s);
                    start = self.pending.len();
                }
                Err(e) => {
                    let valid_end = start + e.valid_up_to();
                    out.push_str(
                        std::str::from_utf8(&self.pending[start..valid_end]).unwrap_or_default(),
                    );
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            start = valid_end + bad;
                        }
                        // Incomplete sequence at the end: keep it for later.
                        None => {
                            start = valid_end;
                            break;
                        }
                    }
                }
            }
        }
        self.pending.drain(..start);
        out
    }

    /// Bytes of an incomplete sequence still held back.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// End of input: anything still held is a truncated sequence.
    pub fn finish(&mut self) -> String {
        if self.pending.is_empty() {
            String::new()
        } else {
            self.pending.clear();
            char::REPLACEMENT_CHARACTER.to_string()
        }
    }
}

// ---------------------------------------------------------------------------
// Client-side SSE decoding
// ---------------------------------------------------------------------------

/// Meaning of one SSE line on the consuming side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseLine {
    Delta(String),
    Done,
    Ignored,
}

/// Classify a single line (without its newline).
pub fn parse_sse_line(raw: &str) -> SseLine {
    let line = raw.trim();
    if line.is_empty() || line.starts_with(':') {
        return SseLine::Ignored;
    }
    let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
        return SseLine::Ignored;
    };
    let payload = payload.trim();
    if payload == DONE_MARKER {
        return SseLine::Done;
    }
    match serde_json::from_str::<DeltaChunk>(payload) {
        Ok(chunk) => chunk
            .first_content()
            .map(|c| SseLine::Delta(c.to_string()))
            .unwrap_or(SseLine::Ignored),
        Err(e) => {
            debug!(error = %e, "skipping unparsable SSE payload");
            SseLine::Ignored
        }
    }
}

/// Bytes-to-lines front end of the client consumer: UTF-8 decoding across
/// chunk boundaries plus `\n` splitting. Ignored lines are not reported.
#[derive(Debug, Default)]
pub struct SseDecoder {
    utf8: Utf8Decoder,
    line: String,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseLine> {
        let text = self.utf8.push(bytes);
        self.line.push_str(&text);
        let mut out = Vec::new();
        while let Some(pos) = self.line.find('\n') {
            let parsed = parse_sse_line(&self.line[..pos]);
            self.line.drain(..=pos);
            match parsed {
                SseLine::Ignored => {}
                SseLine::Done => {
                    out.push(SseLine::Done);
                    // Anything after the sentinel is irrelevant.
                    self.line.clear();
                    return out;
                }
                delta => out.push(delta),
            }
        }
        out
    }
}
