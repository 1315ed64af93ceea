//! Incremental record recovery from a raw output stream
//!
//! The wrapped tool writes whatever it wants to stdout; structured records
//! (JSON documents, optionally `data: `-prefixed SSE lines) arrive mixed
//! with plain text and can be split across arbitrary chunk boundaries.
//! [`StreamRecordParser`] reassembles them without ever failing: anything
//! that cannot be recovered is dropped and the stream moves on.

use serde_json::Value;
use std::time::{Duration, Instant};

/// Upper bound on the reassembly buffer. When exceeded, the oldest bytes
/// are dropped and the most recent 64 KB are kept.
const MAX_BUFFER_BYTES: usize = 64 * 1024;

/// A partial record older than this is considered abandoned by the child
/// and is discarded before the next chunk is appended.
const STALE_PARTIAL_TIMEOUT: Duration = Duration::from_millis(1000);

/// SSE-style line prefix stripped before parsing.
const DATA_PREFIX: &str = "data: ";

/// Recovers structured records from arbitrary text fragments of a stream.
///
/// `parse` never returns an error. Malformed input yields no records and,
/// where a trailing fragment might still be completed by a later chunk, the
/// fragment is retained internally.
pub struct StreamRecordParser {
    buffer: String,
    last_chunk_at: Option<Instant>,
    stale_after: Duration,
    dropped_lines: u64,
}

impl StreamRecordParser {
    pub fn new() -> Self {
        Self::with_stale_timeout(STALE_PARTIAL_TIMEOUT)
    }

    /// Create a parser with a custom stale-partial timeout.
    pub fn with_stale_timeout(stale_after: Duration) -> Self {
        Self {
            buffer: String::new(),
            last_chunk_at: None,
            stale_after,
            dropped_lines: 0,
        }
    }

    /// Parse a chunk of stream text, returning every record completed by it.
    pub fn parse(&mut self, chunk: &str) -> Vec<Value> {
        let now = Instant::now();
        if let Some(last) = self.last_chunk_at {
            if now.duration_since(last) >= self.stale_after && !self.buffer.is_empty() {
                tracing::debug!(
                    bytes = self.buffer.len(),
                    "discarding stale partial record"
                );
                self.buffer.clear();
            }
        }
        self.last_chunk_at = Some(now);

        self.buffer.push_str(chunk);
        self.enforce_cap();

        // Fast path: the whole buffer is one document.
        if let Ok(value) = serde_json::from_str::<Value>(&self.buffer) {
            self.buffer.clear();
            return vec![value];
        }

        let mut records = Vec::new();
        let pending = std::mem::take(&mut self.buffer);
        let mut lines: Vec<&str> = pending.split('\n').collect();
        // The final segment may still be mid-record.
        let tail = lines.pop().unwrap_or("");

        for line in lines {
            if line.trim().is_empty() {
                continue;
            }
            match self.parse_line(line) {
                Some(value) => records.push(value),
                None => {
                    self.dropped_lines += 1;
                    tracing::trace!(len = line.len(), "dropped unparseable line");
                }
            }
        }

        if !tail.is_empty() {
            // Emit the tail only if it already parses on its own; otherwise
            // keep it and wait for the next chunk.
            match parse_direct(tail) {
                Some(value) => records.push(value),
                None => self.buffer = tail.to_string(),
            }
        }

        records
    }

    /// Clear the reassembly buffer and chunk timestamp.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.last_chunk_at = None;
    }

    /// Current reassembly buffer, for diagnostics.
    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    /// Number of lines dropped because they could not be recovered.
    pub fn dropped_lines(&self) -> u64 {
        self.dropped_lines
    }

    fn parse_line(&self, line: &str) -> Option<Value> {
        if let Some(value) = parse_direct(line) {
            return Some(value);
        }
        // Recovery: the line may embed a document in surrounding noise.
        extract_fragment(line).and_then(|fragment| serde_json::from_str(fragment).ok())
    }

    fn enforce_cap(&mut self) {
        if self.buffer.len() <= MAX_BUFFER_BYTES {
            return;
        }
        let mut start = self.buffer.len() - MAX_BUFFER_BYTES;
        while !self.buffer.is_char_boundary(start) {
            start += 1;
        }
        self.buffer.drain(..start);
    }
}

impl Default for StreamRecordParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a single line directly, stripping an optional `data: ` prefix.
fn parse_direct(line: &str) -> Option<Value> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    let candidate = trimmed.strip_prefix(DATA_PREFIX).unwrap_or(trimmed);
    serde_json::from_str(candidate).ok()
}

/// Extract the first balanced `{...}` or `[...]` substring from a line.
///
/// The scan is string-aware so braces inside JSON string literals do not
/// affect nesting depth.
fn extract_fragment(line: &str) -> Option<&str> {
    let start = line.find(['{', '['])?;
    let bytes = line.as_bytes();
    let (open, close) = match bytes[start] {
        b'{' => (b'{', b'}'),
        _ => (b'[', b']'),
    };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            _ if b == open => depth += 1,
            _ if b == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(&line[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}
