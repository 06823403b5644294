use crate::logs::tagger::Tag;
use chrono::{DateTime, Utc};

/// One complete log line produced by a source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    /// Container reference the line came from
    pub identity: String,
    /// Emission timestamp, when the source recorded one
    pub timestamp: Option<DateTime<Utc>>,
    /// Line content without the trailing newline
    pub payload: String,
}

impl LogLine {
    /// Create a line from already separated parts
    pub fn new(
        identity: impl Into<String>,
        timestamp: Option<DateTime<Utc>>,
        payload: impl Into<String>,
    ) -> Self {
        let mut payload = payload.into();
        strip_line_ending(&mut payload);

        Self {
            identity: identity.into(),
            timestamp,
            payload,
        }
    }

    /// Parse a raw line, lifting a leading RFC 3339 timestamp into `timestamp`
    ///
    /// This is the layout `docker logs --timestamps` produces:
    /// `2024-01-01T10:00:00.000000000Z message`
    pub fn parse(identity: impl Into<String>, raw: &str) -> Self {
        let (timestamp, payload) = split_timestamp(raw);
        Self::new(identity, timestamp, payload)
    }
}

/// Split a leading RFC 3339 timestamp off a raw line
pub fn split_timestamp(raw: &str) -> (Option<DateTime<Utc>>, &str) {
    if let Some((prefix, rest)) = raw.split_once(' ') {
        if let Ok(timestamp) = DateTime::parse_from_rfc3339(prefix) {
            return (Some(timestamp.with_timezone(&Utc)), rest);
        }
    }

    (None, raw)
}

fn strip_line_ending(payload: &mut String) {
    if payload.ends_with('\n') {
        payload.pop();
    }
    if payload.ends_with('\r') {
        payload.pop();
    }
}

/// A log line with the display tag of its source attached
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedLine {
    /// Registration index of the source within the session
    pub source_index: usize,
    pub tag: Tag,
    pub line: LogLine,
}

impl TaggedLine {
    pub fn new(source_index: usize, tag: Tag, line: LogLine) -> Self {
        Self {
            source_index,
            tag,
            line,
        }
    }
}

/// Per-source reassembly buffer that only releases complete lines
///
/// Bytes are held until a `\n` is observed, so a line split across
/// several reads is never forwarded as a fragment.
#[derive(Debug, Default)]
pub struct LineSplitter {
    buffer: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every line it completed
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let Some(last_newline) = self.buffer.iter().rposition(|&b| b == b'\n') else {
            return Vec::new();
        };

        let complete: Vec<u8> = self.buffer.drain(..=last_newline).collect();
        complete[..complete.len() - 1]
            .split(|&b| b == b'\n')
            .map(decode_line)
            .collect()
    }

    /// Whether bytes of an unfinished line are being held
    pub fn has_partial(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Release the trailing unterminated line once the stream has closed
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }

        let rest = std::mem::take(&mut self.buffer);
        Some(decode_line(&rest))
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}
