//! Byte-offset resumable JSONL stream parser
//!
//! Turns a byte range of a transcript into [`RawRecord`]s. Only complete,
//! newline-terminated lines are consumed; a trailing partial line is left
//! in place and picked up by the next pass. Each line decodes on its own,
//! so a malformed line becomes a [`DecodeWarning`] and never stops the rest
//! of the stream.
//!
//! ## Usage
//!
//! ```rust
//! use tailscribe_core::ingest::stream::{StreamItem, StreamParser};
//!
//! let bytes = b"{\"type\":\"user\"}\n{\"type\":\"assi";
//! let mut parser = StreamParser::new(&bytes[..], 0);
//! let items: Vec<_> = parser.by_ref().collect::<std::io::Result<_>>().unwrap();
//! assert_eq!(items.len(), 1);
//! // The partial second line is not consumed
//! assert_eq!(parser.end_offset(), 16);
//! ```

use crate::types::ByteSpan;
use serde::Serialize;
use std::io::BufRead;

/// Default cap on a single line, matching `[parser] max_line_bytes`.
pub const DEFAULT_MAX_LINE_BYTES: usize = 10 * 1024 * 1024;

/// One decoded JSON object from one transcript line.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    /// The `type` discriminant, when present
    pub kind: Option<String>,
    pub payload: serde_json::Value,
    pub span: ByteSpan,
}

/// A line that was consumed but could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecodeWarning {
    pub span: ByteSpan,
    pub reason: String,
}

impl std::fmt::Display for DecodeWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bytes {}: {}", self.span, self.reason)
    }
}

/// Items produced by [`StreamParser`].
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Record(RawRecord),
    Warning(DecodeWarning),
}

/// Lazy line decoder over a reader positioned at `start_offset`.
///
/// The parser only reads; it never seeks and never touches shared state.
/// Callers position the reader (or hand it just the new bytes) and use
/// [`StreamParser::end_offset`] as the next resume point.
pub struct StreamParser<R> {
    reader: R,
    offset: u64,
    max_line_bytes: usize,
    buf: Vec<u8>,
    done: bool,
}

impl<R: BufRead> StreamParser<R> {
    pub fn new(reader: R, start_offset: u64) -> Self {
        Self {
            reader,
            offset: start_offset,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            buf: Vec::new(),
            done: false,
        }
    }

    pub fn with_max_line_bytes(mut self, max_line_bytes: usize) -> Self {
        self.max_line_bytes = max_line_bytes;
        self
    }

    /// Offset just past the last consumed line.
    pub fn end_offset(&self) -> u64 {
        self.offset
    }

    fn decode(&self, span: ByteSpan, line: &[u8]) -> Option<StreamItem> {
        let trimmed = trim_ascii(line);
        if trimmed.is_empty() {
            return None;
        }

        if line.len() > self.max_line_bytes {
            return Some(StreamItem::Warning(DecodeWarning {
                span,
                reason: format!(
                    "line of {} bytes exceeds limit of {} bytes",
                    line.len(),
                    self.max_line_bytes
                ),
            }));
        }

        let payload: serde_json::Value = match serde_json::from_slice(trimmed) {
            Ok(v) => v,
            Err(e) => {
                return Some(StreamItem::Warning(DecodeWarning {
                    span,
                    reason: format!("JSON parse error: {}", e),
                }))
            }
        };

        if !payload.is_object() {
            return Some(StreamItem::Warning(DecodeWarning {
                span,
                reason: "line is not a JSON object".to_string(),
            }));
        }

        let kind = payload
            .get("type")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        Some(StreamItem::Record(RawRecord {
            kind,
            payload,
            span,
        }))
    }
}

impl<R: BufRead> Iterator for StreamParser<R> {
    type Item = std::io::Result<StreamItem>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            self.buf.clear();
            let read = match self.reader.read_until(b'\n', &mut self.buf) {
                Ok(n) => n,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };

            // EOF, or a trailing line still being written
            if read == 0 || self.buf.last() != Some(&b'\n') {
                self.done = true;
                return None;
            }

            let span = ByteSpan::new(self.offset, self.offset + read as u64);
            self.offset = span.end;

            let line = &self.buf[..read - 1];
            if let Some(item) = self.decode(span, line) {
                return Some(Ok(item));
            }
        }
        None
    }
}

/// Everything decoded from one byte range.
#[derive(Debug, Default)]
pub struct ParsedRange {
    pub records: Vec<RawRecord>,
    pub warnings: Vec<DecodeWarning>,
    /// Resume point for the next pass
    pub end_offset: u64,
}

impl ParsedRange {
    /// Bytes consumed relative to `start`.
    pub fn consumed(&self, start: u64) -> u64 {
        self.end_offset.saturating_sub(start)
    }
}

/// Decode an in-memory byte range that begins at `start_offset`.
///
/// Reads from memory cannot fail, so this never returns an I/O error.
pub fn parse_range(bytes: &[u8], start_offset: u64, max_line_bytes: usize) -> ParsedRange {
    let mut parser = StreamParser::new(bytes, start_offset).with_max_line_bytes(max_line_bytes);
    let mut parsed = ParsedRange::default();

    for item in parser.by_ref() {
        match item {
            Ok(StreamItem::Record(record)) => parsed.records.push(record),
            Ok(StreamItem::Warning(warning)) => {
                tracing::warn!(span = %warning.span, reason = %warning.reason, "Skipping undecodable line");
                parsed.warnings.push(warning);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Read error in in-memory range");
                break;
            }
        }
    }

    parsed.end_offset = parser.end_offset();
    parsed
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(bytes: &[u8], start: u64) -> (Vec<StreamItem>, u64) {
        let mut parser = StreamParser::new(bytes, start);
        let items = parser.by_ref().map(|r| r.unwrap()).collect();
        (items, parser.end_offset())
    }

    #[test]
    fn test_complete_lines_only() {
        let data = b"{\"type\":\"user\",\"n\":1}\n{\"type\":\"assistant\"}\n{\"type\":\"us";
        let (items, end) = collect(data, 0);

        assert_eq!(items.len(), 2);
        assert_eq!(end, 43);
        match &items[1] {
            StreamItem::Record(r) => {
                assert_eq!(r.kind.as_deref(), Some("assistant"));
                assert_eq!(r.span, ByteSpan::new(22, 43));
            }
            other => panic!("expected record, got {:?}", other),
        }
    }

    #[test]
    fn test_malformed_line_reports_span_and_continues() {
        let data = b"{\"type\":\"user\"}\nnot json\n{\"type\":\"system\"}\n";
        let (items, end) = collect(data, 100);

        assert_eq!(items.len(), 3);
        assert_eq!(end, 100 + data.len() as u64);
        match &items[1] {
            StreamItem::Warning(w) => {
                assert_eq!(w.span, ByteSpan::new(116, 125));
                assert!(w.reason.contains("JSON parse error"));
            }
            other => panic!("expected warning, got {:?}", other),
        }
        assert!(matches!(items[2], StreamItem::Record(_)));
    }

    #[test]
    fn test_blank_and_crlf_lines() {
        let data = b"\n   \n{\"type\":\"user\"}\r\n";
        let (items, end) = collect(data, 0);
        assert_eq!(items.len(), 1);
        assert_eq!(end, data.len() as u64);
    }

    #[test]
    fn test_non_object_json_is_warning() {
        let (items, _) = collect(b"[1,2,3]\n", 0);
        assert!(matches!(&items[0], StreamItem::Warning(w) if w.reason.contains("not a JSON object")));
    }

    #[test]
    fn test_oversized_line_skipped() {
        let long = format!("{{\"type\":\"user\",\"pad\":\"{}\"}}\n", "x".repeat(64));
        let data = format!("{}{{\"type\":\"assistant\"}}\n", long);
        let mut parser = StreamParser::new(data.as_bytes(), 0).with_max_line_bytes(32);
        let items: Vec<_> = parser.by_ref().map(|r| r.unwrap()).collect();

        assert!(matches!(&items[0], StreamItem::Warning(w) if w.reason.contains("exceeds limit")));
        assert!(matches!(&items[1], StreamItem::Record(_)));
        assert_eq!(parser.end_offset(), data.len() as u64);
    }

    #[test]
    fn test_resume_matches_cold_parse() {
        let data = b"{\"type\":\"user\",\"uuid\":\"a\"}\n{\"type\":\"assistant\",\"uuid\":\"b\"}\n{\"type\":\"user\",\"uuid\":\"c\"}\n";
        let cold = parse_range(data, 0, DEFAULT_MAX_LINE_BYTES);

        let first = parse_range(&data[..40], 0, DEFAULT_MAX_LINE_BYTES);
        let resume_at = first.end_offset as usize;
        let second = parse_range(&data[resume_at..], first.end_offset, DEFAULT_MAX_LINE_BYTES);

        let mut resumed = first.records;
        resumed.extend(second.records);
        assert_eq!(resumed, cold.records);
        assert_eq!(second.end_offset, cold.end_offset);
    }

    #[test]
    fn test_partial_line_retried_after_growth() {
        let full = b"{\"type\":\"user\"}\n{\"type\":\"assistant\"}\n";
        let first = parse_range(&full[..20], 0, DEFAULT_MAX_LINE_BYTES);
        assert_eq!(first.records.len(), 1);
        assert_eq!(first.end_offset, 16);

        let second = parse_range(&full[16..], 16, DEFAULT_MAX_LINE_BYTES);
        assert_eq!(second.records.len(), 1);
        assert_eq!(second.records[0].span.start, 16);
        assert_eq!(second.consumed(16), (full.len() - 16) as u64);
    }
}
