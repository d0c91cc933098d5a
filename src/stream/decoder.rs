//! Incremental NDJSON decoding, independent of any I/O.
//!
//! [`LineBuffer`] reassembles lines across arbitrary chunk boundaries and
//! [`EventDecoder`] turns each complete line into a [`StreamEvent`]. Both are
//! synchronous so the async reader in [`super::StreamProcessor`] stays a thin
//! loop around them.

use chrono::Utc;
use serde_json::{Value, json};

use super::event::{EventKind, EventOrigin, StreamEvent};
use crate::error::StreamParseError;

/// How stdout lines should be interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StreamFormat {
    /// One JSON record per line with a `type` discriminator.
    #[default]
    Ndjson,
    /// Free text; every line becomes a `Message` event.
    PlainText,
}

/// Byte buffer that yields complete lines and holds the remainder.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
    /// Bytes of `pending` already known to hold no newline.
    scanned: usize,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        let mut search = self.scanned;
        while let Some(offset) = self.pending[search..].iter().position(|b| *b == b'\n') {
            let end = search + offset;
            lines.push(decode_line(&self.pending[start..end]));
            start = end + 1;
            search = start;
        }
        self.pending.drain(..start);
        self.scanned = self.pending.len();
        lines
    }

    /// Flush a final line that had no trailing newline.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = decode_line(&self.pending);
        self.pending.clear();
        self.scanned = 0;
        Some(line)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Bytes are only decoded once a full line is available, so a multi-byte
/// character split across chunks is never mangled.
fn decode_line(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    text.strip_suffix('\r').unwrap_or(&text).to_string()
}

/// Per-invocation line classifier and sequence counter.
#[derive(Debug)]
pub struct EventDecoder {
    format: StreamFormat,
    next_sequence: u64,
    parse_errors: u64,
    terminal_seen: bool,
}

impl EventDecoder {
    pub fn new(format: StreamFormat) -> Self {
        Self {
            format,
            next_sequence: 0,
            parse_errors: 0,
            terminal_seen: false,
        }
    }

    /// Decode one complete line. Blank lines produce nothing.
    pub fn decode_line(&mut self, line: &str) -> Option<StreamEvent> {
        if line.trim().is_empty() {
            return None;
        }

        let (kind, payload) = match self.format {
            StreamFormat::PlainText => (
                EventKind::Message,
                json!({"type": "message", "content": line}),
            ),
            StreamFormat::Ndjson => match classify(line) {
                Ok(classified) => classified,
                Err(err) => {
                    self.parse_errors += 1;
                    tracing::debug!(error = %err, line_len = line.len(), "Unparseable stream line");
                    let payload = json!({
                        "type": "error",
                        "parse_error": true,
                        "error": err.to_string(),
                        "raw": line,
                    });
                    return Some(self.emit(
                        EventKind::Error,
                        payload,
                        line.to_string(),
                        false,
                        EventOrigin::ParseError,
                    ));
                }
            },
        };

        let terminal = kind.can_terminate() && !self.terminal_seen;
        Some(self.emit(kind, payload, line.to_string(), terminal, EventOrigin::Wire))
    }

    /// Close the sequence, emitting a synthetic terminal event if the wire
    /// never produced one.
    pub fn finish(&mut self) -> Option<StreamEvent> {
        if self.terminal_seen {
            return None;
        }
        let payload = json!({
            "type": "result",
            "synthetic": true,
            "subtype": "stream_closed",
        });
        Some(self.emit(EventKind::Result, payload, String::new(), true, EventOrigin::Synthetic))
    }

    pub fn events_emitted(&self) -> u64 {
        self.next_sequence
    }

    pub fn parse_errors(&self) -> u64 {
        self.parse_errors
    }

    fn emit(
        &mut self,
        kind: EventKind,
        payload: Value,
        raw_line: String,
        terminal: bool,
        origin: EventOrigin,
    ) -> StreamEvent {
        if terminal {
            self.terminal_seen = true;
        }
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        StreamEvent {
            sequence,
            kind,
            payload,
            timestamp: Utc::now(),
            raw_line,
            terminal,
            origin,
        }
    }
}

fn classify(line: &str) -> Result<(EventKind, Value), StreamParseError> {
    let value: Value =
        serde_json::from_str(line).map_err(|e| StreamParseError::InvalidJson(e.to_string()))?;
    let tag = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(StreamParseError::MissingDiscriminator)?;
    let kind = EventKind::from_discriminator(tag)
        .ok_or_else(|| StreamParseError::UnknownDiscriminator(tag.to_string()))?;
    Ok((kind, value))
}

/// [`LineBuffer`] and [`EventDecoder`] combined: bytes in, events out.
#[derive(Debug)]
pub struct StreamDecoder {
    lines: LineBuffer,
    events: EventDecoder,
}

impl StreamDecoder {
    pub fn new(format: StreamFormat) -> Self {
        Self {
            lines: LineBuffer::new(),
            events: EventDecoder::new(format),
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.lines
            .push(chunk)
            .iter()
            .filter_map(|line| self.events.decode_line(line))
            .collect()
    }

    /// Flush the trailing partial line and the terminal event, if still owed.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        if let Some(line) = self.lines.finish() {
            out.extend(self.events.decode_line(&line));
        }
        out.extend(self.events.finish());
        out
    }

    pub fn events_emitted(&self) -> u64 {
        self.events.events_emitted()
    }

    pub fn parse_errors(&self) -> u64 {
        self.events.parse_errors()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = concat!(
        r#"{"type":"init","session_id":"s-1","agent_id":"coding-agent"}"#,
        "\n",
        r#"{"type":"message","role":"assistant","content":"Processing task..."}"#,
        "\n",
        r#"{"type":"tool_use","tool":"FileEditor","input":{"command":"view","path":"src/main.rs"}}"#,
        "\n",
        r#"{"type":"tool_result","content":"fn main() {}"}"#,
        "\n",
        r#"{"type":"message","role":"assistant","content":"Done: ✓"}"#,
        "\n",
        r#"{"type":"result","result":"ok","extra":{"cost":0.1}}"#,
        "\n",
    );

    /// Comparable projection that ignores timestamps.
    fn shape(events: &[StreamEvent]) -> Vec<(u64, EventKind, String, bool)> {
        events
            .iter()
            .map(|e| (e.sequence, e.kind, e.raw_line.clone(), e.terminal))
            .collect()
    }

    fn decode_chunks(chunks: &[&[u8]]) -> Vec<StreamEvent> {
        let mut decoder = StreamDecoder::new(StreamFormat::Ndjson);
        let mut out = Vec::new();
        for chunk in chunks {
            out.extend(decoder.feed(chunk));
        }
        out.extend(decoder.finish());
        out
    }

    #[test]
    fn line_buffer_holds_partial_records() {
        let mut buf = LineBuffer::new();
        assert!(buf.push(b"{\"type\":").is_empty());
        assert_eq!(buf.pending_len(), 8);
        let lines = buf.push(b"\"init\"}\n{\"ty");
        assert_eq!(lines, vec![r#"{"type":"init"}"#]);
        assert_eq!(buf.finish().as_deref(), Some(r#"{"ty"#));
        assert_eq!(buf.finish(), None);
    }

    #[test]
    fn line_buffer_resumes_scan_after_long_partial_line() {
        let mut buf = LineBuffer::new();
        let chunk = vec![b'x'; 8 * 1024];
        for _ in 0..2048 {
            assert!(buf.push(&chunk).is_empty());
        }
        assert_eq!(buf.pending_len(), 16 * 1024 * 1024);

        let lines = buf.push(b"y\nz");
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].len(), 16 * 1024 * 1024 + 1);
        assert!(lines[0].ends_with('y'));
        assert_eq!(buf.pending_len(), 1);
        assert_eq!(buf.push(b"\n"), vec!["z"]);
    }

    #[test]
    fn line_buffer_strips_carriage_returns() {
        let mut buf = LineBuffer::new();
        assert_eq!(buf.push(b"a\r\nb\n"), vec!["a", "b"]);
    }

    #[test]
    fn decoding_is_independent_of_chunk_boundaries() {
        let bytes = SAMPLE.as_bytes();
        let all_at_once = decode_chunks(&[bytes]);

        let per_line: Vec<&[u8]> = SAMPLE.split_inclusive('\n').map(str::as_bytes).collect();
        assert_eq!(shape(&decode_chunks(&per_line)), shape(&all_at_once));

        for split in 1..bytes.len() {
            let (a, b) = bytes.split_at(split);
            assert_eq!(
                shape(&decode_chunks(&[a, b])),
                shape(&all_at_once),
                "split at byte {split}"
            );
        }

        let single_bytes: Vec<&[u8]> = bytes.chunks(1).collect();
        assert_eq!(shape(&decode_chunks(&single_bytes)), shape(&all_at_once));
    }

    #[test]
    fn well_formed_lines_get_gapless_sequence_numbers() {
        let events = decode_chunks(&[SAMPLE.as_bytes()]);
        let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, (0..6).collect::<Vec<_>>());
        assert!(events.iter().all(|e| !e.is_parse_error()));
    }

    #[test]
    fn malformed_line_is_isolated() {
        let input = concat!(
            r#"{"type":"message","content":"first"}"#,
            "\n",
            "{not json at all\n",
            r#"{"type":"message","content":"second"}"#,
            "\n",
        );
        let mut decoder = StreamDecoder::new(StreamFormat::Ndjson);
        let mut events = decoder.feed(input.as_bytes());
        events.extend(decoder.finish());

        let messages: Vec<_> = events.iter().filter(|e| e.kind == EventKind::Message).collect();
        let parse_errors: Vec<_> = events.iter().filter(|e| e.is_parse_error()).collect();
        assert_eq!(messages.len(), 2);
        assert_eq!(parse_errors.len(), 1);
        assert_eq!(parse_errors[0].payload["raw"], "{not json at all");
        assert!(!parse_errors[0].terminal);
        assert_eq!(decoder.parse_errors(), 1);
    }

    #[test]
    fn unknown_and_missing_discriminators_become_error_events() {
        let mut decoder = EventDecoder::new(StreamFormat::Ndjson);
        let unknown = decoder.decode_line(r#"{"type":"content_block_delta","delta":"x"}"#).unwrap();
        let missing = decoder.decode_line(r#"{"content":"no type"}"#).unwrap();

        assert_eq!(unknown.kind, EventKind::Error);
        assert!(unknown.payload["error"].as_str().unwrap().contains("content_block_delta"));
        assert_eq!(missing.kind, EventKind::Error);
        assert_eq!(decoder.parse_errors(), 2);
    }

    #[test]
    fn unknown_fields_are_tolerated() {
        let mut decoder = EventDecoder::new(StreamFormat::Ndjson);
        let ev = decoder
            .decode_line(r#"{"type":"message","content":"hi","brand_new_field":[1,2,3]}"#)
            .unwrap();
        assert_eq!(ev.kind, EventKind::Message);
        assert_eq!(decoder.parse_errors(), 0);
    }

    #[test]
    fn wire_fields_named_like_origin_flags_are_ordinary_data() {
        let mut decoder = EventDecoder::new(StreamFormat::Ndjson);
        let msg = decoder
            .decode_line(r#"{"type":"message","content":"important","parse_error":true}"#)
            .unwrap();
        let result = decoder
            .decode_line(r#"{"type":"result","result":"ok","synthetic":true}"#)
            .unwrap();

        assert!(!msg.is_parse_error());
        assert_eq!(msg.origin, EventOrigin::Wire);
        assert!(result.terminal);
        assert!(!result.is_synthetic());
        assert_eq!(decoder.parse_errors(), 0);
    }

    #[test]
    fn synthetic_terminal_when_stream_ends_without_result() {
        let events = decode_chunks(&[b"{\"type\":\"message\",\"content\":\"a\"}\n"]);
        assert_eq!(events.len(), 2);
        let last = events.last().unwrap();
        assert!(last.terminal);
        assert!(last.is_synthetic());
        assert_eq!(last.sequence, 1);
    }

    #[test]
    fn exactly_one_terminal_event() {
        let input = concat!(
            r#"{"type":"result","result":"first"}"#,
            "\n",
            r#"{"type":"error","message":"late"}"#,
            "\n",
        );
        let events = decode_chunks(&[input.as_bytes()]);
        assert_eq!(events.iter().filter(|e| e.terminal).count(), 1);
        assert!(events[0].terminal);
        assert!(!events.iter().any(StreamEvent::is_synthetic));
    }

    #[test]
    fn empty_stream_still_yields_a_terminal() {
        let events = decode_chunks(&[]);
        assert_eq!(events.len(), 1);
        assert!(events[0].terminal);
        assert_eq!(events[0].sequence, 0);
    }

    #[test]
    fn blank_lines_are_skipped() {
        let events = decode_chunks(&[b"\n\n  \n{\"type\":\"result\"}\n"]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].sequence, 0);
    }

    #[test]
    fn trailing_line_without_newline_is_parsed() {
        let events = decode_chunks(&[b"{\"type\":\"result\",\"result\":\"x\"}"]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Result);
    }

    #[test]
    fn plain_text_lines_become_messages() {
        let mut decoder = StreamDecoder::new(StreamFormat::PlainText);
        let mut events = decoder.feed(b"hello\nnot {json\n");
        events.extend(decoder.finish());

        assert_eq!(events[0].kind, EventKind::Message);
        assert_eq!(events[1].text().as_deref(), Some("not {json"));
        assert_eq!(decoder.parse_errors(), 0);
        assert!(events[2].is_synthetic());
    }
}
