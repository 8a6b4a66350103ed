//! Streaming extractor for `<tool_call>` frames in subprocess output.
//!
//! Subprocess engines embed structured tool calls inside free-form text:
//!
//! ```text
//! Let me check that. <tool_call>{"tool":"file_read","args":{"path":"x"}}</tool_call> done.
//! ```
//!
//! The parser works chunk by chunk. Outside a tag it emits text eagerly,
//! holding back only as many trailing bytes as could still turn out to be
//! the start of an open tag. Inside a tag it buffers up to 1 MiB; past that
//! the frame is abandoned and re-emitted as plain text. On end of stream
//! any incomplete tag is flushed as raw text.

use bytes::BytesMut;
use serde_json::Value;

const OPEN_TAG: &str = "<tool_call>";
const CLOSE_TAG: &str = "</tool_call>";
const MAX_TAG_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedChunk {
    Text(String),
    ToolCall { tool: String, args: Value },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ParserState {
    Outside,
    Inside,
}

#[derive(Debug)]
pub struct ToolCallStreamParser {
    state: ParserState,
    buf: BytesMut,
}

impl ToolCallStreamParser {
    pub fn new() -> Self {
        Self {
            state: ParserState::Outside,
            buf: BytesMut::new(),
        }
    }

    /// Feeds one chunk, returning everything that can be emitted so far.
    pub fn push(&mut self, chunk: &str) -> Vec<ParsedChunk> {
        self.buf.extend_from_slice(chunk.as_bytes());
        let mut out = Vec::new();
        loop {
            match self.state {
                ParserState::Outside => {
                    if !self.scan_outside(&mut out) {
                        break;
                    }
                }
                ParserState::Inside => {
                    if !self.scan_inside(&mut out) {
                        break;
                    }
                }
            }
        }
        out
    }

    /// Flushes the parser at end of stream. An unterminated tag comes back
    /// as the raw text it arrived as, open tag included.
    pub fn finish(&mut self) -> Vec<ParsedChunk> {
        let mut out = Vec::new();
        if !self.buf.is_empty() {
            let mut text = String::new();
            if self.state == ParserState::Inside {
                text.push_str(OPEN_TAG);
            }
            text.push_str(&String::from_utf8_lossy(&self.buf));
            out.push(ParsedChunk::Text(text));
            self.buf.clear();
        }
        self.state = ParserState::Outside;
        out
    }

    /// Returns true when state changed and scanning should continue.
    fn scan_outside(&mut self, out: &mut Vec<ParsedChunk>) -> bool {
        if let Some(pos) = find(&self.buf, OPEN_TAG.as_bytes()) {
            if pos > 0 {
                let text = self.buf.split_to(pos);
                push_text(out, &text);
            }
            let _ = self.buf.split_to(OPEN_TAG.len());
            self.state = ParserState::Inside;
            return true;
        }
        // No tag: emit everything except a trailing run that is still a
        // prefix of the open tag (at most len(open_tag) - 1 bytes).
        let hold = prefix_overlap(&self.buf, OPEN_TAG.as_bytes());
        let emit_len = self.buf.len() - hold;
        if emit_len > 0 {
            let text = self.buf.split_to(emit_len);
            push_text(out, &text);
        }
        false
    }

    fn scan_inside(&mut self, out: &mut Vec<ParsedChunk>) -> bool {
        if let Some(pos) = find(&self.buf, CLOSE_TAG.as_bytes()) {
            let payload = self.buf.split_to(pos);
            let _ = self.buf.split_to(CLOSE_TAG.len());
            self.state = ParserState::Outside;
            out.push(parse_payload(&payload));
            return true;
        }
        if self.buf.len() > MAX_TAG_BYTES {
            // Runaway frame: abandon it and emit as text.
            let mut text = String::from(OPEN_TAG);
            text.push_str(&String::from_utf8_lossy(&self.buf));
            self.buf.clear();
            out.push(ParsedChunk::Text(text));
            self.state = ParserState::Outside;
            return true;
        }
        false
    }
}

impl Default for ToolCallStreamParser {
    fn default() -> Self {
        Self::new()
    }
}

fn push_text(out: &mut Vec<ParsedChunk>, bytes: &[u8]) {
    out.push(ParsedChunk::Text(
        String::from_utf8_lossy(bytes).into_owned(),
    ));
}

fn parse_payload(payload: &[u8]) -> ParsedChunk {
    let parsed: Option<(String, Value)> = serde_json::from_slice::<Value>(payload)
        .ok()
        .and_then(|v| {
            let tool = v.get("tool")?.as_str()?.to_string();
            let args = v.get("args").cloned().unwrap_or(Value::Null);
            Some((tool, args))
        });
    match parsed {
        Some((tool, args)) => ParsedChunk::ToolCall { tool, args },
        None => {
            // Malformed frame: degrade to text rather than lose output.
            let mut text = String::from(OPEN_TAG);
            text.push_str(&String::from_utf8_lossy(payload));
            text.push_str(CLOSE_TAG);
            ParsedChunk::Text(text)
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Length of the longest suffix of `buf` that is a proper prefix of `tag`.
fn prefix_overlap(buf: &[u8], tag: &[u8]) -> usize {
    let max = (tag.len() - 1).min(buf.len());
    for len in (1..=max).rev() {
        if buf[buf.len() - len..] == tag[..len] {
            return len;
        }
    }
    0
}
