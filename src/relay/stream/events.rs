//! Typed stream events and the UTF-8 continuation buffer (spec.md §4.5.5,
//! §4.5.6).
//!
//! The wire parses events by string-comparing `:event-type`; this module
//! decodes that tag once per frame into a sum type so every downstream
//! handler matches on it instead of re-parsing strings.

/// One completed (possibly repaired) tool call, ready to hand to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolUseCall {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
    /// Set when the input JSON was recovered from a truncated buffer
    /// (spec.md §4.5.7).
    pub truncated: bool,
}

/// A typed event dispatched to the `Chat` callback, decoded once per frame.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Newly completable text prefix from `assistantResponseEvent`.
    TextDelta(String),
    /// Newly completable "thinking" text from `reasoningContentEvent`.
    ReasoningDelta(String),
    /// `messageMetadataEvent`'s token-usage breakdown.
    Usage {
        input_tokens: u64,
        output_tokens: u64,
        cache_read: u64,
        cache_write: u64,
        reasoning: u64,
    },
    /// `meteringEvent`'s incremental credit usage for this request.
    CreditsDelta(f64),
    /// A finalized tool call.
    ToolUse(ToolUseCall),
    /// Post-stream advisory text (web links, citations, followups, etc.)
    /// appended to the main content.
    Advisory(String),
    /// Stream terminated normally.
    Done,
}

/// Extracts a string field's raw bytes directly from a JSON payload without
/// going through `serde_json`, so a multi-byte code point split across two
/// events never gets replaced with U+FFFD by a naive decoder.
///
/// Scans for `"<field_name>":"` and returns the bytes up to (but not
/// including) the closing, non-escaped quote.
pub fn extract_raw_string_field<'a>(payload: &'a [u8], field_name: &str) -> Option<&'a [u8]> {
    let needle = format!("\"{field_name}\":\"");
    let needle = needle.as_bytes();
    let start = find_subslice(payload, needle)? + needle.len();

    let mut i = start;
    while i < payload.len() {
        match payload[i] {
            b'\\' => i += 2,
            b'"' => return Some(&payload[start..i]),
            _ => i += 1,
        }
    }
    None
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Accumulates raw bytes across events, emitting only the prefix whose last
/// code point is fully present. At most 3 trailing bytes are ever retained.
#[derive(Debug, Default)]
pub struct Utf8ContinuationBuffer {
    pending: Vec<u8>,
}

impl Utf8ContinuationBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `bytes` and return the newly-emittable text, if any.
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let boundary = complete_prefix_len(&self.pending);
        let completed: Vec<u8> = self.pending.drain(..boundary).collect();
        debug_assert!(std::str::from_utf8(&completed).is_ok());
        String::from_utf8_lossy(&completed).into_owned()
    }

    /// Flush whatever remains verbatim, for stream EOF.
    pub fn flush(&mut self) -> String {
        let remaining = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&remaining).into_owned()
    }
}

/// Length of the longest prefix of `buf` that ends on a complete UTF-8 code
/// point boundary, leaving at most a partial trailing multi-byte sequence.
fn complete_prefix_len(buf: &[u8]) -> usize {
    let len = buf.len();
    if len == 0 {
        return 0;
    }
    let scan_back = 4.min(len);
    for back in 1..=scan_back {
        let start = len - back;
        let byte = buf[start];
        if byte & 0b1100_0000 == 0b1000_0000 {
            continue; // continuation byte; keep walking backward
        }
        let expected = utf8_sequence_len(byte);
        if expected == 0 {
            return len; // not valid UTF-8 lead byte; nothing we can do
        }
        return if start + expected <= len { len } else { start };
    }
    len
}

fn utf8_sequence_len(lead_byte: u8) -> usize {
    if lead_byte & 0x80 == 0 {
        1
    } else if lead_byte & 0xE0 == 0xC0 {
        2
    } else if lead_byte & 0xF0 == 0xE0 {
        3
    } else if lead_byte & 0xF8 == 0xF0 {
        4
    } else {
        0
    }
}
