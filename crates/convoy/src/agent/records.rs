//! Decoding of the assistant's line-delimited JSON output.
//!
//! The assistant writes one JSON record per line. Chunks arrive at arbitrary
//! byte boundaries, so a carry buffer reassembles lines across chunks. Records
//! are decoded defensively: anything that parses as JSON is kept verbatim, a
//! known `type` tag is only used for logging, and unknown tags pass through.

use serde_json::Value;

/// Record kinds the consumer understands. Anything else is `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// An assistant turn.
    Assistant,
    /// A user turn echoing tool results back into the transcript.
    User,
    /// The final result summary for an invocation.
    Result,
    /// A system notice (init, model info, ...).
    System,
    /// A tool invocation record.
    ToolUse,
    /// An error record.
    Error,
    /// Unrecognized tag, forwarded but otherwise ignored.
    Other,
}

/// Classify a record by its `type` tag.
pub fn kind(record: &Value) -> RecordKind {
    match record.get("type").and_then(Value::as_str) {
        Some("assistant") => RecordKind::Assistant,
        Some("user") => RecordKind::User,
        Some("result") => RecordKind::Result,
        Some("system") => RecordKind::System,
        Some("tool_use") => RecordKind::ToolUse,
        Some("error") => RecordKind::Error,
        _ => RecordKind::Other,
    }
}

/// Extract the session identifier a record may carry.
pub fn session_id(record: &Value) -> Option<&str> {
    record.get("session_id").and_then(Value::as_str)
}

/// Reassembles newline-delimited JSON records from stream chunks.
#[derive(Debug, Default)]
pub struct LineDecoder {
    partial: String,
}

impl LineDecoder {
    /// Feed a chunk and return every complete record it closed.
    ///
    /// Lines that are not valid JSON are dropped; line order is preserved
    /// within a chunk and across chunks.
    pub fn push(&mut self, chunk: &str) -> Vec<Value> {
        self.partial.push_str(chunk);
        let mut records = Vec::new();
        while let Some(pos) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=pos).collect();
            if let Some(record) = parse_line(&line) {
                records.push(record);
            }
        }
        records
    }

    /// Flush a trailing record that was not newline-terminated.
    pub fn finish(&mut self) -> Option<Value> {
        let rest = std::mem::take(&mut self.partial);
        parse_line(&rest)
    }
}

fn parse_line(line: &str) -> Option<Value> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    serde_json::from_str(line).ok()
}
