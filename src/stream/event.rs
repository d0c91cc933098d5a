use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Classification of one NDJSON record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Init,
    Message,
    ToolUse,
    ToolResult,
    Result,
    Error,
}

impl EventKind {
    /// Map a record's `type` field to a kind.
    pub fn from_discriminator(tag: &str) -> Option<Self> {
        match tag {
            "init" | "system" => Some(EventKind::Init),
            "message" | "assistant" | "user" => Some(EventKind::Message),
            "tool_use" => Some(EventKind::ToolUse),
            "tool_result" => Some(EventKind::ToolResult),
            "result" => Some(EventKind::Result),
            "error" => Some(EventKind::Error),
            _ => None,
        }
    }

    /// Kinds that may close an invocation.
    pub fn can_terminate(self) -> bool {
        matches!(self, EventKind::Result | EventKind::Error)
    }
}

/// Where an event came from. Set by the decoder, never read from the payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOrigin {
    /// A well-formed record from the agent.
    #[default]
    Wire,
    /// A line that could not be classified.
    ParseError,
    /// The terminal result emitted when the stream closed without one.
    Synthetic,
}

/// One parsed record from an agent's stdout.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamEvent {
    /// Position in this invocation's sequence, starting at 0.
    pub sequence: u64,
    pub kind: EventKind,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    /// The line as received, without its newline. Empty for synthetic events.
    pub raw_line: String,
    /// Set on exactly one event per invocation.
    pub terminal: bool,
    pub origin: EventOrigin,
}

impl StreamEvent {
    /// Session id announced by an init record, if any.
    pub fn session_id(&self) -> Option<&str> {
        if self.kind != EventKind::Init {
            return None;
        }
        self.payload.get("session_id").and_then(Value::as_str)
    }

    /// `true` for the terminal event emitted when the stream closed without one.
    pub fn is_synthetic(&self) -> bool {
        self.origin == EventOrigin::Synthetic
    }

    /// `true` for error events produced from lines that failed to parse.
    pub fn is_parse_error(&self) -> bool {
        self.origin == EventOrigin::ParseError
    }

    /// Human-readable content of the record.
    ///
    /// Understands both flat `content` strings and content-block arrays,
    /// including the nested `message.content` shape.
    pub fn text(&self) -> Option<String> {
        let p = &self.payload;
        match self.kind {
            EventKind::Message => content_text(p.get("content"))
                .or_else(|| p.get("message").and_then(|m| content_text(m.get("content"))))
                .or_else(|| string_field(p, "text")),
            EventKind::ToolUse => {
                let tool = string_field(p, "tool").or_else(|| string_field(p, "name"))?;
                match p.get("input") {
                    Some(input) => Some(format!("{tool} {input}")),
                    None => Some(tool),
                }
            }
            EventKind::ToolResult => content_text(p.get("content"))
                .or_else(|| string_field(p, "output"))
                .or_else(|| p.get("result").map(compact)),
            EventKind::Result => string_field(p, "result"),
            EventKind::Error => string_field(p, "message").or_else(|| string_field(p, "error")),
            EventKind::Init => None,
        }
    }
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

fn content_text(content: Option<&Value>) -> Option<String> {
    match content? {
        Value::String(s) => Some(s.clone()),
        Value::Array(blocks) => {
            let parts: Vec<&str> = blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect();
            (!parts.is_empty()).then(|| parts.join(""))
        }
        _ => None,
    }
}

fn compact(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
