//! Core event domain model.
//!
//! Contains the `Event` sum over the three trace event kinds and the serde
//! wire model accepted from callers. The engine never mutates events; all
//! derived structure (ids, indexes, dataflow) lives outside them.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Stable identity of an event within one trace.
///
/// Assigned by `Trace` construction in first-seen order; nested tool calls
/// receive their own ids. Equality and hashing are total and cheap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(u64);

impl EventId {
    #[must_use]
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A conversation message. Ordering in the trace is significant.
///
/// Roles are open-ended; unknown roles pass through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub content: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub tool_calls: Vec<ToolCall>,
}

impl Message {
    /// Text view of the content, when the content is a plain string.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        self.content.as_ref().and_then(Value::as_str)
    }
}

/// A tool invocation nested inside an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: ToolFunction,
}

/// Name and arguments of a tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolFunction {
    pub name: String,
    pub arguments: Map<String, Value>,
}

/// Output produced for an earlier tool call, correlated by `tool_call_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub tool_call_id: String,
    pub content: Value,
}

impl ToolOutput {
    /// Text view of the content, when the content is a plain string.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        self.content.as_str()
    }
}

/// A top-level trace entry: messages and tool outputs.
///
/// Tool calls only appear nested inside an assistant message's `tool_calls`.
#[derive(Debug, Clone, PartialEq)]
pub enum TopEvent {
    Message(Message),
    ToolOutput(ToolOutput),
}

impl TopEvent {
    #[must_use]
    pub fn role(&self) -> &str {
        match self {
            Self::Message(message) => &message.role,
            Self::ToolOutput(_) => "tool",
        }
    }
}

/// Borrowed view of any event kind, used by pattern matching in the evaluator.
#[derive(Debug, Clone, Copy)]
pub enum EventRef<'a> {
    Message(&'a Message),
    ToolCall(&'a ToolCall),
    ToolOutput(&'a ToolOutput),
}

impl EventRef<'_> {
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Message(_) => "Message",
            Self::ToolCall(_) => "ToolCall",
            Self::ToolOutput(_) => "ToolOutput",
        }
    }
}

/// Wire model of one trace entry as supplied by callers.
///
/// A flat shape that covers all roles: `role: "tool"` plus `tool_call_id`
/// classifies the entry as a tool output, anything else as a message. Tool
/// call `arguments` may arrive as an object or as a JSON-encoded string
/// (the common provider encoding); strings are decoded during normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub content: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub tool_calls: Vec<RawToolCall>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tool_call_id: Option<String>,
}

impl TraceEvent {
    /// Convenience constructor for a plain message.
    #[must_use]
    pub fn message(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: Some(Value::String(content.into())),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// Convenience constructor for an assistant message carrying tool calls.
    #[must_use]
    pub fn assistant_calls(calls: Vec<RawToolCall>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: None,
            tool_calls: calls,
            tool_call_id: None,
        }
    }

    /// Convenience constructor for a tool output.
    #[must_use]
    pub fn tool_output(call_id: impl Into<String>, content: Value) -> Self {
        Self {
            role: "tool".to_string(),
            content: Some(content),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
        }
    }
}

/// Wire model of a nested tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawToolCall {
    pub id: String,
    #[serde(rename = "type", default = "default_call_type")]
    pub call_type: String,
    pub function: RawToolFunction,
}

impl RawToolCall {
    /// Convenience constructor with object arguments.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            call_type: default_call_type(),
            function: RawToolFunction {
                name: name.into(),
                arguments,
            },
        }
    }
}

fn default_call_type() -> String {
    "function".to_string()
}

/// Wire model of a tool call's function block. `arguments` is left as a raw
/// `Value` so both object and string encodings deserialize.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawToolFunction {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn trace_event_deserializes_message_shape() {
        let event: TraceEvent =
            serde_json::from_value(json!({"role": "user", "content": "hello"})).unwrap();
        assert_eq!(event.role, "user");
        assert!(event.tool_calls.is_empty());
        assert!(event.tool_call_id.is_none());
    }

    #[test]
    fn trace_event_deserializes_tool_output_shape() {
        let event: TraceEvent = serde_json::from_value(
            json!({"role": "tool", "tool_call_id": "c1", "content": {"ok": true}}),
        )
        .unwrap();
        assert_eq!(event.tool_call_id.as_deref(), Some("c1"));
    }

    #[test]
    fn raw_tool_call_accepts_string_arguments() {
        let call: RawToolCall = serde_json::from_value(json!({
            "id": "c1",
            "type": "function",
            "function": {"name": "send_email", "arguments": "{\"to\": \"Peter\"}"}
        }))
        .unwrap();
        assert!(call.function.arguments.is_string());
    }

    #[test]
    fn unknown_role_passes_through() {
        let event: TraceEvent =
            serde_json::from_value(json!({"role": "critic", "content": "hmm"})).unwrap();
        assert_eq!(event.role, "critic");
    }
}
