//! Violation localization.
//!
//! A `Range` points at the sub-object of the trace that participated in
//! satisfying a rule: the event, a dotted json-path from the trace root, and
//! an optional character span into the string at that path.

use serde::{Deserialize, Serialize};

use crate::event::EventId;

/// Localization pointer into a trace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Range {
    /// Event the range belongs to.
    pub event: EventId,
    /// Dotted path of integer indices and string keys against the original
    /// trace, e.g. `"3.content"` or `"1.tool_calls.0.function.arguments.to"`.
    pub json_path: String,
    /// Start of a character (not byte) span into the string at `json_path`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub start: Option<usize>,
    /// Exclusive end of the character span.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub end: Option<usize>,
}

impl Range {
    /// A range covering a whole sub-object, no character span.
    #[must_use]
    pub fn object(event: EventId, json_path: impl Into<String>) -> Self {
        Self {
            event,
            json_path: json_path.into(),
            start: None,
            end: None,
        }
    }

    /// A range with a character span into the string at the path.
    #[must_use]
    pub fn span(event: EventId, json_path: impl Into<String>, start: usize, end: usize) -> Self {
        Self {
            event,
            json_path: json_path.into(),
            start: Some(start),
            end: Some(end),
        }
    }

    /// Extend this range's path by one segment (a key or an index).
    #[must_use]
    pub fn child(&self, segment: &str) -> Self {
        Self {
            event: self.event,
            json_path: join_path(&self.json_path, segment),
            start: None,
            end: None,
        }
    }
}

/// Join two dotted path fragments, tolerating an empty prefix.
#[must_use]
pub fn join_path(prefix: &str, segment: &str) -> String {
    if prefix.is_empty() {
        segment.to_string()
    } else if segment.is_empty() {
        prefix.to_string()
    } else {
        format!("{prefix}.{segment}")
    }
}
