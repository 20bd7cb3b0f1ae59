//! The direct-flow relation between trace events.
//!
//! `a -> b` deliberately over-approximates: any earlier context that could
//! plausibly have influenced a later tool call is admitted, and rule
//! authors narrow it with content and pattern checks. The relation is not
//! transitively closed; rule bodies compose chains explicitly.
//!
//! Decisions layered on the over-approximation:
//! - a tool call flows to its own output (id correlation) and to any later
//!   tool call, except sibling calls of the same assistant message, which
//!   are mutually non-flowing;
//! - a tool output flows to a later tool call unless an intervening user or
//!   system message unambiguously originates the call's arguments (every
//!   non-trivial string argument occurs verbatim in that message);
//! - messages and tool outputs flow to any later event.

use std::collections::HashMap;

use serde_json::Value;

use warden_types::{EventId, EventRef, Trace};

/// Memoized pairwise decisions. Event ids are assigned in first-seen walk
/// order, so a decided pair stays valid when the trace is extended with new
/// events; the monitor keeps one cache across incremental checks.
#[derive(Debug, Default)]
pub struct FlowCache {
    decided: HashMap<(EventId, EventId), bool>,
}

impl FlowCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.decided.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.decided.is_empty()
    }
}

/// Does information flow directly from `a` to `b`?
pub fn flows(trace: &Trace, cache: &mut FlowCache, a: EventId, b: EventId) -> bool {
    if a >= b {
        return false;
    }
    if let Some(&decided) = cache.decided.get(&(a, b)) {
        return decided;
    }
    let result = compute(trace, a, b);
    cache.decided.insert((a, b), result);
    result
}

fn compute(trace: &Trace, a: EventId, b: EventId) -> bool {
    let (Some(from), Some(to)) = (trace.event(a), trace.event(b)) else {
        return false;
    };
    match (from, to) {
        // A call reaches its own output; other outputs are not downstream
        // of it directly.
        (EventRef::ToolCall(_), EventRef::ToolOutput(_)) => {
            trace.output_for_call(a) == Some(b)
        }
        // Parallel calls of one assistant message are mutually non-flowing.
        (EventRef::ToolCall(_), EventRef::ToolCall(_)) => {
            trace.message_of_call(a) != trace.message_of_call(b)
        }
        (EventRef::ToolCall(_), EventRef::Message(_)) => false,
        // Earlier output to later call, unless a user/system message in
        // between originates the call's arguments.
        (EventRef::ToolOutput(_), EventRef::ToolCall(call)) => {
            let argument_strings = string_arguments(call);
            !between(trace, a, b).any(|id| originates(trace, id, &argument_strings))
        }
        // Temporal precedence within the conversation window.
        (EventRef::ToolOutput(_) | EventRef::Message(_), _) => true,
    }
}

fn between(trace: &Trace, a: EventId, b: EventId) -> impl Iterator<Item = EventId> + '_ {
    trace
        .event_ids()
        .skip_while(move |&id| id <= a)
        .take_while(move |&id| id < b)
}

/// A user or system message originates the arguments when every collected
/// argument string occurs verbatim in its text.
fn originates(trace: &Trace, id: EventId, argument_strings: &[String]) -> bool {
    if argument_strings.is_empty() {
        return false;
    }
    let Some(EventRef::Message(message)) = trace.event(id) else {
        return false;
    };
    if message.role != "user" && message.role != "system" {
        return false;
    }
    let Some(text) = message.text() else {
        return false;
    };
    argument_strings
        .iter()
        .all(|argument| text.contains(argument.as_str()))
}

/// Non-trivial string leaves of the call's arguments, recursively.
fn string_arguments(call: &warden_types::ToolCall) -> Vec<String> {
    fn visit(value: &Value, out: &mut Vec<String>) {
        match value {
            Value::String(text) if text.len() >= 3 => out.push(text.clone()),
            Value::Array(items) => {
                for item in items {
                    visit(item, out);
                }
            }
            Value::Object(fields) => {
                for field in fields.values() {
                    visit(field, out);
                }
            }
            _ => {}
        }
    }
    let mut out = Vec::new();
    for value in call.function.arguments.values() {
        visit(value, &mut out);
    }
    out
}
