//! Trace construction and id-indexed lookups.
//!
//! A `Trace` owns the ordered top-level events plus the side tables that
//! resolve tool-call correlation without back-references: event ids are
//! assigned in first-seen walk order (a message before its nested calls,
//! nested calls before the next top-level event), so `EventId` doubles as
//! the temporal order used by the dataflow relation.

use std::collections::HashMap;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::event::{
    EventId, EventRef, Message, RawToolCall, ToolCall, ToolFunction, ToolOutput, TopEvent,
    TraceEvent,
};
use crate::violation::{Warning, WarningKind};

/// Malformed trace input. In lenient mode most defects degrade to
/// [`Warning`]s; strict mode turns them into hard errors.
#[derive(Debug, Error)]
pub enum TraceError {
    #[error("invalid trace JSON: {message}")]
    Json { message: String },
    #[error("duplicate tool call id `{id}`")]
    DuplicateCallId { id: String },
    #[error("tool output references unknown tool call id `{id}`")]
    UnmatchedOutput { id: String },
    #[error("tool call `{id}` carries non-object arguments")]
    NonObjectArguments { id: String },
}

#[derive(Debug, Clone, Copy)]
enum NodeSlot {
    Top { index: usize },
    Call { top: usize, call: usize },
}

/// An ordered, immutable agent trace with id-indexed side tables.
#[derive(Debug)]
pub struct Trace {
    events: Vec<TopEvent>,
    nodes: Vec<NodeSlot>,
    call_index: HashMap<String, EventId>,
    output_of_call: HashMap<EventId, EventId>,
    call_of_output: HashMap<EventId, EventId>,
    parent_message: HashMap<EventId, EventId>,
    warnings: Vec<Warning>,
}

impl Trace {
    /// Build a trace in lenient mode: defects are tolerated and surfaced via
    /// [`Trace::warnings`].
    pub fn from_events(events: Vec<TraceEvent>) -> Result<Self, TraceError> {
        Self::build(events, false)
    }

    /// Build a trace in strict mode: every input defect is an error.
    pub fn from_events_strict(events: Vec<TraceEvent>) -> Result<Self, TraceError> {
        Self::build(events, true)
    }

    /// Parse a JSON array of trace entries and build leniently.
    pub fn from_json(source: &str) -> Result<Self, TraceError> {
        let events: Vec<TraceEvent> = serde_json::from_str(source).map_err(|e| TraceError::Json {
            message: e.to_string(),
        })?;
        Self::build(events, false)
    }

    fn build(raw: Vec<TraceEvent>, strict: bool) -> Result<Self, TraceError> {
        let mut trace = Self {
            events: Vec::with_capacity(raw.len()),
            nodes: Vec::new(),
            call_index: HashMap::new(),
            output_of_call: HashMap::new(),
            call_of_output: HashMap::new(),
            parent_message: HashMap::new(),
            warnings: Vec::new(),
        };

        for entry in raw {
            let top = trace.events.len();
            if entry.role == "tool" {
                if let Some(call_id) = entry.tool_call_id {
                    trace.push_output(top, call_id, entry.content.unwrap_or(Value::Null), strict)?;
                    continue;
                }
                trace.warn(format!(
                    "tool-role entry {top} has no tool_call_id; treated as a message"
                ));
            }

            let message_id = trace.push_node(NodeSlot::Top { index: top });
            let mut calls = Vec::with_capacity(entry.tool_calls.len());
            for (index, call) in entry.tool_calls.into_iter().enumerate() {
                let call_event = trace.push_node(NodeSlot::Call { top, call: index });
                trace.parent_message.insert(call_event, message_id);
                calls.push(trace.normalize_call(call, call_event, strict)?);
            }
            trace.events.push(TopEvent::Message(Message {
                role: entry.role,
                content: entry.content,
                tool_calls: calls,
            }));
        }

        Ok(trace)
    }

    fn push_output(
        &mut self,
        top: usize,
        call_id: String,
        content: Value,
        strict: bool,
    ) -> Result<(), TraceError> {
        let output_event = self.push_node(NodeSlot::Top { index: top });
        match self.call_index.get(&call_id) {
            Some(&call_event) => {
                self.output_of_call.insert(call_event, output_event);
                self.call_of_output.insert(output_event, call_event);
            }
            None => {
                if strict {
                    return Err(TraceError::UnmatchedOutput { id: call_id });
                }
                self.warn(format!(
                    "tool output at {top} references unknown tool call id `{call_id}`"
                ));
            }
        }
        self.events.push(TopEvent::ToolOutput(ToolOutput {
            tool_call_id: call_id,
            content,
        }));
        Ok(())
    }

    fn normalize_call(
        &mut self,
        raw: RawToolCall,
        call_event: EventId,
        strict: bool,
    ) -> Result<ToolCall, TraceError> {
        let arguments = match raw.function.arguments {
            Value::Object(map) => map,
            Value::String(text) => match serde_json::from_str::<Value>(&text) {
                Ok(Value::Object(map)) => map,
                _ => {
                    if strict {
                        return Err(TraceError::NonObjectArguments { id: raw.id });
                    }
                    self.warn(format!(
                        "tool call `{}` arguments are not a JSON object; treated as empty",
                        raw.id
                    ));
                    Map::new()
                }
            },
            Value::Null => Map::new(),
            _ => {
                if strict {
                    return Err(TraceError::NonObjectArguments { id: raw.id });
                }
                self.warn(format!(
                    "tool call `{}` arguments are not a JSON object; treated as empty",
                    raw.id
                ));
                Map::new()
            }
        };

        if self.call_index.contains_key(&raw.id) {
            if strict {
                return Err(TraceError::DuplicateCallId { id: raw.id });
            }
            // First call with this id keeps the correlation index.
            self.warn(format!("duplicate tool call id `{}`", raw.id));
        } else {
            self.call_index.insert(raw.id.clone(), call_event);
        }

        Ok(ToolCall {
            id: raw.id,
            call_type: raw.call_type,
            function: ToolFunction {
                name: raw.function.name,
                arguments,
            },
        })
    }

    fn push_node(&mut self, slot: NodeSlot) -> EventId {
        let id = EventId::new(self.nodes.len() as u64);
        self.nodes.push(slot);
        id
    }

    fn warn(&mut self, message: String) {
        tracing::warn!("trace input: {message}");
        self.warnings.push(Warning::new(WarningKind::TraceInput, message));
    }

    /// Defects tolerated during construction.
    #[must_use]
    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    /// Number of top-level events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Total number of addressable events, nested tool calls included.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Resolve an id to its event. Ids outside this trace return `None`.
    #[must_use]
    pub fn event(&self, id: EventId) -> Option<EventRef<'_>> {
        let slot = self.nodes.get(id.value() as usize)?;
        Some(match *slot {
            NodeSlot::Top { index } => match &self.events[index] {
                TopEvent::Message(message) => EventRef::Message(message),
                TopEvent::ToolOutput(output) => EventRef::ToolOutput(output),
            },
            NodeSlot::Call { top, call } => match &self.events[top] {
                TopEvent::Message(message) => EventRef::ToolCall(&message.tool_calls[call]),
                TopEvent::ToolOutput(_) => unreachable!("calls only nest inside messages"),
            },
        })
    }

    /// All event ids in temporal order.
    pub fn event_ids(&self) -> impl Iterator<Item = EventId> + '_ {
        (0..self.nodes.len() as u64).map(EventId::new)
    }

    /// Messages in trace order.
    pub fn messages(&self) -> impl Iterator<Item = (EventId, &Message)> {
        self.event_ids().filter_map(|id| match self.event(id) {
            Some(EventRef::Message(message)) => Some((id, message)),
            _ => None,
        })
    }

    /// Nested tool calls in trace order.
    pub fn tool_calls(&self) -> impl Iterator<Item = (EventId, &ToolCall)> {
        self.event_ids().filter_map(|id| match self.event(id) {
            Some(EventRef::ToolCall(call)) => Some((id, call)),
            _ => None,
        })
    }

    /// Tool outputs in trace order.
    pub fn tool_outputs(&self) -> impl Iterator<Item = (EventId, &ToolOutput)> {
        self.event_ids().filter_map(|id| match self.event(id) {
            Some(EventRef::ToolOutput(output)) => Some((id, output)),
            _ => None,
        })
    }

    /// Dotted json-path of the event within the original trace input, e.g.
    /// `"3"` for a top-level entry or `"1.tool_calls.0"` for a nested call.
    #[must_use]
    pub fn json_path(&self, id: EventId) -> Option<String> {
        match *self.nodes.get(id.value() as usize)? {
            NodeSlot::Top { index } => Some(index.to_string()),
            NodeSlot::Call { top, call } => Some(format!("{top}.tool_calls.{call}")),
        }
    }

    /// The output correlated with a tool call, if any arrived.
    #[must_use]
    pub fn output_for_call(&self, call: EventId) -> Option<EventId> {
        self.output_of_call.get(&call).copied()
    }

    /// The call correlated with a tool output, if its id matched.
    #[must_use]
    pub fn call_for_output(&self, output: EventId) -> Option<EventId> {
        self.call_of_output.get(&output).copied()
    }

    /// The assistant message a nested tool call belongs to.
    #[must_use]
    pub fn message_of_call(&self, call: EventId) -> Option<EventId> {
        self.parent_message.get(&call).copied()
    }

    /// Resolve a tool call by its wire id.
    #[must_use]
    pub fn call_by_id(&self, call_id: &str) -> Option<EventId> {
        self.call_index.get(call_id).copied()
    }
}
