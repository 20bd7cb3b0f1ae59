//! Rule evaluation: typed generate-and-filter over the event set.
//!
//! Each compiled rule is a normalized step sequence; the evaluator walks it
//! depth-first, binding quantified variables to events (or collection
//! elements) and cutting a branch the moment a filter fails. Atoms are
//! three-valued: a detector that refuses, fails, or times out makes its
//! atom unknown, which cuts the branch and records one warning per
//! rule/detector pair. Every complete satisfying binding raises the rule's
//! error with the ranges its pattern matches and event field accesses
//! touched along the way.

use std::collections::HashSet;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::{Map, Value};

use warden_detectors::DetectorSet;
use warden_policy::ast::{BinaryOp, ErrorCtor, Expr, ExprKind, TypeName};
use warden_policy::{CompiledPolicy, CompiledRule, Step};
use warden_types::{
    DetectorOptions, EventId, EventRef, PolicyViolation, Range, RuleId, Trace, Warning,
    WarningKind, join_path,
};

use crate::dataflow::{FlowCache, flows};
use crate::matcher::{MatchOutcome, match_tool_call};

/// Cooperative cancellation signal, checked between bindings and between
/// rules. Cancelling never corrupts monitor state: fingerprints are only
/// committed for rules that ran to completion.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// A violation plus the event identities its binding touched (the monitor
/// fingerprints over them).
#[derive(Debug, Clone)]
pub(crate) struct RaisedViolation {
    pub violation: PolicyViolation,
    pub bound_events: Vec<EventId>,
}

#[derive(Debug)]
pub(crate) struct RuleEvaluation {
    pub rule: RuleId,
    pub raised: Vec<RaisedViolation>,
    /// False when cancellation interrupted this rule.
    pub completed: bool,
}

#[derive(Debug)]
pub(crate) struct EvalOutput {
    pub rules: Vec<RuleEvaluation>,
    pub warnings: Vec<Warning>,
    pub cancelled: bool,
}

pub(crate) fn evaluate(
    policy: &CompiledPolicy,
    trace: &Trace,
    detectors: &DetectorSet,
    parameters: &Map<String, Value>,
    detector_deadline: Option<Duration>,
    cancel: &CancelFlag,
    flow_cache: &mut FlowCache,
) -> EvalOutput {
    let mut evaluator = Evaluator {
        policy,
        trace,
        detectors,
        parameters,
        detector_deadline,
        cancel,
        flow_cache,
        warnings: Vec::new(),
        warned: HashSet::new(),
        cancelled: false,
    };

    let mut rules = Vec::with_capacity(policy.rules.len());
    for rule in &policy.rules {
        if evaluator.cancelled || cancel.is_cancelled() {
            evaluator.cancelled = true;
            rules.push(RuleEvaluation {
                rule: rule.id,
                raised: Vec::new(),
                completed: false,
            });
            continue;
        }
        let evaluation = evaluator.eval_rule(rule);
        tracing::debug!(
            rule = rule.id.value(),
            violations = evaluation.raised.len(),
            completed = evaluation.completed,
            "rule evaluated"
        );
        rules.push(evaluation);
    }

    EvalOutput {
        rules,
        warnings: evaluator.warnings,
        cancelled: evaluator.cancelled,
    }
}

/// Runtime value of an expression: an event identity, a list of event
/// identities (e.g. `m.tool_calls`), or plain data.
#[derive(Debug, Clone)]
enum Rt {
    Event(EventId),
    Events(Vec<EventId>),
    Value(Value),
}

/// An atom could not be decided because a detector did not answer.
#[derive(Debug)]
struct UnknownAtom {
    detector: String,
    reason: String,
}

type EvalResult = Result<Rt, UnknownAtom>;

/// Search state for one rule: the binding stack and the provenance ranges
/// accumulated along the current branch.
struct RuleState {
    bindings: Vec<(String, Rt)>,
    ranges: Vec<Range>,
    raised: Vec<RaisedViolation>,
}

struct Evaluator<'a> {
    policy: &'a CompiledPolicy,
    trace: &'a Trace,
    detectors: &'a DetectorSet,
    parameters: &'a Map<String, Value>,
    detector_deadline: Option<Duration>,
    cancel: &'a CancelFlag,
    flow_cache: &'a mut FlowCache,
    warnings: Vec<Warning>,
    warned: HashSet<(RuleId, String)>,
    cancelled: bool,
}

impl Evaluator<'_> {
    fn eval_rule(&mut self, rule: &CompiledRule) -> RuleEvaluation {
        let mut state = RuleState {
            bindings: Vec::new(),
            ranges: Vec::new(),
            raised: Vec::new(),
        };
        let completed = self.step(rule, 0, &mut state);
        RuleEvaluation {
            rule: rule.id,
            raised: state.raised,
            completed,
        }
    }

    /// Execute the plan from `index` under the current binding. Returns
    /// false when cancellation stopped the search.
    fn step(&mut self, rule: &CompiledRule, index: usize, state: &mut RuleState) -> bool {
        if self.cancel.is_cancelled() {
            self.cancelled = true;
            return false;
        }
        let Some(step) = rule.steps.get(index) else {
            self.raise(rule, state);
            return true;
        };
        match step {
            Step::Generate { var, kind } => {
                let candidates: Vec<EventId> = self
                    .trace
                    .event_ids()
                    .filter(|&id| {
                        self.trace
                            .event(id)
                            .is_some_and(|event| event_kind_matches(*kind, event))
                    })
                    .collect();
                for id in candidates {
                    let mark = state.ranges.len();
                    state.bindings.push((var.clone(), Rt::Event(id)));
                    let keep_going = self.step(rule, index + 1, state);
                    state.bindings.pop();
                    state.ranges.truncate(mark);
                    if !keep_going {
                        return false;
                    }
                }
                true
            }
            Step::Iterate { var, kind, source } => {
                let items = match self.eval_expr(source, rule, state) {
                    Ok(rt) => collection_items(rt, *kind, self.trace),
                    Err(unknown) => {
                        self.note_unknown(rule.id, unknown);
                        return true;
                    }
                };
                for item in items {
                    let mark = state.ranges.len();
                    state.bindings.push((var.clone(), item));
                    let keep_going = self.step(rule, index + 1, state);
                    state.bindings.pop();
                    state.ranges.truncate(mark);
                    if !keep_going {
                        return false;
                    }
                }
                true
            }
            Step::Filter(expr) => {
                let mark = state.ranges.len();
                match self.eval_expr(expr, rule, state) {
                    Ok(rt) if truthy(&rt) => self.step(rule, index + 1, state),
                    Ok(_) => {
                        state.ranges.truncate(mark);
                        true
                    }
                    Err(unknown) => {
                        state.ranges.truncate(mark);
                        self.note_unknown(rule.id, unknown);
                        true
                    }
                }
            }
        }
    }

    /// Construct and record the violation for a complete satisfying binding.
    fn raise(&mut self, rule: &CompiledRule, state: &mut RuleState) {
        let mut bound_events: Vec<EventId> = state
            .bindings
            .iter()
            .filter_map(|(_, rt)| match rt {
                Rt::Event(id) => Some(*id),
                _ => None,
            })
            .collect();
        bound_events.sort_unstable();
        bound_events.dedup();

        let mut ranges = Vec::new();
        for range in &state.ranges {
            if !ranges.contains(range) {
                ranges.push(range.clone());
            }
        }

        let violation = match &rule.ctor {
            ErrorCtor::Message { message, .. } => {
                let mut violation = PolicyViolation::new(message.clone(), rule.id);
                violation.ranges = ranges;
                violation
            }
            ErrorCtor::Call {
                name,
                message,
                kwargs,
                ..
            } => {
                let text = match self.eval_expr(message, rule, state) {
                    Ok(rt) => rt_to_text(&rt, self.trace),
                    Err(_) => "policy violation".to_string(),
                };
                let mut fields = Map::new();
                for (key, value_expr) in kwargs {
                    let value = match self.eval_expr(value_expr, rule, state) {
                        Ok(rt) => rt_to_value(&rt, self.trace),
                        Err(_) => Value::Null,
                    };
                    fields.insert(key.clone(), value);
                }
                let mut violation = PolicyViolation::new(text, rule.id).with_kind(name.clone());
                violation.fields = fields;
                violation.ranges = ranges;
                violation
            }
        };

        state.raised.push(RaisedViolation {
            violation,
            bound_events,
        });
    }

    fn note_unknown(&mut self, rule: RuleId, unknown: UnknownAtom) {
        if self.warned.insert((rule, unknown.detector.clone())) {
            tracing::warn!(
                "rule {rule}: detector `{}` did not answer: {}",
                unknown.detector,
                unknown.reason
            );
            self.warnings.push(Warning::new(
                WarningKind::DetectorUnavailable,
                format!(
                    "detector `{}` did not answer ({}); affected atoms were skipped",
                    unknown.detector, unknown.reason
                ),
            ));
        }
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn eval_expr(&mut self, expr: &Expr, rule: &CompiledRule, state: &mut RuleState) -> EvalResult {
        match &expr.kind {
            ExprKind::Str(value) => Ok(Rt::Value(Value::String(value.clone()))),
            ExprKind::Number(value) => Ok(Rt::Value(number_value(*value))),
            ExprKind::Bool(value) => Ok(Rt::Value(Value::Bool(*value))),
            ExprKind::Null => Ok(Rt::Value(Value::Null)),
            // A regex literal evaluates to its pattern text; `match` gives
            // it meaning.
            ExprKind::Regex(pattern) => Ok(Rt::Value(Value::String(pattern.clone()))),
            ExprKind::Var(name) => Ok(self.lookup(name, state)),
            // Declarations are rewritten into plain variables at compile
            // time; one reaching evaluation is inert.
            ExprKind::Decl { .. } => Ok(Rt::Value(Value::Null)),
            ExprKind::Not(inner) => {
                let mark = state.ranges.len();
                let result = self.eval_expr(inner, rule, state)?;
                // A negated atom asserts absence; nothing inside it locates
                // trace content that satisfied the rule.
                state.ranges.truncate(mark);
                Ok(Rt::Value(Value::Bool(!truthy(&result))))
            }
            ExprKind::Binary { op, lhs, rhs } => self.eval_binary(*op, lhs, rhs, rule, state),
            ExprKind::Is { subject, pattern } => {
                let subject = self.eval_expr(subject, rule, state)?;
                let Rt::Event(id) = subject else {
                    return Ok(Rt::Value(Value::Bool(false)));
                };
                let Some(EventRef::ToolCall(call)) = self.trace.event(id) else {
                    return Ok(Rt::Value(Value::Bool(false)));
                };
                let call_path = self.trace.json_path(id).unwrap_or_default();
                let call_range = Range::object(id, call_path);
                match match_tool_call(call, &call_range, pattern, self.policy, self.detectors) {
                    MatchOutcome::Matched(mut ranges) => {
                        state.ranges.append(&mut ranges);
                        Ok(Rt::Value(Value::Bool(true)))
                    }
                    MatchOutcome::NotMatched => Ok(Rt::Value(Value::Bool(false))),
                    MatchOutcome::Unknown(detector) => Err(UnknownAtom {
                        reason: format!("classifier match needs `{detector}`"),
                        detector,
                    }),
                }
            }
            ExprKind::Call { name, args, kwargs } => {
                self.eval_call(name, args, kwargs, rule, state)
            }
            ExprKind::Member { object, field } => {
                let object = self.eval_expr(object, rule, state)?;
                Ok(self.member(&object, field, state))
            }
            ExprKind::Index { object, index } => {
                let object = self.eval_expr(object, rule, state)?;
                let index = self.eval_expr(index, rule, state)?;
                Ok(index_rt(&object, &index))
            }
            ExprKind::List(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    let rt = self.eval_expr(item, rule, state)?;
                    values.push(rt_to_value(&rt, self.trace));
                }
                Ok(Rt::Value(Value::Array(values)))
            }
            ExprKind::Dict(entries) => {
                let mut fields = Map::new();
                for (key, value_expr) in entries {
                    let rt = self.eval_expr(value_expr, rule, state)?;
                    fields.insert(key.clone(), rt_to_value(&rt, self.trace));
                }
                Ok(Rt::Value(Value::Object(fields)))
            }
        }
    }

    fn lookup(&self, name: &str, state: &RuleState) -> Rt {
        if let Some((_, rt)) = state.bindings.iter().rev().find(|(bound, _)| bound == name) {
            return rt.clone();
        }
        if name == "input" {
            return Rt::Value(Value::Object(self.parameters.clone()));
        }
        Rt::Value(Value::Null)
    }

    fn eval_binary(
        &mut self,
        op: BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
        rule: &CompiledRule,
        state: &mut RuleState,
    ) -> EvalResult {
        // `and`/`or` are lazy left-to-right.
        match op {
            BinaryOp::And => {
                let left = self.eval_expr(lhs, rule, state)?;
                if !truthy(&left) {
                    return Ok(Rt::Value(Value::Bool(false)));
                }
                let right = self.eval_expr(rhs, rule, state)?;
                return Ok(Rt::Value(Value::Bool(truthy(&right))));
            }
            BinaryOp::Or => {
                let left = self.eval_expr(lhs, rule, state)?;
                if truthy(&left) {
                    return Ok(Rt::Value(Value::Bool(true)));
                }
                let right = self.eval_expr(rhs, rule, state)?;
                return Ok(Rt::Value(Value::Bool(truthy(&right))));
            }
            _ => {}
        }

        let left = self.eval_expr(lhs, rule, state)?;
        let right = self.eval_expr(rhs, rule, state)?;
        let result = match op {
            BinaryOp::Eq => rt_equal(&left, &right),
            BinaryOp::NotEq => !rt_equal(&left, &right),
            BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq => {
                ordered(op, &left, &right)
            }
            BinaryOp::In => contains(&left, &right),
            BinaryOp::Flow => match (&left, &right) {
                (Rt::Event(a), Rt::Event(b)) => flows(self.trace, self.flow_cache, *a, *b),
                _ => false,
            },
            BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
        };
        Ok(Rt::Value(Value::Bool(result)))
    }

    fn eval_call(
        &mut self,
        name: &str,
        args: &[Expr],
        kwargs: &[(String, Expr)],
        rule: &CompiledRule,
        state: &mut RuleState,
    ) -> EvalResult {
        match name {
            "len" => {
                let value = self.eval_expr(&args[0], rule, state)?;
                let length = match &value {
                    Rt::Events(ids) => ids.len(),
                    Rt::Event(_) => 1,
                    Rt::Value(Value::String(text)) => text.chars().count(),
                    Rt::Value(Value::Array(items)) => items.len(),
                    Rt::Value(Value::Object(fields)) => fields.len(),
                    Rt::Value(_) => 0,
                };
                Ok(Rt::Value(Value::Number(serde_json::Number::from(
                    length as u64,
                ))))
            }
            "text" => {
                let value = self.eval_expr(&args[0], rule, state)?;
                Ok(Rt::Value(Value::String(rt_to_text(&value, self.trace))))
            }
            "json" => {
                let value = self.eval_expr(&args[0], rule, state)?;
                let parsed = match rt_to_value(&value, self.trace) {
                    Value::String(text) => {
                        serde_json::from_str(&text).unwrap_or(Value::Null)
                    }
                    other => other,
                };
                Ok(Rt::Value(parsed))
            }
            "match" => {
                let pattern = self.eval_expr(&args[0], rule, state)?;
                let candidate = self.eval_expr(&args[1], rule, state)?;
                let (Rt::Value(Value::String(pattern)), Rt::Value(Value::String(candidate))) =
                    (pattern, candidate)
                else {
                    return Ok(Rt::Value(Value::Bool(false)));
                };
                Ok(Rt::Value(Value::Bool(self.regex_match(
                    &pattern, &candidate,
                ))))
            }
            _ => self.call_detector(name, args, kwargs, rule, state),
        }
    }

    /// Full-match semantics, like the pattern language.
    fn regex_match(&self, pattern: &str, candidate: &str) -> bool {
        if let Some(regex) = self.policy.regex(pattern) {
            return regex.is_match(candidate).unwrap_or(false);
        }
        match fancy_regex::Regex::new(&format!("^(?:{pattern})$")) {
            Ok(regex) => regex.is_match(candidate).unwrap_or(false),
            Err(error) => {
                tracing::warn!("match() pattern `{pattern}` failed to compile: {error}");
                false
            }
        }
    }

    fn call_detector(
        &mut self,
        name: &str,
        args: &[Expr],
        kwargs: &[(String, Expr)],
        rule: &CompiledRule,
        state: &mut RuleState,
    ) -> EvalResult {
        let Some(first) = args.first() else {
            return Ok(Rt::Value(Value::Bool(false)));
        };
        let subject = self.eval_expr(first, rule, state)?;
        let value = rt_to_value(&subject, self.trace);

        let mut options_map = Map::new();
        for (key, value_expr) in kwargs {
            let rt = self.eval_expr(value_expr, rule, state)?;
            options_map.insert(key.clone(), rt_to_value(&rt, self.trace));
        }
        let mut options = DetectorOptions::new(options_map);
        if let Some(deadline) = self.detector_deadline {
            options = options.with_deadline(deadline);
        }

        let Some(detector) = self.detectors.get(name) else {
            return Err(UnknownAtom {
                detector: name.to_string(),
                reason: "not registered".to_string(),
            });
        };

        // Detector failures, including panics, degrade the atom to unknown.
        let outcome = catch_unwind(AssertUnwindSafe(|| detector.detect(&value, &options)));
        match outcome {
            Ok(Ok(verdict)) => Ok(Rt::Value(Value::Bool(verdict.is_flagged()))),
            Ok(Err(error)) => Err(UnknownAtom {
                detector: name.to_string(),
                reason: error.to_string(),
            }),
            Err(_) => Err(UnknownAtom {
                detector: name.to_string(),
                reason: "panicked".to_string(),
            }),
        }
    }

    /// Member access. Event field reads record a provenance range; the
    /// range survives only if the enclosing atom holds.
    fn member(&mut self, object: &Rt, field: &str, state: &mut RuleState) -> Rt {
        match object {
            Rt::Event(id) => self.event_member(*id, field, state),
            Rt::Events(_) => Rt::Value(Value::Null),
            Rt::Value(value) => Rt::Value(value_member(value, field)),
        }
    }

    fn event_member(&mut self, id: EventId, field: &str, state: &mut RuleState) -> Rt {
        let Some(event) = self.trace.event(id) else {
            return Rt::Value(Value::Null);
        };
        let path = self.trace.json_path(id).unwrap_or_default();
        let mut touch = |state: &mut RuleState| {
            state.ranges.push(Range::object(id, join_path(&path, field)));
        };
        match event {
            EventRef::Message(message) => match field {
                "role" => {
                    touch(state);
                    Rt::Value(Value::String(message.role.clone()))
                }
                "content" => match &message.content {
                    Some(content) => {
                        touch(state);
                        Rt::Value(content.clone())
                    }
                    // Absent content yields null and no range; a range must
                    // always address a sub-object that exists.
                    None => Rt::Value(Value::Null),
                },
                "tool_calls" => {
                    let calls: Vec<EventId> = self
                        .trace
                        .tool_calls()
                        .filter(|(call_id, _)| self.trace.message_of_call(*call_id) == Some(id))
                        .map(|(call_id, _)| call_id)
                        .collect();
                    Rt::Events(calls)
                }
                _ => Rt::Value(Value::Null),
            },
            EventRef::ToolCall(call) => match field {
                "id" => {
                    touch(state);
                    Rt::Value(Value::String(call.id.clone()))
                }
                "type" => {
                    touch(state);
                    Rt::Value(Value::String(call.call_type.clone()))
                }
                "function" => {
                    touch(state);
                    let mut function = Map::new();
                    function.insert(
                        "name".to_string(),
                        Value::String(call.function.name.clone()),
                    );
                    function.insert(
                        "arguments".to_string(),
                        Value::Object(call.function.arguments.clone()),
                    );
                    Rt::Value(Value::Object(function))
                }
                _ => Rt::Value(Value::Null),
            },
            EventRef::ToolOutput(output) => match field {
                "tool_call_id" => {
                    touch(state);
                    Rt::Value(Value::String(output.tool_call_id.clone()))
                }
                "content" => {
                    touch(state);
                    Rt::Value(output.content.clone())
                }
                "role" => Rt::Value(Value::String("tool".to_string())),
                _ => Rt::Value(Value::Null),
            },
        }
    }
}

// ----------------------------------------------------------------------
// Runtime value helpers
// ----------------------------------------------------------------------

fn event_kind_matches(kind: TypeName, event: EventRef<'_>) -> bool {
    match kind {
        TypeName::Event => true,
        TypeName::Message => matches!(event, EventRef::Message(_)),
        TypeName::ToolCall => matches!(event, EventRef::ToolCall(_)),
        TypeName::ToolOutput => matches!(event, EventRef::ToolOutput(_)),
        _ => false,
    }
}

fn value_kind_matches(kind: TypeName, value: &Value) -> bool {
    match kind {
        TypeName::Str => value.is_string(),
        TypeName::Number => value.is_number(),
        TypeName::Bool => value.is_boolean(),
        TypeName::Dict => value.is_object(),
        TypeName::List => value.is_array(),
        TypeName::Unknown => true,
        _ => false,
    }
}

/// Elements a membership binding iterates: events keep their identity,
/// dict iteration yields keys, list iteration yields elements.
fn collection_items(source: Rt, kind: TypeName, trace: &Trace) -> Vec<Rt> {
    match source {
        Rt::Events(ids) => ids
            .into_iter()
            .filter(|&id| {
                trace
                    .event(id)
                    .is_some_and(|event| event_kind_matches(kind, event))
            })
            .map(Rt::Event)
            .collect(),
        Rt::Value(Value::Array(items)) => items
            .into_iter()
            .filter(|item| value_kind_matches(kind, item))
            .map(Rt::Value)
            .collect(),
        Rt::Value(Value::Object(fields)) => {
            if matches!(kind, TypeName::Str | TypeName::Unknown) {
                fields
                    .into_iter()
                    .map(|(key, _)| Rt::Value(Value::String(key)))
                    .collect()
            } else {
                Vec::new()
            }
        }
        _ => Vec::new(),
    }
}

fn truthy(rt: &Rt) -> bool {
    match rt {
        Rt::Event(_) => true,
        Rt::Events(ids) => !ids.is_empty(),
        Rt::Value(value) => match value {
            Value::Null => false,
            Value::Bool(flag) => *flag,
            Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
            Value::String(text) => !text.is_empty(),
            Value::Array(items) => !items.is_empty(),
            Value::Object(fields) => !fields.is_empty(),
        },
    }
}

fn rt_equal(left: &Rt, right: &Rt) -> bool {
    match (left, right) {
        (Rt::Event(a), Rt::Event(b)) => a == b,
        (Rt::Value(a), Rt::Value(b)) => values_equal(a, b),
        _ => false,
    }
}

/// Structural equality with int/float-tolerant numbers.
fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => (a - b).abs() < f64::EPSILON * a.abs().max(1.0),
            _ => a == b,
        },
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter()
                    .all(|(key, x)| b.get(key).is_some_and(|y| values_equal(x, y)))
        }
        _ => left == right,
    }
}

fn ordered(op: BinaryOp, left: &Rt, right: &Rt) -> bool {
    let (Rt::Value(left), Rt::Value(right)) = (left, right) else {
        return false;
    };
    let ordering = match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => None,
        },
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    };
    let Some(ordering) = ordering else {
        return false;
    };
    match op {
        BinaryOp::Lt => ordering.is_lt(),
        BinaryOp::LtEq => ordering.is_le(),
        BinaryOp::Gt => ordering.is_gt(),
        BinaryOp::GtEq => ordering.is_ge(),
        _ => false,
    }
}

/// `x in y`. String containment applies to string pairs only; structured
/// contents are not descended. Dict membership tests keys, lists test
/// elements, event lists test identity.
fn contains(needle: &Rt, haystack: &Rt) -> bool {
    match haystack {
        Rt::Events(ids) => matches!(needle, Rt::Event(id) if ids.contains(id)),
        Rt::Value(Value::String(text)) => {
            matches!(needle, Rt::Value(Value::String(sub)) if text.contains(sub.as_str()))
        }
        Rt::Value(Value::Array(items)) => {
            let Rt::Value(needle) = needle else {
                return false;
            };
            items.iter().any(|item| values_equal(item, needle))
        }
        Rt::Value(Value::Object(fields)) => {
            matches!(needle, Rt::Value(Value::String(key)) if fields.contains_key(key.as_str()))
        }
        _ => false,
    }
}

fn index_rt(object: &Rt, index: &Rt) -> Rt {
    match (object, index) {
        (Rt::Events(ids), Rt::Value(Value::Number(number))) => number
            .as_u64()
            .and_then(|n| ids.get(n as usize))
            .map_or(Rt::Value(Value::Null), |id| Rt::Event(*id)),
        (Rt::Value(Value::Object(fields)), Rt::Value(Value::String(key))) => Rt::Value(
            fields.get(key.as_str()).cloned().unwrap_or(Value::Null),
        ),
        (Rt::Value(Value::Array(items)), Rt::Value(Value::Number(number))) => Rt::Value(
            number
                .as_u64()
                .and_then(|n| items.get(n as usize))
                .cloned()
                .unwrap_or(Value::Null),
        ),
        (Rt::Value(Value::String(text)), Rt::Value(Value::String(key))) => {
            // Lazy JSON: an indexed string is parsed on demand.
            match serde_json::from_str::<Value>(text) {
                Ok(Value::Object(fields)) => {
                    Rt::Value(fields.get(key.as_str()).cloned().unwrap_or(Value::Null))
                }
                _ => Rt::Value(Value::Null),
            }
        }
        _ => Rt::Value(Value::Null),
    }
}

/// Member access into plain data. String contents parse lazily as JSON when
/// a rule dereferences into them.
fn value_member(value: &Value, field: &str) -> Value {
    match value {
        Value::Object(fields) => fields.get(field).cloned().unwrap_or(Value::Null),
        Value::String(text) => match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(fields)) => fields.get(field).cloned().unwrap_or(Value::Null),
            _ => Value::Null,
        },
        _ => Value::Null,
    }
}

fn rt_to_value(rt: &Rt, trace: &Trace) -> Value {
    match rt {
        Rt::Event(id) => event_value(*id, trace),
        Rt::Events(ids) => Value::Array(ids.iter().map(|id| event_value(*id, trace)).collect()),
        Rt::Value(value) => value.clone(),
    }
}

fn event_value(id: EventId, trace: &Trace) -> Value {
    match trace.event(id) {
        Some(EventRef::Message(message)) => {
            serde_json::to_value(message).unwrap_or(Value::Null)
        }
        Some(EventRef::ToolCall(call)) => serde_json::to_value(call).unwrap_or(Value::Null),
        Some(EventRef::ToolOutput(output)) => {
            serde_json::to_value(output).unwrap_or(Value::Null)
        }
        None => Value::Null,
    }
}

fn rt_to_text(rt: &Rt, trace: &Trace) -> String {
    match rt {
        Rt::Value(Value::String(text)) => text.clone(),
        other => {
            let value = rt_to_value(other, trace);
            serde_json::to_string(&value).unwrap_or_default()
        }
    }
}

fn number_value(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < 9e15 {
        Value::Number(serde_json::Number::from(value as i64))
    } else {
        serde_json::Number::from_f64(value).map_or(Value::Null, Value::Number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn truthiness_follows_value_shape() {
        assert!(!truthy(&Rt::Value(Value::Null)));
        assert!(!truthy(&Rt::Value(json!(""))));
        assert!(!truthy(&Rt::Value(json!(0))));
        assert!(truthy(&Rt::Value(json!("x"))));
        assert!(truthy(&Rt::Event(EventId::new(0))));
        assert!(!truthy(&Rt::Events(Vec::new())));
    }

    #[test]
    fn numeric_equality_tolerates_int_float_mix() {
        assert!(values_equal(&json!(3), &json!(3.0)));
        assert!(!values_equal(&json!(3), &json!(4)));
    }

    #[test]
    fn string_containment_does_not_descend_structures() {
        let needle = Rt::Value(json!("x"));
        let structured = Rt::Value(json!({"note": "x marks the spot"}));
        assert!(!contains(&needle, &structured));
        // Dict membership tests keys.
        let keyed = Rt::Value(json!({"x": 1}));
        assert!(contains(&needle, &keyed));
    }

    #[test]
    fn lazy_json_member_access_parses_strings() {
        let value = json!("{\"city\": \"Paris\"}");
        assert_eq!(value_member(&value, "city"), json!("Paris"));
        assert_eq!(value_member(&json!("not json"), "city"), Value::Null);
    }

    #[test]
    fn cancel_flag_reports_after_cancel() {
        let flag = CancelFlag::new();
        assert!(!flag.is_cancelled());
        flag.cancel();
        assert!(flag.is_cancelled());
    }
}
