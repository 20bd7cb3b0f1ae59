//! Semantic pattern matching against tool-call values.
//!
//! `call is tool:name({...})` holds when the subject is a tool call, the
//! name matches (a bare `tool` matches any), and the argument pattern
//! matches under the pattern-table semantics: partial object match, prefix
//! list match, anchored regexes, detector-backed classifiers, tolerant
//! numerics. On success the matcher reports the ranges of every field that
//! participated, for violation localization.

use serde_json::{Map, Value};

use warden_detectors::DetectorSet;
use warden_policy::CompiledPolicy;
use warden_policy::ast::{Pattern, ToolPattern};
use warden_types::{DetectorOptions, DetectorVerdict, Range, ToolCall};

/// Outcome of a pattern match.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    /// Matched; the ranges pinpoint the fields that did.
    Matched(Vec<Range>),
    NotMatched,
    /// A classifier's detector refused or failed; carries the detector name.
    Unknown(String),
}

/// Match a tool call against an `is tool` pattern. `call_range` addresses
/// the call itself within the trace.
pub fn match_tool_call(
    call: &ToolCall,
    call_range: &Range,
    pattern: &ToolPattern,
    policy: &CompiledPolicy,
    detectors: &DetectorSet,
) -> MatchOutcome {
    if let Some(name) = &pattern.name {
        if call.function.name != *name {
            return MatchOutcome::NotMatched;
        }
    }
    let mut ranges = vec![call_range.clone()];
    if let Some(args_pattern) = &pattern.args {
        let args_range = call_range.child("function").child("arguments");
        let args = Value::Object(call.function.arguments.clone());
        match match_value(&args, args_pattern, &args_range, policy, detectors) {
            MatchOutcome::Matched(mut field_ranges) => ranges.append(&mut field_ranges),
            other => return other,
        }
    }
    MatchOutcome::Matched(ranges)
}

/// Match a single value against a pattern, accumulating matched-field
/// ranges. Object fields check in pattern order; the first failure wins.
pub fn match_value(
    value: &Value,
    pattern: &Pattern,
    range: &Range,
    policy: &CompiledPolicy,
    detectors: &DetectorSet,
) -> MatchOutcome {
    match pattern {
        Pattern::Wildcard => MatchOutcome::Matched(Vec::new()),
        Pattern::Str(expected) => leaf(value.as_str() == Some(expected.as_str()), range),
        Pattern::Number(expected) => leaf(numbers_equal(value, *expected), range),
        Pattern::Bool(expected) => leaf(value.as_bool() == Some(*expected), range),
        Pattern::Null => leaf(value.is_null(), range),
        Pattern::Regex(text, _) => {
            let Some(candidate) = value.as_str() else {
                return MatchOutcome::NotMatched;
            };
            let Some(regex) = policy.regex(text) else {
                tracing::warn!("regex `{text}` missing from the compiled table");
                return MatchOutcome::NotMatched;
            };
            match regex.is_match(candidate) {
                Ok(matched) => leaf(matched, range),
                Err(error) => {
                    tracing::warn!("regex `{text}` failed on input: {error}");
                    MatchOutcome::NotMatched
                }
            }
        }
        Pattern::Classifier(name, _) => classify(value, name, range, detectors),
        Pattern::Object(fields) => {
            let Some(object) = value.as_object() else {
                return MatchOutcome::NotMatched;
            };
            match_object(object, fields, range, policy, detectors)
        }
        Pattern::List(items) => {
            let Some(list) = value.as_array() else {
                return MatchOutcome::NotMatched;
            };
            if list.len() < items.len() {
                return MatchOutcome::NotMatched;
            }
            let mut ranges = Vec::new();
            for (index, item_pattern) in items.iter().enumerate() {
                let item_range = range.child(&index.to_string());
                match match_value(&list[index], item_pattern, &item_range, policy, detectors) {
                    MatchOutcome::Matched(mut item_ranges) => ranges.append(&mut item_ranges),
                    other => return other,
                }
            }
            MatchOutcome::Matched(ranges)
        }
    }
}

fn match_object(
    object: &Map<String, Value>,
    fields: &[(String, Pattern)],
    range: &Range,
    policy: &CompiledPolicy,
    detectors: &DetectorSet,
) -> MatchOutcome {
    let mut ranges = Vec::new();
    for (key, field_pattern) in fields {
        let field_range = range.child(key);
        match object.get(key) {
            Some(field_value) => {
                match match_value(field_value, field_pattern, &field_range, policy, detectors) {
                    MatchOutcome::Matched(mut field_ranges) => ranges.append(&mut field_ranges),
                    other => return other,
                }
            }
            // Omitted keys match only the wildcard.
            None if matches!(field_pattern, Pattern::Wildcard) => {}
            None => return MatchOutcome::NotMatched,
        }
    }
    MatchOutcome::Matched(ranges)
}

/// `<MODERATED>` consults the moderation detector; every other classifier is
/// an entity tag asked of the PII detector.
fn classify(value: &Value, name: &str, range: &Range, detectors: &DetectorSet) -> MatchOutcome {
    if !value.is_string() {
        return MatchOutcome::NotMatched;
    }
    let detector_name = if name == "MODERATED" { "moderated" } else { "pii" };
    let Some(detector) = detectors.get(detector_name) else {
        return MatchOutcome::Unknown(detector_name.to_string());
    };
    match detector.detect(value, &DetectorOptions::default()) {
        Ok(DetectorVerdict::Flagged(flagged)) => leaf(flagged, range),
        Ok(verdict @ DetectorVerdict::Tags(_)) => leaf(verdict.has_tag(name), range),
        Err(error) => {
            tracing::warn!("classifier <{name}>: detector `{detector_name}` refused: {error}");
            MatchOutcome::Unknown(detector_name.to_string())
        }
    }
}

fn leaf(matched: bool, range: &Range) -> MatchOutcome {
    if matched {
        MatchOutcome::Matched(vec![range.clone()])
    } else {
        MatchOutcome::NotMatched
    }
}

/// Int/float-tolerant numeric comparison.
fn numbers_equal(value: &Value, expected: f64) -> bool {
    value
        .as_f64()
        .is_some_and(|actual| (actual - expected).abs() < f64::EPSILON * expected.abs().max(1.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use warden_policy::compile_source;
    use warden_types::{EventId, ToolFunction};

    fn policy_with(pattern_source: &str) -> CompiledPolicy {
        let source =
            format!("raise \"X\" if:\n    (b: ToolCall)\n    b is {pattern_source}\n");
        compile_source(&source).unwrap()
    }

    fn pattern_of(policy: &CompiledPolicy) -> ToolPattern {
        use warden_policy::Step;
        use warden_policy::ast::ExprKind;
        for step in &policy.rules[0].steps {
            if let Step::Filter(expr) = step {
                if let ExprKind::Is { pattern, .. } = &expr.kind {
                    return pattern.clone();
                }
            }
        }
        panic!("no is-pattern in policy");
    }

    fn send_email(arguments: Value) -> ToolCall {
        let Value::Object(arguments) = arguments else {
            panic!("arguments must be an object");
        };
        ToolCall {
            id: "c1".to_string(),
            call_type: "function".to_string(),
            function: ToolFunction {
                name: "send_email".to_string(),
                arguments,
            },
        }
    }

    fn range() -> Range {
        Range::object(EventId::new(2), "1.tool_calls.0")
    }

    #[test]
    fn name_mismatch_fails_fast() {
        let policy = policy_with("tool:get_inbox");
        let outcome = match_tool_call(
            &send_email(json!({})),
            &range(),
            &pattern_of(&policy),
            &policy,
            &DetectorSet::empty(),
        );
        assert_eq!(outcome, MatchOutcome::NotMatched);
    }

    #[test]
    fn bare_tool_matches_any_call() {
        let policy = policy_with("tool");
        let outcome = match_tool_call(
            &send_email(json!({})),
            &range(),
            &pattern_of(&policy),
            &policy,
            &DetectorSet::empty(),
        );
        assert!(matches!(outcome, MatchOutcome::Matched(_)));
    }

    #[test]
    fn lookaround_regex_rejects_peter_only() {
        let policy = policy_with("tool:send_email({to: r\"^(?!Peter$).*$\"})");
        let pattern = pattern_of(&policy);
        let detectors = DetectorSet::empty();

        let attacker = match_tool_call(
            &send_email(json!({"to": "Attacker"})),
            &range(),
            &pattern,
            &policy,
            &detectors,
        );
        let MatchOutcome::Matched(ranges) = attacker else {
            panic!("expected match, got {attacker:?}");
        };
        assert!(
            ranges
                .iter()
                .any(|r| r.json_path == "1.tool_calls.0.function.arguments.to")
        );

        let peter = match_tool_call(
            &send_email(json!({"to": "Peter"})),
            &range(),
            &pattern,
            &policy,
            &detectors,
        );
        assert_eq!(peter, MatchOutcome::NotMatched);
    }

    #[test]
    fn extra_keys_are_ignored() {
        let policy = policy_with("tool:send_email({to: \"Peter\"})");
        let outcome = match_tool_call(
            &send_email(json!({"to": "Peter", "subject": "hi", "cc": []})),
            &range(),
            &pattern_of(&policy),
            &policy,
            &DetectorSet::empty(),
        );
        assert!(matches!(outcome, MatchOutcome::Matched(_)));
    }

    #[test]
    fn omitted_key_matches_only_wildcard() {
        let policy = policy_with("tool:send_email({cc: *})");
        let outcome = match_tool_call(
            &send_email(json!({"to": "Peter"})),
            &range(),
            &pattern_of(&policy),
            &policy,
            &DetectorSet::empty(),
        );
        assert!(matches!(outcome, MatchOutcome::Matched(_)));

        let policy = policy_with("tool:send_email({cc: \"x\"})");
        let outcome = match_tool_call(
            &send_email(json!({"to": "Peter"})),
            &range(),
            &pattern_of(&policy),
            &policy,
            &DetectorSet::empty(),
        );
        assert_eq!(outcome, MatchOutcome::NotMatched);
    }

    #[test]
    fn list_prefix_matches_and_tolerates_extras() {
        let policy = policy_with("tool:send_email({to: [\"a\", \"b\"]})");
        let pattern = pattern_of(&policy);
        let detectors = DetectorSet::empty();

        let longer = match_tool_call(
            &send_email(json!({"to": ["a", "b", "c"]})),
            &range(),
            &pattern,
            &policy,
            &detectors,
        );
        assert!(matches!(longer, MatchOutcome::Matched(_)));

        let shorter = match_tool_call(
            &send_email(json!({"to": ["a"]})),
            &range(),
            &pattern,
            &policy,
            &detectors,
        );
        assert_eq!(shorter, MatchOutcome::NotMatched);
    }

    #[test]
    fn numeric_match_tolerates_int_float_mix() {
        let policy = policy_with("tool:send_email({limit: 3})");
        let outcome = match_tool_call(
            &send_email(json!({"limit": 3.0})),
            &range(),
            &pattern_of(&policy),
            &policy,
            &DetectorSet::empty(),
        );
        assert!(matches!(outcome, MatchOutcome::Matched(_)));
    }

    #[test]
    fn classifier_finds_email_address() {
        let policy = policy_with("tool:search_web({q: <EMAIL_ADDRESS>})");
        let call = ToolCall {
            id: "c2".to_string(),
            call_type: "function".to_string(),
            function: ToolFunction {
                name: "search_web".to_string(),
                arguments: json!({"q": "bob@mail.com wants Paris"})
                    .as_object()
                    .unwrap()
                    .clone(),
            },
        };
        let outcome = match_tool_call(
            &call,
            &range(),
            &pattern_of(&policy),
            &policy,
            &DetectorSet::builtin(),
        );
        let MatchOutcome::Matched(ranges) = outcome else {
            panic!("expected match");
        };
        assert!(
            ranges
                .iter()
                .any(|r| r.json_path.ends_with("arguments.q"))
        );
    }

    #[test]
    fn missing_detector_makes_classifier_unknown() {
        let policy = policy_with("tool:search_web({q: <EMAIL_ADDRESS>})");
        let call = ToolCall {
            id: "c2".to_string(),
            call_type: "function".to_string(),
            function: ToolFunction {
                name: "search_web".to_string(),
                arguments: json!({"q": "bob@mail.com"}).as_object().unwrap().clone(),
            },
        };
        let outcome = match_tool_call(
            &call,
            &range(),
            &pattern_of(&policy),
            &policy,
            &DetectorSet::empty(),
        );
        assert_eq!(outcome, MatchOutcome::Unknown("pii".to_string()));
    }
}
