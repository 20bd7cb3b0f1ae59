//! Analyzer-wide properties: determinism, prefix monotonicity, monitor
//! equivalence, and localization soundness.

use serde_json::{Value, json};

use warden_engine::{
    Monitor, MonitorError, MonitorOptions, PolicyViolation, RawToolCall, Trace, TraceEvent,
    compile_policy,
};

const POLICY: &str = "\
raise \"untrusted recipient after inbox read\" if:
    (a: ToolCall) -> (b: ToolCall)
    a is tool:get_inbox
    b is tool:send_email({to: r\"^(?!Peter$).*$\"})
";

fn events() -> Vec<TraceEvent> {
    vec![
        TraceEvent::message("user", "handle my mail"),
        TraceEvent::assistant_calls(vec![RawToolCall::new("c1", "get_inbox", json!({}))]),
        TraceEvent::tool_output("c1", json!("two new messages")),
        TraceEvent::assistant_calls(vec![RawToolCall::new(
            "c2",
            "send_email",
            json!({"to": "Eve", "subject": "fwd"}),
        )]),
        TraceEvent::tool_output("c2", json!("sent")),
        TraceEvent::assistant_calls(vec![RawToolCall::new(
            "c3",
            "send_email",
            json!({"to": "Mallory"}),
        )]),
    ]
}

#[test]
fn repeated_analysis_is_deterministic() {
    let policy = compile_policy(POLICY).unwrap();
    let trace = Trace::from_events(events()).unwrap();
    let first = policy.analyze(&trace);
    let second = policy.analyze(&trace);
    assert_eq!(first, second);
    assert_eq!(first.errors.len(), 2); // c1->c2 and c1->c3
}

#[test]
fn errors_grow_monotonically_under_prefix_extension() {
    let policy = compile_policy(POLICY).unwrap();
    let all = events();
    let mut previous: Vec<PolicyViolation> = Vec::new();
    for cut in 0..=all.len() {
        let trace = Trace::from_events(all[..cut].to_vec()).unwrap();
        let errors = policy.analyze(&trace).errors;
        for violation in &previous {
            assert!(
                errors.contains(violation),
                "violation lost at prefix {cut}"
            );
        }
        previous = errors;
    }
}

#[test]
fn monitor_union_equals_batch_analysis() {
    let policy = compile_policy(POLICY).unwrap();
    let all = events();
    let batch = policy.analyze(&Trace::from_events(all.clone()).unwrap());

    for step in 1..=3 {
        let mut monitor = Monitor::new(POLICY, MonitorOptions::default()).unwrap();
        let mut emitted: Vec<PolicyViolation> = Vec::new();
        let mut fed = 0;
        while fed < all.len() {
            let next = (fed + step).min(all.len());
            let result = monitor.check(&all[..fed], &all[fed..next]).unwrap();
            emitted.extend(result.errors);
            fed = next;
        }
        assert_eq!(
            emitted.len(),
            batch.errors.len(),
            "chunk size {step} diverged from batch"
        );
        for violation in &batch.errors {
            assert!(emitted.contains(violation));
        }
    }
}

#[test]
fn blocking_check_still_reports_the_other_fresh_violations() {
    let source = "\
raise \"pii in search query\" if:
    (c: ToolCall)
    c is tool:search_web({q: <EMAIL_ADDRESS>})

raise \"send after inbox read\" if:
    (a: ToolCall) -> (b: ToolCall)
    a is tool:get_inbox
    b is tool:send_email
";
    let past = vec![
        TraceEvent::assistant_calls(vec![RawToolCall::new(
            "c1",
            "search_web",
            json!({"q": "bob@mail.com"}),
        )]),
        TraceEvent::assistant_calls(vec![RawToolCall::new("c2", "get_inbox", json!({}))]),
    ];
    let pending = vec![TraceEvent::assistant_calls(vec![RawToolCall::new(
        "c3",
        "send_email",
        json!({"to": "Eve"}),
    )])];
    let mut full = past.clone();
    full.extend(pending.clone());

    let policy = compile_policy(source).unwrap();
    let batch = policy.analyze(&Trace::from_events(full.clone()).unwrap());
    assert_eq!(batch.errors.len(), 2);

    let options = MonitorOptions {
        raise_unhandled: true,
        ..MonitorOptions::default()
    };
    let mut monitor = Monitor::new(source, options).unwrap();
    // Both violations are fresh in this single check: the PII one only
    // references past events, the exfiltration one touches pending.
    let error = monitor.check(&past, &pending).unwrap_err();
    let MonitorError::Blocking { violation, result } = error else {
        panic!("expected a blocking violation");
    };
    assert_eq!(violation.message, "send after inbox read");
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].message, "pii in search query");

    // Blocking + carried result together equal the batch analysis.
    let mut emitted = result.errors;
    emitted.push(violation);
    for expected in &batch.errors {
        assert!(emitted.contains(expected));
    }

    // Everything was fingerprinted; nothing is re-emitted afterwards.
    let followup = monitor.check(&full, &[]).unwrap();
    assert!(followup.errors.is_empty());
}

/// Resolve a dotted json-path against the serialized trace input.
fn resolve<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        current = match current {
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            Value::Object(fields) => fields.get(segment)?,
            _ => return None,
        };
    }
    Some(current)
}

#[test]
fn every_reported_range_addresses_an_existing_sub_object() {
    let policy = compile_policy(POLICY).unwrap();
    let all = events();
    let trace = Trace::from_events(all.clone()).unwrap();
    let serialized = serde_json::to_value(&all).unwrap();

    let result = policy.analyze(&trace);
    assert!(!result.errors.is_empty());
    for violation in &result.errors {
        for range in &violation.ranges {
            let target = resolve(&serialized, &range.json_path);
            assert!(
                target.is_some(),
                "range path {} does not resolve",
                range.json_path
            );
            if let (Some(start), Some(end)) = (range.start, range.end) {
                let text = target.and_then(Value::as_str).unwrap_or_default();
                assert!(start <= end && end <= text.chars().count());
            }
        }
    }
}

#[test]
fn adding_argument_keys_never_invalidates_a_match() {
    let source = "\
raise \"X\" if:
    (b: ToolCall)
    b is tool:send_email({to: \"Eve\"})
";
    let policy = compile_policy(source).unwrap();

    let lean = Trace::from_events(vec![TraceEvent::assistant_calls(vec![RawToolCall::new(
        "c1",
        "send_email",
        json!({"to": "Eve"}),
    )])])
    .unwrap();
    let rich = Trace::from_events(vec![TraceEvent::assistant_calls(vec![RawToolCall::new(
        "c1",
        "send_email",
        json!({"to": "Eve", "cc": ["Peter"], "priority": 2, "draft": false}),
    )])])
    .unwrap();

    assert_eq!(policy.analyze(&lean).errors.len(), 1);
    assert_eq!(policy.analyze(&rich).errors.len(), 1);
}

#[test]
fn compilation_rejects_negation_introducing_a_variable() {
    let source = "\
raise \"X\" if:
    (a: ToolCall)
    not ((o: ToolOutput) -> a)
";
    let errors = compile_policy(source).unwrap_err();
    assert!(
        errors
            .to_string()
            .contains("may not be introduced under `not`")
    );
}

#[test]
fn duplicate_trace_events_bind_once_per_identity() {
    // The same exchange twice: distinct events, distinct identities, so the
    // rule fires once per send, not once per (send, duplicate) pair.
    let policy = compile_policy(POLICY).unwrap();
    let trace = Trace::from_events(vec![
        TraceEvent::assistant_calls(vec![RawToolCall::new("c1", "get_inbox", json!({}))]),
        TraceEvent::tool_output("c1", json!("mail")),
        TraceEvent::assistant_calls(vec![RawToolCall::new(
            "c2",
            "send_email",
            json!({"to": "Eve"}),
        )]),
    ])
    .unwrap();
    let result = policy.analyze(&trace);
    assert_eq!(result.errors.len(), 1);
}
