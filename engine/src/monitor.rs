//! Incremental monitoring over a prefix-growing trace.
//!
//! The monitor wraps a compiled policy with fingerprint memoization: each
//! violation hashes to (rule id, sorted bound event identities, serialized
//! fields), and `check` emits only fingerprints not seen before. Event ids
//! are assigned in first-seen order, so fingerprints and the dataflow cache
//! both stay valid as the trace grows by prefix extension. Fingerprints are
//! committed only for rules that ran to completion, so cancellation never
//! corrupts monitor state.

use std::collections::HashSet;
use std::time::Duration;

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

use warden_detectors::DetectorSet;
use warden_policy::CompileErrors;
use warden_types::{
    AnalysisResult, EventId, PolicyViolation, Trace, TraceError, TraceEvent,
};

use crate::dataflow::FlowCache;
use crate::environment::EngineEnvironment;
use crate::eval::{CancelFlag, RaisedViolation, evaluate};
use crate::{ErrorHandlers, Policy, route_violation};

/// Why a `check` call did not return a plain result set.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// An unhandled violation references a pending event and
    /// `raise_unhandled` is on: the caller should block the action. The
    /// other findings of the same check ride along in `result`; their
    /// fingerprints are committed either way, so nothing is lost or
    /// re-emitted later.
    #[error("blocking violation: {violation}")]
    Blocking {
        violation: PolicyViolation,
        result: AnalysisResult,
    },
    /// The virtual trace failed to build (strict mode).
    #[error(transparent)]
    Trace(#[from] TraceError),
}

/// Construction options for a [`Monitor`].
#[derive(Clone)]
pub struct MonitorOptions {
    /// Raise a blocking error for unhandled violations that reference
    /// pending events, instead of returning them in the result set.
    pub raise_unhandled: bool,
    /// Free policy inputs, exposed to rule bodies as `input.<key>`.
    pub parameters: Map<String, Value>,
    pub detectors: DetectorSet,
    pub handlers: ErrorHandlers,
    pub detector_deadline: Option<Duration>,
    /// Trace defects become hard errors instead of warnings.
    pub strict_trace: bool,
    pub cancel: CancelFlag,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        let environment = EngineEnvironment::gather();
        let detectors = if environment.local_policy {
            DetectorSet::builtin().local_only()
        } else {
            DetectorSet::builtin()
        };
        Self {
            raise_unhandled: false,
            parameters: Map::new(),
            detectors,
            handlers: ErrorHandlers::default(),
            detector_deadline: None,
            strict_trace: environment.strict_trace,
            cancel: CancelFlag::new(),
        }
    }
}

type Fingerprint = [u8; 32];

/// Stateful wrapper around a policy for online checking.
pub struct Monitor {
    policy: Policy,
    options: MonitorOptions,
    seen_fingerprints: HashSet<Fingerprint>,
    flow_cache: FlowCache,
}

impl Monitor {
    pub fn new(source: &str, options: MonitorOptions) -> Result<Self, CompileErrors> {
        Ok(Self {
            policy: crate::compile_policy(source)?,
            options,
            seen_fingerprints: HashSet::new(),
            flow_cache: FlowCache::new(),
        })
    }

    /// Evaluate the policy over `past ++ pending` and report violations not
    /// seen in any earlier check. For a sequence of prefix-extending calls,
    /// the union of emitted errors equals one batch analysis of the final
    /// trace.
    pub fn check(
        &mut self,
        past: &[TraceEvent],
        pending: &[TraceEvent],
    ) -> Result<AnalysisResult, MonitorError> {
        let mut events = Vec::with_capacity(past.len() + pending.len());
        events.extend_from_slice(past);
        events.extend_from_slice(pending);
        let trace = if self.options.strict_trace {
            Trace::from_events_strict(events)?
        } else {
            Trace::from_events(events)?
        };

        // First event id contributed by `pending`, per the first-seen walk.
        let pending_start = EventId::new(node_count(past));

        let output = evaluate(
            self.policy.compiled(),
            &trace,
            &self.options.detectors,
            &self.options.parameters,
            self.options.detector_deadline,
            &self.options.cancel,
            &mut self.flow_cache,
        );

        let mut result = AnalysisResult {
            warnings: trace.warnings().to_vec(),
            cancelled: output.cancelled,
            ..AnalysisResult::default()
        };
        result.warnings.extend(output.warnings);

        // Every fresh fingerprint commits, blocking or not; only the first
        // blocking violation is withheld from the result and carried in the
        // error instead, so the union of reported violations still equals a
        // batch analysis.
        let mut blocking: Option<PolicyViolation> = None;
        let mut fresh = 0usize;
        for rule in output.rules {
            if !rule.completed {
                continue;
            }
            for raised in rule.raised {
                let fingerprint = fingerprint(&raised);
                if !self.seen_fingerprints.insert(fingerprint) {
                    continue;
                }
                fresh += 1;
                let touches_pending = raised.bound_events.iter().any(|&id| id >= pending_start)
                    || raised
                        .violation
                        .ranges
                        .iter()
                        .any(|range| range.event >= pending_start);
                if self.options.raise_unhandled && touches_pending && blocking.is_none() {
                    blocking = Some(raised.violation);
                    continue;
                }
                route_violation(
                    raised.violation,
                    &self.options.handlers,
                    self.options.raise_unhandled,
                    &mut result,
                );
            }
        }

        tracing::debug!(
            fresh,
            total_seen = self.seen_fingerprints.len(),
            flow_edges = self.flow_cache.len(),
            "monitor check finished"
        );

        match blocking {
            Some(violation) => Err(MonitorError::Blocking { violation, result }),
            None => Ok(result),
        }
    }

    /// Violations reported across all checks so far.
    #[must_use]
    pub fn seen_count(&self) -> usize {
        self.seen_fingerprints.len()
    }
}

/// Addressable events contributed by a raw event slice: one per entry plus
/// one per nested tool call, mirroring trace construction.
fn node_count(events: &[TraceEvent]) -> u64 {
    events
        .iter()
        .map(|event| {
            if event.role == "tool" && event.tool_call_id.is_some() {
                1
            } else {
                1 + event.tool_calls.len() as u64
            }
        })
        .sum()
}

fn fingerprint(raised: &RaisedViolation) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(raised.violation.origin_rule.value().to_le_bytes());
    for id in &raised.bound_events {
        hasher.update(id.value().to_le_bytes());
    }
    hasher.update(raised.violation.kind.as_bytes());
    // Field maps keep rule-declared insertion order, so this is canonical.
    if let Ok(fields) = serde_json::to_string(&raised.violation.fields) {
        hasher.update(fields.as_bytes());
    }
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use warden_types::RawToolCall;

    fn exfiltration_policy() -> &'static str {
        "raise \"untrusted recipient\" if:\n    (a: ToolCall) -> (b: ToolCall)\n    a is tool:get_inbox\n    b is tool:send_email({to: r\"^(?!Peter$).*$\"})\n"
    }

    fn inbox_exchange() -> Vec<TraceEvent> {
        vec![
            TraceEvent::assistant_calls(vec![RawToolCall::new("c1", "get_inbox", json!({}))]),
            TraceEvent::tool_output("c1", json!("mail")),
        ]
    }

    fn send_exchange(to: &str) -> Vec<TraceEvent> {
        vec![TraceEvent::assistant_calls(vec![RawToolCall::new(
            "c2",
            "send_email",
            json!({"to": to}),
        )])]
    }

    #[test]
    fn incremental_checks_report_each_violation_once() {
        let mut monitor = Monitor::new(exfiltration_policy(), MonitorOptions::default()).unwrap();

        let past = inbox_exchange();
        let first = monitor.check(&[], &past).unwrap();
        assert!(first.errors.is_empty());

        let pending = send_exchange("Attacker");
        let second = monitor.check(&past, &pending).unwrap();
        assert_eq!(second.errors.len(), 1);

        let mut full = past;
        full.extend(pending);
        let third = monitor.check(&full, &[]).unwrap();
        assert!(third.errors.is_empty());
    }

    #[test]
    fn raise_unhandled_blocks_on_pending_violation() {
        let options = MonitorOptions {
            raise_unhandled: true,
            ..MonitorOptions::default()
        };
        let mut monitor = Monitor::new(exfiltration_policy(), options).unwrap();

        let past = inbox_exchange();
        monitor.check(&[], &past).unwrap();
        let error = monitor.check(&past, &send_exchange("Attacker")).unwrap_err();
        match error {
            MonitorError::Blocking { violation, result } => {
                assert_eq!(violation.message, "untrusted recipient");
                // The single rule produced the blocking violation only.
                assert!(result.errors.is_empty());
            }
            MonitorError::Trace(other) => panic!("unexpected trace error: {other}"),
        }
    }

    #[test]
    fn past_only_violations_do_not_block() {
        let options = MonitorOptions {
            raise_unhandled: true,
            ..MonitorOptions::default()
        };
        let mut monitor = Monitor::new(exfiltration_policy(), options).unwrap();

        let mut full = inbox_exchange();
        full.extend(send_exchange("Attacker"));
        // The violation only references past events; it is returned, not
        // raised.
        let result = monitor.check(&full, &[]).unwrap();
        assert_eq!(result.errors.len(), 1);
    }

    #[test]
    fn node_count_matches_trace_construction() {
        let mut events = inbox_exchange();
        events.extend(send_exchange("Peter"));
        let expected = Trace::from_events(events.clone()).unwrap().node_count() as u64;
        assert_eq!(node_count(&events), expected);
    }
}
