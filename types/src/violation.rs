//! Violations, warnings, and the analysis result surface.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::range::Range;

/// Base kind for rule-raised errors.
pub const POLICY_VIOLATION: &str = "PolicyViolation";

/// Kind for rule-raised errors carrying user/resource fields.
pub const ACCESS_CONTROL_VIOLATION: &str = "AccessControlViolation";

/// Identity of a compiled rule within its policy, stable across evaluations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(u32);

impl RuleId {
    #[must_use]
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    #[must_use]
    pub fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A rule body satisfied by a binding: the base domain error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyViolation {
    /// Error kind, `PolicyViolation` unless the rule names a subclass.
    pub kind: String,
    /// Human-readable message from the rule's error constructor.
    pub message: String,
    /// Keyword fields substituted from the satisfying binding.
    #[serde(skip_serializing_if = "Map::is_empty", default)]
    pub fields: Map<String, Value>,
    /// Localization of the trace content that satisfied the rule.
    pub ranges: Vec<Range>,
    /// Rule that raised this violation.
    pub origin_rule: RuleId,
}

impl PolicyViolation {
    #[must_use]
    pub fn new(message: impl Into<String>, origin_rule: RuleId) -> Self {
        Self {
            kind: POLICY_VIOLATION.to_string(),
            message: message.into(),
            fields: Map::new(),
            ranges: Vec::new(),
            origin_rule,
        }
    }

    #[must_use]
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }
}

impl fmt::Display for PolicyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Non-fatal degradation observed during trace loading or evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warning {
    pub kind: WarningKind,
    pub message: String,
}

impl Warning {
    #[must_use]
    pub fn new(kind: WarningKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Classification of a [`Warning`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    /// Malformed trace input tolerated in lenient mode.
    TraceInput,
    /// A detector required by a rule refused to run, failed, or timed out.
    DetectorUnavailable,
}

/// Outcome of one policy evaluation over one trace.
///
/// Transactional: callers observe either the full error set or, after
/// cancellation, a partial set with `cancelled` raised.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// Violations no handler consumed.
    pub errors: Vec<PolicyViolation>,
    /// Violations routed through a registered handler.
    pub handled_errors: Vec<PolicyViolation>,
    /// Degradations observed along the way.
    pub warnings: Vec<Warning>,
    /// Evaluation was interrupted; `errors` may be incomplete.
    #[serde(default)]
    pub cancelled: bool,
}

impl AnalysisResult {
    /// True when nothing was raised and nothing degraded.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.handled_errors.is_empty() && self.warnings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn violation_defaults_to_base_kind() {
        let violation = PolicyViolation::new("no exfiltration", RuleId::new(0));
        assert_eq!(violation.kind, POLICY_VIOLATION);
        assert_eq!(violation.to_string(), "PolicyViolation: no exfiltration");
    }

    #[test]
    fn with_kind_overrides_base() {
        let violation = PolicyViolation::new("denied", RuleId::new(1))
            .with_kind(ACCESS_CONTROL_VIOLATION);
        assert_eq!(violation.kind, "AccessControlViolation");
    }

    #[test]
    fn clean_result_reports_clean() {
        assert!(AnalysisResult::default().is_clean());
    }
}
