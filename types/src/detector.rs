//! Detector contract.
//!
//! Content detectors (PII, prompt injection, moderation, secrets, ...) are
//! external collaborators behind one trait. A detector that cannot run
//! returns [`DetectorError`]; the evaluator treats the calling atom as
//! unknown and records a warning instead of failing the analysis.

use std::time::Duration;

use serde_json::{Map, Value};
use thiserror::Error;

/// Keyword options forwarded from the rule body to a detector call, e.g.
/// `prompt_injection(out.content, threshold=0.7)`, plus an optional
/// per-call deadline set by the host.
#[derive(Debug, Clone, Default)]
pub struct DetectorOptions {
    kwargs: Map<String, Value>,
    deadline: Option<Duration>,
}

impl DetectorOptions {
    #[must_use]
    pub fn new(kwargs: Map<String, Value>) -> Self {
        Self {
            kwargs,
            deadline: None,
        }
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.kwargs.get(key)
    }

    /// Numeric option lookup with a default, e.g. `threshold`.
    #[must_use]
    pub fn number(&self, key: &str, default: f64) -> f64 {
        self.kwargs
            .get(key)
            .and_then(Value::as_f64)
            .unwrap_or(default)
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }
}

/// What a detector concluded about a value.
#[derive(Debug, Clone, PartialEq)]
pub enum DetectorVerdict {
    /// Predicate detectors: the value is / is not flagged.
    Flagged(bool),
    /// Tagging detectors: entity tags found in the value, e.g.
    /// `["EMAIL_ADDRESS"]` or `["AWS_ACCESS_KEY"]`.
    Tags(Vec<String>),
}

impl DetectorVerdict {
    /// Truthiness used when the detector call sits in a boolean position.
    #[must_use]
    pub fn is_flagged(&self) -> bool {
        match self {
            Self::Flagged(flagged) => *flagged,
            Self::Tags(tags) => !tags.is_empty(),
        }
    }

    #[must_use]
    pub fn has_tag(&self, tag: &str) -> bool {
        match self {
            Self::Flagged(_) => false,
            Self::Tags(tags) => tags.iter().any(|t| t == tag),
        }
    }
}

/// Why a detector did not produce a verdict.
#[derive(Debug, Clone, Error)]
pub enum DetectorError {
    /// The detector refused to run (e.g. backing model not installed).
    #[error("detector unavailable: {0}")]
    Unavailable(String),
    /// The detector started but failed; treated the same as unavailable.
    #[error("detector failed: {0}")]
    Failed(String),
    /// The per-call deadline elapsed.
    #[error("detector deadline exceeded")]
    DeadlineExceeded,
}

/// A pluggable content detector.
///
/// Implementations must be reentrant if the owning policy or monitor is
/// shared across evaluations; any internal cache must be synchronized.
pub trait Detector: Send + Sync {
    /// Name the rule body uses to invoke this detector.
    fn name(&self) -> &str;

    /// Whether this detector runs fully in-process. Registries may refuse
    /// non-local detectors when the host forces local evaluation.
    fn is_local(&self) -> bool {
        true
    }

    /// Classify a value. Non-string values are passed through unchanged;
    /// most detectors only inspect strings and return an empty verdict
    /// otherwise.
    fn detect(
        &self,
        value: &Value,
        options: &DetectorOptions,
    ) -> Result<DetectorVerdict, DetectorError>;
}
