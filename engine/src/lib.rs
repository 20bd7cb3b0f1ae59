//! Evaluation core for Warden.
//!
//! This crate ties the toolchain together: it compiles policy sources
//! (via `warden-policy`), evaluates them against traces (`warden-types`)
//! with pluggable detectors (`warden-detectors`), and exposes the stateful
//! incremental [`Monitor`]. Evaluation is synchronous and single-threaded;
//! a [`Policy`] is immutable after compilation and safe to share across
//! evaluations as long as its detectors are reentrant.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};

pub mod dataflow;
mod environment;
mod eval;
pub mod matcher;
mod monitor;

pub use environment::EngineEnvironment;
pub use eval::CancelFlag;
pub use monitor::{Monitor, MonitorError, MonitorOptions};

// Re-export the surface callers need without naming the lower crates.
pub use warden_detectors::{
    DetectorSet, ModerationDetector, PiiDetector, PromptInjectionDetector, SecretsDetector,
};
pub use warden_policy::{CompileError, CompileErrors, CompiledPolicy, ParseError, TypeError};
pub use warden_types::{
    AnalysisResult, Detector, DetectorError, DetectorOptions, DetectorVerdict, EventId, EventRef,
    Message, PolicyViolation, Range, RawToolCall, RawToolFunction, RuleId, ToolCall, ToolFunction,
    ToolOutput, TopEvent, Trace, TraceError, TraceEvent, Warning, WarningKind,
};

use dataflow::FlowCache;

/// Callback invoked for violations routed to a registered handler.
pub type HandlerFn = Arc<dyn Fn(&PolicyViolation) + Send + Sync>;

/// Error handlers by violation kind (the structured "handled error" hook).
#[derive(Clone, Default)]
pub struct ErrorHandlers {
    handlers: HashMap<String, HandlerFn>,
}

impl ErrorHandlers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a violation kind, replacing any previous one.
    pub fn on<F>(&mut self, kind: impl Into<String>, handler: F)
    where
        F: Fn(&PolicyViolation) + Send + Sync + 'static,
    {
        self.handlers.insert(kind.into(), Arc::new(handler));
    }

    #[must_use]
    pub fn get(&self, kind: &str) -> Option<&HandlerFn> {
        self.handlers.get(kind)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for ErrorHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        f.debug_struct("ErrorHandlers").field("kinds", &kinds).finish()
    }
}

/// Per-evaluation options for [`Policy::analyze_with`].
#[derive(Clone)]
pub struct AnalyzeOptions {
    /// Free policy inputs, exposed to rule bodies as `input.<key>`.
    pub parameters: Map<String, Value>,
    pub detectors: DetectorSet,
    pub handlers: ErrorHandlers,
    /// Skip handler routing; every violation lands in `errors`.
    pub raise_unhandled: bool,
    pub detector_deadline: Option<Duration>,
    pub cancel: CancelFlag,
}

impl Default for AnalyzeOptions {
    fn default() -> Self {
        let environment = EngineEnvironment::gather();
        let detectors = if environment.local_policy {
            DetectorSet::builtin().local_only()
        } else {
            DetectorSet::builtin()
        };
        Self {
            parameters: Map::new(),
            detectors,
            handlers: ErrorHandlers::default(),
            raise_unhandled: false,
            detector_deadline: None,
            cancel: CancelFlag::new(),
        }
    }
}

/// A compiled policy: a set of rules evaluated against traces.
#[derive(Debug)]
pub struct Policy {
    compiled: CompiledPolicy,
}

/// Compile a policy source. Parse and type errors come back as a bag.
pub fn compile_policy(source: &str) -> Result<Policy, CompileErrors> {
    Ok(Policy {
        compiled: warden_policy::compile_source(source)?,
    })
}

impl Policy {
    /// Batch analysis with default options (built-in detectors, no
    /// parameters, no handlers).
    #[must_use]
    pub fn analyze(&self, trace: &Trace) -> AnalysisResult {
        self.analyze_with(trace, &AnalyzeOptions::default())
    }

    /// Batch analysis. The result is transactional: all found errors, or a
    /// partial set flagged `cancelled`.
    #[must_use]
    pub fn analyze_with(&self, trace: &Trace, options: &AnalyzeOptions) -> AnalysisResult {
        let mut flow_cache = FlowCache::new();
        let output = eval::evaluate(
            &self.compiled,
            trace,
            &options.detectors,
            &options.parameters,
            options.detector_deadline,
            &options.cancel,
            &mut flow_cache,
        );

        let mut result = AnalysisResult {
            warnings: trace.warnings().to_vec(),
            cancelled: output.cancelled,
            ..AnalysisResult::default()
        };
        result.warnings.extend(output.warnings);
        for rule in output.rules {
            for raised in rule.raised {
                route_violation(
                    raised.violation,
                    &options.handlers,
                    options.raise_unhandled,
                    &mut result,
                );
            }
        }
        result
    }

    pub(crate) fn compiled(&self) -> &CompiledPolicy {
        &self.compiled
    }
}

/// Route one violation into the result set. Returns true when a handler
/// consumed it.
pub(crate) fn route_violation(
    violation: PolicyViolation,
    handlers: &ErrorHandlers,
    raise_unhandled: bool,
    result: &mut AnalysisResult,
) -> bool {
    if !raise_unhandled {
        if let Some(handler) = handlers.get(&violation.kind) {
            handler(&violation);
            result.handled_errors.push(violation);
            return true;
        }
    }
    result.errors.push(violation);
    false
}
