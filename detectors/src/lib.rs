//! Built-in heuristic content detectors for Warden.
//!
//! Each detector implements the `warden-types` contract and runs fully
//! in-process: curated patterns and keyword automata standing in for
//! model-backed classifiers. The [`DetectorSet`] is an explicit resolution
//! context passed into evaluation; there is no process-wide registry.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory

use std::collections::HashMap;
use std::sync::Arc;

use warden_types::Detector;

mod injection;
mod moderation;
mod pii;
mod secrets;

pub use injection::PromptInjectionDetector;
pub use moderation::ModerationDetector;
pub use pii::PiiDetector;
pub use secrets::SecretsDetector;

/// Detector resolution context handed to the evaluator.
#[derive(Clone, Default)]
pub struct DetectorSet {
    detectors: HashMap<String, Arc<dyn Detector>>,
    local_only: bool,
}

impl DetectorSet {
    /// An empty set; every detector call becomes unknown.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// The built-in heuristics: `pii`, `prompt_injection`, `moderated`,
    /// `secrets`.
    #[must_use]
    pub fn builtin() -> Self {
        let mut set = Self::default();
        set.register(Arc::new(PiiDetector::new()));
        set.register(Arc::new(PromptInjectionDetector::new()));
        set.register(Arc::new(ModerationDetector::new()));
        set.register(Arc::new(SecretsDetector::new()));
        set
    }

    /// Restrict this set to in-process detectors. Registered non-local
    /// detectors are dropped; future non-local registrations are refused.
    #[must_use]
    pub fn local_only(mut self) -> Self {
        self.local_only = true;
        self.detectors.retain(|name, detector| {
            let keep = detector.is_local();
            if !keep {
                tracing::warn!("dropping non-local detector `{name}`: local-only evaluation");
            }
            keep
        });
        self
    }

    /// Register a detector under its own name. Later registrations replace
    /// earlier ones, so deployments can override a built-in.
    pub fn register(&mut self, detector: Arc<dyn Detector>) {
        if self.local_only && !detector.is_local() {
            tracing::warn!(
                "refusing non-local detector `{}`: local-only evaluation",
                detector.name()
            );
            return;
        }
        self.detectors.insert(detector.name().to_string(), detector);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&dyn Detector> {
        self.detectors.get(name).map(Arc::as_ref)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.detectors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.detectors.is_empty()
    }
}

impl std::fmt::Debug for DetectorSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.detectors.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("DetectorSet")
            .field("detectors", &names)
            .field("local_only", &self.local_only)
            .finish()
    }
}
