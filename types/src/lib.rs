//! Core domain types for Warden.
//!
//! This crate contains pure domain types with no IO, no async, and minimal
//! dependencies: the trace event model, violation and warning surfaces,
//! localization ranges, and the detector contract. Everything here can be
//! used from any layer of the analyzer.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory
#![allow(clippy::missing_panics_doc)] // Panics are documented in assertions

mod detector;
mod event;
mod range;
mod trace;
mod violation;

pub use detector::{Detector, DetectorError, DetectorOptions, DetectorVerdict};
pub use event::{
    EventId, EventRef, Message, RawToolCall, RawToolFunction, ToolCall, ToolFunction, ToolOutput,
    TopEvent, TraceEvent,
};
pub use range::{Range, join_path};
pub use trace::{Trace, TraceError};
pub use violation::{
    ACCESS_CONTROL_VIOLATION, AnalysisResult, POLICY_VIOLATION, PolicyViolation, RuleId, Warning,
    WarningKind,
};
