//! Runtime environment facts gathered once at a boundary.
//!
//! The rest of the engine consumes this struct without conditional
//! environment checks.

/// Evaluation-affecting environment switches.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineEnvironment {
    /// `LOCAL_POLICY=1`: force all detector evaluation in-process.
    pub local_policy: bool,
    /// `WARDEN_STRICT_TRACE=1`: trace input defects become hard errors.
    pub strict_trace: bool,
}

impl EngineEnvironment {
    /// Gathers switches from the process environment. Called once when
    /// default options are built; explicit option values always win.
    #[must_use]
    pub fn gather() -> Self {
        Self {
            local_policy: flag("LOCAL_POLICY"),
            strict_trace: flag("WARDEN_STRICT_TRACE"),
        }
    }
}

fn flag(name: &str) -> bool {
    std::env::var(name).is_ok_and(|value| {
        let value = value.trim();
        value == "1" || value.eq_ignore_ascii_case("true")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_has_no_switches_set() {
        let env = EngineEnvironment::default();
        assert!(!env.local_policy);
        assert!(!env.strict_trace);
    }
}
