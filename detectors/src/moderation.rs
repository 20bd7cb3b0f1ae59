//! Wordlist-based content moderation.

use std::sync::LazyLock;

use aho_corasick::{AhoCorasick, AhoCorasickBuilder, MatchKind};
use serde_json::Value;

use warden_types::{Detector, DetectorError, DetectorOptions, DetectorVerdict};

/// Deliberately small default wordlist; deployments extend it by registering
/// their own detector under the same name.
const BLOCKLIST: &[&str] = &[
    "build a bomb",
    "make a weapon",
    "kill yourself",
    "hurt yourself",
    "how to poison",
    "credit card dump",
    "stolen credentials",
];

static AUTOMATON: LazyLock<Option<AhoCorasick>> = LazyLock::new(|| {
    match AhoCorasickBuilder::new()
        .ascii_case_insensitive(true)
        .match_kind(MatchKind::LeftmostLongest)
        .build(BLOCKLIST)
    {
        Ok(automaton) => Some(automaton),
        Err(error) => {
            tracing::warn!("moderation automaton build failed: {error}");
            None
        }
    }
});

/// Flags strings containing a blocklisted phrase.
#[derive(Debug, Default)]
pub struct ModerationDetector;

impl ModerationDetector {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Detector for ModerationDetector {
    fn name(&self) -> &str {
        "moderated"
    }

    fn detect(
        &self,
        value: &Value,
        _options: &DetectorOptions,
    ) -> Result<DetectorVerdict, DetectorError> {
        let Some(automaton) = AUTOMATON.as_ref() else {
            return Err(DetectorError::Unavailable(
                "wordlist automaton failed to build".to_string(),
            ));
        };
        let Some(text) = value.as_str() else {
            return Ok(DetectorVerdict::Flagged(false));
        };
        Ok(DetectorVerdict::Flagged(automaton.is_match(text)))
    }
}
