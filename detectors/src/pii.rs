//! Pattern-based PII recognition.
//!
//! Entity recognizers are curated regex patterns plus small gazetteers, not
//! a statistical model; they stand in for model-backed recognition behind
//! the same contract. Patterns are compiled once and cached in `LazyLock`.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use warden_types::{Detector, DetectorError, DetectorOptions, DetectorVerdict};

static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("email pattern compiles")
});

static PHONE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\+?\d{1,3}[-. (]{0,2}\d{2,4}[-. )]{0,2}\d{3,4}[-. ]?\d{3,4}")
        .expect("phone pattern compiles")
});

static HONORIFIC_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:Mr|Mrs|Ms|Dr|Prof)\.?\s+[A-Z][a-z]+").expect("name pattern compiles")
});

/// Common given names; word-bounded matches count as `PERSON`.
const GIVEN_NAMES: &[&str] = &[
    "Alice", "Bob", "Carol", "David", "Emma", "Frank", "Grace", "Henry", "James", "John", "Julia",
    "Laura", "Maria", "Michael", "Peter", "Robert", "Sarah", "Thomas",
];

/// Well-known cities and countries; word-bounded matches count as `LOCATION`.
const PLACES: &[&str] = &[
    "Amsterdam", "Berlin", "Boston", "Chicago", "London", "Madrid", "Moscow", "Munich",
    "New York", "Paris", "Rome", "San Francisco", "Seattle", "Singapore", "Sydney", "Tokyo",
    "Vienna", "Zurich", "France", "Germany", "Italy", "Japan", "Spain",
];

/// Tags entity occurrences in string values: `EMAIL_ADDRESS`,
/// `PHONE_NUMBER`, `PERSON`, `LOCATION`.
#[derive(Debug, Default)]
pub struct PiiDetector;

impl PiiDetector {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn scan(text: &str) -> Vec<String> {
        let mut tags = Vec::new();
        if EMAIL.is_match(text) {
            tags.push("EMAIL_ADDRESS".to_string());
        }
        if PHONE.is_match(text) {
            tags.push("PHONE_NUMBER".to_string());
        }
        if HONORIFIC_NAME.is_match(text) || contains_word(text, GIVEN_NAMES) {
            tags.push("PERSON".to_string());
        }
        if contains_word(text, PLACES) {
            tags.push("LOCATION".to_string());
        }
        tags
    }
}

fn contains_word(text: &str, words: &[&str]) -> bool {
    words.iter().any(|word| {
        text.match_indices(word).any(|(index, _)| {
            let before_ok = text[..index]
                .chars()
                .next_back()
                .is_none_or(|c| !c.is_alphanumeric());
            let after_ok = text[index + word.len()..]
                .chars()
                .next()
                .is_none_or(|c| !c.is_alphanumeric());
            before_ok && after_ok
        })
    })
}

impl Detector for PiiDetector {
    fn name(&self) -> &str {
        "pii"
    }

    fn detect(
        &self,
        value: &Value,
        _options: &DetectorOptions,
    ) -> Result<DetectorVerdict, DetectorError> {
        let Some(text) = value.as_str() else {
            return Ok(DetectorVerdict::Tags(Vec::new()));
        };
        Ok(DetectorVerdict::Tags(Self::scan(text)))
    }
}
