//! Recognise account usage / rate limit failures in a `result` message.

use std::sync::LazyLock;

use regex::Regex;

const MARKERS: &[&str] = &[
    "usage limit",
    "rate_limit_error",
    "rate limit exceeded",
    "quota exceeded",
];

#[allow(clippy::expect_used)]
static RESET_AT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:\d{2})?")
        .expect("static regex is valid")
});

/// A detected limit and when it lifts, if the message says.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimit {
    /// First ISO-8601 timestamp in the message.
    pub reset_at: Option<String>,
    pub message: String,
}

/// Inspect a failed result's text.
pub fn detect_rate_limit(text: &str) -> Option<RateLimit> {
    let lower = text.to_lowercase();
    let limited = MARKERS.iter().any(|m| lower.contains(m))
        || (lower.contains("429") && lower.contains("reset"));
    if !limited {
        return None;
    }
    Some(RateLimit {
        reset_at: RESET_AT_RE.find(text).map(|m| m.as_str().to_string()),
        message: text.to_string(),
    })
}
