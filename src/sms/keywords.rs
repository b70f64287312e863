//! Compliance keyword and emergency-term detection.

use std::sync::LazyLock;

use regex::Regex;

/// A recognized compliance keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    Stop,
    Start,
    Help,
}

/// Detect a compliance keyword. The body is trimmed and uppercased; only
/// an exact match counts, so "please STOP calling" is not a keyword.
pub fn detect_keyword(body: &str) -> Option<Keyword> {
    match body.trim().to_uppercase().as_str() {
        "STOP" | "STOPALL" | "UNSUBSCRIBE" | "CANCEL" | "END" => Some(Keyword::Stop),
        "START" | "UNSTOP" | "YES" => Some(Keyword::Start),
        "HELP" | "INFO" => Some(Keyword::Help),
        _ => None,
    }
}

static EMERGENCY_TERMS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(emergency|urgent|crisis|911)\b").unwrap());

/// Whether the body contains an emergency/urgent term as a whole word.
pub fn contains_emergency_term(body: &str) -> bool {
    EMERGENCY_TERMS.is_match(body)
}
