//! Centralized E.164 phone normalization.
//!
//! Every read/write boundary (webhook input, directory lookups, dialing,
//! opt-out comparisons) goes through [`normalize`] so comparisons hold
//! regardless of input formatting.

/// Normalize a raw phone string to E.164.
///
/// Rules:
/// - an explicit leading `+` is preserved; everything after it is stripped
///   to digits
/// - a bare 10-digit value is assumed to be a US number and prefixed `+1`
/// - an 11-digit value starting with `1` gets a bare `+`
/// - anything else keeps its digits behind a `+`
/// - no digits at all → `None`
pub fn normalize(raw: &str) -> Option<String> {
    let s = raw.trim();
    if let Some(rest) = s.strip_prefix('+') {
        let digits: String = rest.chars().filter(|c| c.is_ascii_digit()).collect();
        if digits.is_empty() {
            return None;
        }
        return Some(format!("+{digits}"));
    }

    let digits: String = s.chars().filter(|c| c.is_ascii_digit()).collect();
    match digits.len() {
        0 => None,
        10 => Some(format!("+1{digits}")),
        11 if digits.starts_with('1') => Some(format!("+{digits}")),
        _ => Some(format!("+{digits}")),
    }
}

/// Normalize, falling back to the raw input when no digits are present.
///
/// Used at dial/send boundaries where a best-effort value beats dropping
/// the side effect entirely.
pub fn normalize_or_raw(raw: &str) -> String {
    normalize(raw).unwrap_or_else(|| raw.to_string())
}

/// Strip a value down to digits only. Short-code comparisons use this.
pub fn digits_only(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() { None } else { Some(digits) }
}
