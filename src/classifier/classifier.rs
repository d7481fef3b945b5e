use std::collections::HashMap;
use std::time::Duration;

use super::category::ErrorCategory;

// -----------------------------------------------------------------------------
// ----- Constants -------------------------------------------------------------

const RETRY_BASE_DELAY: Duration = Duration::from_secs(2);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(60);
const PACING_PENALTY: Duration = Duration::from_secs(60);

const DEFAULT_RETRY_WAIT: Duration = Duration::from_secs(5);
const KEYWORD_CONNECTION_WAIT: Duration = Duration::from_secs(5);

const TRANSPORT_PHRASES: &[&str] = &[
    "not connected",
    "connection lost",
    "lost connection",
    "connection refused",
    "connection reset",
    "connection closed",
    "connection aborted",
    "connection timed out",
    "connect timeout",
    "disconnected",
    "connectivity",
    "socket",
    "broken pipe",
    "reset by peer",
];

const PERMISSION_PHRASES: &[&str] = &[
    "permission",
    "not subscribed",
    "subscription",
    "not allowed",
    "not authorized",
];

const HEAVY_DATA_PHRASES: &[&str] = &["historical", "hmds"];
const PACING_PHRASES: &[&str] = &["pacing", "violation"];

/// Gateway codes with a known meaning. Codes 162 and 165 are data errors,
/// not pacing violations: the gateway reuses them for "no data" answers.
const KNOWN_CODES: &[(i32, ErrorCategory, u64)] = &[
    (100, ErrorCategory::PacingViolation, 60),
    (420, ErrorCategory::PacingViolation, 60),
    (326, ErrorCategory::ConnectionError, 2),
    (502, ErrorCategory::ConnectionError, 5),
    (504, ErrorCategory::ConnectionError, 2),
    (507, ErrorCategory::ConnectionError, 2),
    (1100, ErrorCategory::ConnectionError, 5),
    (1300, ErrorCategory::ConnectionError, 5),
    (200, ErrorCategory::Fatal, 0),
    (321, ErrorCategory::Fatal, 0),
    (503, ErrorCategory::Fatal, 0),
    (354, ErrorCategory::PermissionError, 0),
    (10089, ErrorCategory::PermissionError, 0),
    (10197, ErrorCategory::PermissionError, 0),
    (162, ErrorCategory::DataUnavailable, 0),
    (165, ErrorCategory::DataUnavailable, 0),
    (366, ErrorCategory::DataUnavailable, 0),
];

// -----------------------------------------------------------------------------
// ----- CodeRule --------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeRule {
    pub category: ErrorCategory,
    pub wait: Duration,
}

impl CodeRule {
    pub fn new(category: ErrorCategory, wait: Duration) -> Self {
        Self { category, wait }
    }
}

// -----------------------------------------------------------------------------
// ----- ErrorInfo -------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: i32,
    pub message: String,
    pub category: ErrorCategory,
    pub retryable: bool,
    pub fatal: bool,
    pub suggested_wait: Duration,
}

// -----------------------------------------------------------------------------
// ----- ErrorClassifier -------------------------------------------------------

/// Maps `(code, message)` pairs reported by the gateway to a retry category.
///
/// Immutable once built. The code table starts from the known gateway codes
/// and can be extended or overridden from configuration; anything the table
/// doesn't know falls through to message keyword rules, then to
/// [`ErrorCategory::Retryable`].
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    rules: HashMap<i32, CodeRule>,
}

// -----------------------------------------------------------------------------
// ----- ErrorClassifier: Static -----------------------------------------------

impl ErrorClassifier {
    pub fn new() -> Self {
        let rules = KNOWN_CODES
            .iter()
            .map(|&(code, category, wait)| (code, CodeRule::new(category, Duration::from_secs(wait))))
            .collect();

        Self { rules }
    }

    /// Adds codes or replaces the rule of known ones.
    pub fn with_rules(mut self, rules: impl IntoIterator<Item = (i32, CodeRule)>) -> Self {
        self.rules.extend(rules);
        self
    }

    pub fn is_identity_conflict(text: &str) -> bool {
        let text = text.to_ascii_lowercase();
        text.contains("already in use") || (text.contains("client id") && text.contains("in use"))
    }

    /// Suggested delay before attempt number `attempt` (1-based) of a call
    /// that failed with `category`.
    pub fn retry_delay(category: ErrorCategory, attempt: u32) -> Duration {
        match category {
            ErrorCategory::Fatal | ErrorCategory::PermissionError => Duration::ZERO,
            ErrorCategory::DataUnavailable => Duration::ZERO,
            ErrorCategory::PacingViolation => PACING_PENALTY,
            ErrorCategory::ConnectionError | ErrorCategory::Retryable => {
                let exponent = attempt.max(1) - 1;
                // 2^5 * 2s already exceeds the cap.
                if exponent >= 5 {
                    return RETRY_MAX_DELAY;
                }
                (RETRY_BASE_DELAY * 2u32.pow(exponent)).min(RETRY_MAX_DELAY)
            }
        }
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new()
    }
}

// -----------------------------------------------------------------------------
// ----- ErrorClassifier: Public -----------------------------------------------

impl ErrorClassifier {
    pub fn classify(&self, code: i32, message: &str) -> (ErrorCategory, Duration) {
        if let Some(rule) = self.rules.get(&code) {
            return (rule.category, rule.wait);
        }

        classify_message(message)
    }

    pub fn rule_for(&self, code: i32) -> Option<CodeRule> {
        self.rules.get(&code).copied()
    }

    pub fn known_codes(&self) -> usize {
        self.rules.len()
    }

    pub fn format_error_info(&self, code: i32, message: &str) -> ErrorInfo {
        let (category, suggested_wait) = self.classify(code, message);

        ErrorInfo {
            code,
            message: message.to_string(),
            category,
            retryable: category.should_retry(),
            fatal: category.is_fatal(),
            suggested_wait,
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Internal: Helpers -----------------------------------------------------

fn classify_message(message: &str) -> (ErrorCategory, Duration) {
    let text = message.to_ascii_lowercase();

    if contains_any(&text, TRANSPORT_PHRASES) {
        return (ErrorCategory::ConnectionError, KEYWORD_CONNECTION_WAIT);
    }

    if contains_any(&text, PERMISSION_PHRASES) {
        return (ErrorCategory::PermissionError, Duration::ZERO);
    }

    if contains_any(&text, HEAVY_DATA_PHRASES) {
        if contains_any(&text, PACING_PHRASES) {
            return (ErrorCategory::PacingViolation, PACING_PENALTY);
        }
        return (ErrorCategory::DataUnavailable, Duration::ZERO);
    }

    (ErrorCategory::Retryable, DEFAULT_RETRY_WAIT)
}

#[inline]
fn contains_any(text: &str, phrases: &[&str]) -> bool {
    phrases.iter().any(|p| text.contains(p))
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
