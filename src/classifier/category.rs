use serde::Deserialize;
use std::fmt;

// -----------------------------------------------------------------------------
// ----- ErrorCategory ---------------------------------------------------------

/// Retry policy bucket for an error reported by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Fatal,
    Retryable,
    PacingViolation,
    DataUnavailable,
    ConnectionError,
    PermissionError,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Fatal => "fatal",
            ErrorCategory::Retryable => "retryable",
            ErrorCategory::PacingViolation => "pacing_violation",
            ErrorCategory::DataUnavailable => "data_unavailable",
            ErrorCategory::ConnectionError => "connection_error",
            ErrorCategory::PermissionError => "permission_error",
        }
    }

    pub fn should_retry(self) -> bool {
        matches!(
            self,
            ErrorCategory::Retryable
                | ErrorCategory::PacingViolation
                | ErrorCategory::ConnectionError
        )
    }

    pub fn is_fatal(self) -> bool {
        matches!(self, ErrorCategory::Fatal | ErrorCategory::PermissionError)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
