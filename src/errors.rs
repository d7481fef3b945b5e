use std::time::Duration;

use thiserror::Error;

use crate::classifier::{ErrorCategory, ErrorClassifier};
use crate::gateway::ConnectionIdentity;

// -----------------------------------------------------------------------------
// ----- GatewayError ----------------------------------------------------------

/// Everything the connectivity layer can fail with.
///
/// Pool and connection failures ("we couldn't reach the gateway") are kept
/// apart from [`GatewayError::Protocol`] ("the gateway rejected this call"),
/// see [`GatewayError::is_pool_error`] and [`GatewayError::is_protocol_error`].
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("connection pool exhausted ({current}/{max} connections, none healthy)")]
    ConnectionExhausted { current: usize, max: usize },

    #[error("failed to create gateway connection after {attempts} attempt(s): {reason}")]
    ConnectionCreationFailed { attempts: u32, reason: String },

    #[error("request {correlation_id} on connection {identity} timed out after {timeout:?}")]
    RequestTimeout {
        identity: ConnectionIdentity,
        correlation_id: u64,
        timeout: Duration,
    },

    #[error("request queue of connection {identity} is full ({capacity} pending)")]
    QueueFull {
        identity: ConnectionIdentity,
        capacity: usize,
    },

    #[error(
        "gateway error {code} on connection {identity} (request {correlation_id}): {message} [{category}, wait {wait:?}]"
    )]
    Protocol {
        identity: ConnectionIdentity,
        correlation_id: u64,
        code: i32,
        message: String,
        category: ErrorCategory,
        wait: Duration,
    },

    #[error("operation '{operation_id}' cancelled: {reason}")]
    Cancelled { operation_id: String, reason: String },

    #[error("connection {identity} is stopped")]
    HandleStopped { identity: ConnectionIdentity },

    #[error("request {correlation_id} panicked on connection {identity}")]
    WorkerPanicked {
        identity: ConnectionIdentity,
        correlation_id: u64,
    },

    #[error("gateway context is shutting down")]
    ShuttingDown,
}

// -----------------------------------------------------------------------------
// ----- GatewayError: Public --------------------------------------------------

impl GatewayError {
    pub fn is_pool_error(&self) -> bool {
        matches!(
            self,
            GatewayError::ConnectionExhausted { .. }
                | GatewayError::ConnectionCreationFailed { .. }
                | GatewayError::RequestTimeout { .. }
                | GatewayError::QueueFull { .. }
                | GatewayError::HandleStopped { .. }
                | GatewayError::ShuttingDown
        )
    }

    pub fn is_protocol_error(&self) -> bool {
        matches!(self, GatewayError::Protocol { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, GatewayError::Cancelled { .. })
    }

    /// Category of a gateway-classified error; `None` for everything else.
    pub fn category(&self) -> Option<ErrorCategory> {
        match self {
            GatewayError::Protocol { category, .. } => Some(*category),
            _ => None,
        }
    }

    /// Caller-side retry hint. Only protocol errors carry one; nothing in
    /// this crate retries on its own.
    pub fn retry_delay(&self, attempt: u32) -> Option<Duration> {
        let category = self.category()?;
        if !category.should_retry() {
            return None;
        }
        Some(ErrorClassifier::retry_delay(category, attempt))
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhaustion_message_names_counts() {
        let err = GatewayError::ConnectionExhausted { current: 2, max: 2 };
        assert!(err.to_string().contains("2/2"));
        assert!(err.is_pool_error());
        assert!(!err.is_protocol_error());
    }

    #[test]
    fn protocol_errors_expose_category_and_delay() {
        let err = GatewayError::Protocol {
            identity: ConnectionIdentity::new(11),
            correlation_id: 4,
            code: 504,
            message: "Not connected".into(),
            category: ErrorCategory::ConnectionError,
            wait: Duration::from_secs(2),
        };

        assert!(err.is_protocol_error());
        assert!(!err.is_pool_error());
        assert_eq!(err.category(), Some(ErrorCategory::ConnectionError));
        assert_eq!(err.retry_delay(2), Some(Duration::from_secs(4)));
        assert!(err.to_string().contains("connection 11"));
    }

    #[test]
    fn fatal_protocol_errors_have_no_retry_delay() {
        let err = GatewayError::Protocol {
            identity: ConnectionIdentity::new(1),
            correlation_id: 1,
            code: 200,
            message: "No security definition".into(),
            category: ErrorCategory::Fatal,
            wait: Duration::ZERO,
        };
        assert_eq!(err.retry_delay(1), None);
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
