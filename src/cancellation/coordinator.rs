use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info};

use super::token::{CancellationToken, GlobalCancellation};
use crate::errors::GatewayError;

// -----------------------------------------------------------------------------
// ----- CancellationCoordinator -----------------------------------------------

/// Registry of live operations and their tokens.
///
/// Tokens are registered for the lifetime of one operation; global
/// cancellation flips every registered token and is applied up front to any
/// token created afterwards.
#[derive(Debug, Default)]
pub struct CancellationCoordinator {
    global: Arc<GlobalCancellation>,
    registry: Mutex<HashMap<String, CancellationToken>>,
}

// -----------------------------------------------------------------------------
// ----- CancellationCoordinator: Public ---------------------------------------

impl CancellationCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a token for `operation_id`, replacing any earlier token
    /// registered under the same id. A replaced token still follows
    /// [`Self::cancel_all`].
    pub fn create_token(&self, operation_id: &str) -> CancellationToken {
        let token = CancellationToken::attached(operation_id.into(), self.global.clone());
        self.registry
            .lock()
            .insert(operation_id.to_string(), token.clone());
        token
    }

    /// Flips the token registered under `operation_id`. Returns false if no
    /// such operation is live.
    pub fn cancel_operation(&self, operation_id: &str, reason: &str) -> bool {
        let token = self.registry.lock().get(operation_id).cloned();
        let Some(token) = token else {
            return false;
        };

        if token.cancel(reason) {
            debug!("cancelled operation {operation_id}: {reason}");
        }
        true
    }

    pub fn cancel_all(&self, reason: &str) {
        self.global.set(reason);

        let tokens: Vec<CancellationToken> = self.registry.lock().values().cloned().collect();
        info!(
            "cancelling all operations ({} live): {reason}",
            tokens.len()
        );

        for token in tokens {
            token.cancel(reason);
        }
    }

    /// Drops the registration for `operation_id`.
    pub fn complete(&self, operation_id: &str) {
        self.registry.lock().remove(operation_id);
    }

    pub fn is_globally_cancelled(&self) -> bool {
        self.global.is_set()
    }

    pub fn active_operations(&self) -> usize {
        self.registry.lock().len()
    }

    pub fn is_registered(&self, operation_id: &str) -> bool {
        self.registry.lock().contains_key(operation_id)
    }

    /// Runs `operation` with a registered token. The registration is removed
    /// on every exit path, including the future being dropped.
    pub async fn execute_with_cancellation<T, F, Fut>(
        &self,
        operation_id: &str,
        operation: F,
    ) -> Result<T, GatewayError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let registration = self.register(operation_id)?;
        operation(registration.token.clone()).await
    }

    /// Thread-style counterpart of [`Self::execute_with_cancellation`].
    pub fn execute_with_cancellation_blocking<T, F>(
        &self,
        operation_id: &str,
        operation: F,
    ) -> Result<T, GatewayError>
    where
        F: FnOnce(&CancellationToken) -> Result<T, GatewayError>,
    {
        let registration = self.register(operation_id)?;
        operation(&registration.token)
    }
}

// -----------------------------------------------------------------------------
// ----- CancellationCoordinator: Private --------------------------------------

impl CancellationCoordinator {
    fn register(&self, operation_id: &str) -> Result<Registration<'_>, GatewayError> {
        let token = self.create_token(operation_id);
        let registration = Registration {
            coordinator: self,
            token,
        };

        if self.global.is_set() {
            return Err(GatewayError::Cancelled {
                operation_id: operation_id.to_string(),
                reason: self.global.reason().unwrap_or_else(|| "cancelled".to_string()),
            });
        }

        Ok(registration)
    }
}

// -----------------------------------------------------------------------------
// ----- Registration ----------------------------------------------------------

struct Registration<'a> {
    coordinator: &'a CancellationCoordinator,
    token: CancellationToken,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        let mut registry = self.coordinator.registry.lock();
        // A newer operation may have reused the id; leave its token alone.
        let ours = registry
            .get(self.token.operation_id())
            .is_some_and(|t| t.same_state(&self.token));
        if ours {
            registry.remove(self.token.operation_id());
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
