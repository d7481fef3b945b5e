use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken as Signal;

use crate::errors::GatewayError;

// -----------------------------------------------------------------------------
// ----- Shared state ----------------------------------------------------------

/// Coordinator-wide flag every token of one coordinator points at.
///
/// `root` is the parent of every token's async signal, so cancelling it
/// reaches registered and orphaned tokens alike. Blocking waiters of every
/// token park on the one `blocking_waiters` condvar.
#[derive(Debug, Default)]
pub(crate) struct GlobalCancellation {
    root: Signal,
    reason: Mutex<Option<String>>,
    wake: Mutex<()>,
    blocking_waiters: Condvar,
}

impl GlobalCancellation {
    /// First reason wins; returns false if it was already set.
    pub(crate) fn set(&self, reason: &str) -> bool {
        {
            let mut guard = self.reason.lock();
            if guard.is_some() {
                return false;
            }
            *guard = Some(reason.to_string());
            self.root.cancel();
        }

        self.wake_blocking();
        true
    }

    pub(crate) fn is_set(&self) -> bool {
        self.root.is_cancelled()
    }

    pub(crate) fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }

    fn wake_blocking(&self) {
        let _guard = self.wake.lock();
        self.blocking_waiters.notify_all();
    }
}

#[derive(Debug)]
struct TokenState {
    reason: Mutex<Option<String>>,
    signal: Signal,
}

// -----------------------------------------------------------------------------
// ----- CancellationToken -----------------------------------------------------

/// Cooperative cancellation flag for one operation.
///
/// Cloning yields another handle to the same state. Once cancelled a token
/// stays cancelled; only the first reason is kept. Waiting works from both
/// async tasks ([`CancellationToken::cancelled`]) and plain threads
/// ([`CancellationToken::wait_blocking`]).
#[derive(Debug, Clone)]
pub struct CancellationToken {
    operation_id: Arc<str>,
    state: Arc<TokenState>,
    global: Arc<GlobalCancellation>,
}

// -----------------------------------------------------------------------------
// ----- CancellationToken: Static ---------------------------------------------

impl CancellationToken {
    /// A token not attached to any coordinator.
    pub fn new(operation_id: impl Into<Arc<str>>) -> Self {
        Self::attached(operation_id.into(), Arc::new(GlobalCancellation::default()))
    }

    pub(crate) fn attached(operation_id: Arc<str>, global: Arc<GlobalCancellation>) -> Self {
        let state = TokenState {
            reason: Mutex::new(None),
            signal: global.root.child_token(),
        };

        Self {
            operation_id,
            state: Arc::new(state),
            global,
        }
    }
}

// -----------------------------------------------------------------------------
// ----- CancellationToken: Public ---------------------------------------------

impl CancellationToken {
    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    /// Returns true if this call flipped the token.
    pub fn cancel(&self, reason: &str) -> bool {
        {
            let mut guard = self.state.reason.lock();
            if guard.is_some() {
                return false;
            }
            *guard = Some(reason.to_string());
            self.state.signal.cancel();
        }

        self.global.wake_blocking();
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.signal.is_cancelled()
    }

    pub fn reason(&self) -> Option<String> {
        if let Some(reason) = self.state.reason.lock().clone() {
            return Some(reason);
        }
        self.global.reason()
    }

    /// Checkpoint: `Err(Cancelled)` once the token is cancelled.
    pub fn check(&self) -> Result<(), GatewayError> {
        if !self.is_cancelled() {
            return Ok(());
        }

        Err(GatewayError::Cancelled {
            operation_id: self.operation_id.to_string(),
            reason: self.reason().unwrap_or_else(|| "cancelled".to_string()),
        })
    }

    /// Resolves once the token, or its coordinator, is cancelled.
    pub async fn cancelled(&self) {
        self.state.signal.cancelled().await;
    }

    /// Blocks the current thread until cancelled or `timeout` elapses.
    /// Returns whether the token is cancelled.
    pub fn wait_blocking(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut guard = self.global.wake.lock();

        while !self.is_cancelled() {
            match deadline {
                None => self.global.blocking_waiters.wait(&mut guard),
                Some(deadline) => {
                    if self
                        .global
                        .blocking_waiters
                        .wait_until(&mut guard, deadline)
                        .timed_out()
                    {
                        return self.is_cancelled();
                    }
                }
            }
        }

        true
    }

    pub(crate) fn same_state(&self, other: &CancellationToken) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
