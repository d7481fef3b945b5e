use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::error;

use super::identity::ConnectionIdentity;
use super::session::SessionError;
use crate::classifier::ErrorClassifier;
use crate::errors::GatewayError;

// -----------------------------------------------------------------------------
// ----- JobContext ------------------------------------------------------------

/// What the worker knows about the request it is running.
pub(crate) struct JobContext<'a> {
    pub(crate) identity: ConnectionIdentity,
    pub(crate) correlation_id: u64,
    pub(crate) classifier: &'a ErrorClassifier,
}

impl JobContext<'_> {
    fn protocol_error(&self, err: SessionError) -> GatewayError {
        let code = err.code_or_default();
        let (category, wait) = self.classifier.classify(code, &err.message);

        GatewayError::Protocol {
            identity: self.identity,
            correlation_id: self.correlation_id,
            code,
            message: err.message,
            category,
            wait,
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Job -------------------------------------------------------------------

/// Type-erased call plus its result slot. Exactly one of `run` or `reject`
/// is invoked, which completes the slot exactly once.
pub(crate) trait Job<S>: Send {
    /// Returns whether the call succeeded.
    fn run(self: Box<Self>, session: &mut S, ctx: &JobContext<'_>) -> bool;

    fn reject(self: Box<Self>, err: GatewayError);
}

pub(crate) struct CallJob<C, T, D> {
    call: C,
    complete: D,
    _result: PhantomData<fn() -> T>,
}

impl<C, T, D> CallJob<C, T, D> {
    pub(crate) fn new(call: C, complete: D) -> Self {
        Self {
            call,
            complete,
            _result: PhantomData,
        }
    }
}

impl<S, C, T, D> Job<S> for CallJob<C, T, D>
where
    C: FnOnce(&mut S) -> Result<T, SessionError> + Send,
    D: FnOnce(Result<T, GatewayError>) + Send,
{
    fn run(self: Box<Self>, session: &mut S, ctx: &JobContext<'_>) -> bool {
        let CallJob { call, complete, .. } = *self;

        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| call(session))) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(ctx.protocol_error(err)),
            Err(_) => {
                error!(
                    "request {} panicked on connection {}",
                    ctx.correlation_id, ctx.identity
                );
                Err(GatewayError::WorkerPanicked {
                    identity: ctx.identity,
                    correlation_id: ctx.correlation_id,
                })
            }
        };

        let succeeded = outcome.is_ok();
        complete(outcome);
        succeeded
    }

    fn reject(self: Box<Self>, err: GatewayError) {
        let CallJob { complete, .. } = *self;
        complete(Err(err));
    }
}

// -----------------------------------------------------------------------------
// ----- RequestEnvelope -------------------------------------------------------

pub(crate) struct RequestEnvelope<S> {
    pub(crate) correlation_id: u64,
    pub(crate) submitted_at: Instant,
    /// Health probes don't keep an idle connection alive.
    pub(crate) counts_as_activity: bool,
    pub(crate) abandoned: Arc<AtomicBool>,
    pub(crate) job: Box<dyn Job<S>>,
}

impl<S> RequestEnvelope<S> {
    pub(crate) fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::Acquire)
    }
}

pub(crate) enum WorkerMessage<S> {
    Request(RequestEnvelope<S>),
    Shutdown,
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
