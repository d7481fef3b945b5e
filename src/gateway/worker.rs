use std::io;
use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::thread;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::envelope::{JobContext, RequestEnvelope, WorkerMessage};
use super::handle::{HandleShared, HandleState, StopReason};
use super::session::{Endpoint, GatewaySession, SessionError, SessionFactory};
use crate::classifier::ErrorClassifier;
use crate::errors::GatewayError;

// -----------------------------------------------------------------------------
// ----- Spawn -----------------------------------------------------------------

pub(crate) fn spawn<F: SessionFactory>(
    factory: Arc<F>,
    endpoint: Endpoint,
    shared: Arc<HandleShared>,
    classifier: Arc<ErrorClassifier>,
    receiver: Receiver<WorkerMessage<F::Session>>,
    ready: oneshot::Sender<Result<(), SessionError>>,
) -> io::Result<()> {
    let name = format!("gatelink-conn-{}", shared.identity);

    thread::Builder::new().name(name).spawn(move || {
        let worker = Worker {
            factory,
            endpoint,
            shared,
            classifier,
            receiver,
        };
        worker.run(ready);
    })?;

    Ok(())
}

// -----------------------------------------------------------------------------
// ----- Worker ----------------------------------------------------------------

struct Worker<F: SessionFactory> {
    factory: Arc<F>,
    endpoint: Endpoint,
    shared: Arc<HandleShared>,
    classifier: Arc<ErrorClassifier>,
    receiver: Receiver<WorkerMessage<F::Session>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Idle,
    Requested,
    HandleDropped,
}

/// Flags the worker as gone however the thread ends, panics included.
struct AliveGuard(Arc<HandleShared>);

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.mark_stopping();
        self.0.mark_worker_exited();
    }
}

impl<F: SessionFactory> Worker<F> {
    fn run(self, ready: oneshot::Sender<Result<(), SessionError>>) {
        let _alive = AliveGuard(self.shared.clone());
        let identity = self.shared.identity;

        self.shared.set_state(HandleState::Connecting);
        let mut session = self.factory.create(identity);

        if let Err(err) = self.establish(&mut session) {
            warn!("connection {identity} to {} failed: {err}", self.endpoint);
            // Torn down before reporting, so the identity is free once the
            // caller hears about the failure.
            session.disconnect();
            self.shared.publish_connected(false);
            self.shared.set_state(HandleState::Failed);
            self.shared.mark_stopping();
            self.reject_pending();
            let _ = ready.send(Err(err));
            return;
        }

        self.shared.publish_connected(true);
        self.shared.touch();
        self.shared.set_state(HandleState::Connected);
        info!("connection {identity} established to {}", self.endpoint);
        let _ = ready.send(Ok(()));

        let exit = self.serve(&mut session);
        self.teardown(session, exit);
    }

    fn establish(&self, session: &mut F::Session) -> Result<(), SessionError> {
        let config = &self.shared.config;

        session.connect(&self.endpoint, self.shared.identity, config.connect_timeout)?;

        if !session.is_connected() {
            return Err(SessionError::transport(
                "session reports disconnected right after connect",
            ));
        }

        session.probe(config.probe_timeout)
    }

    fn serve(&self, session: &mut F::Session) -> Exit {
        let config = &self.shared.config;

        loop {
            if self.shared.is_stopping() {
                return Exit::Requested;
            }

            match self.receiver.recv_timeout(config.poll_interval) {
                Ok(WorkerMessage::Request(envelope)) => self.process(session, envelope),
                Ok(WorkerMessage::Shutdown) => return Exit::Requested,
                Err(RecvTimeoutError::Timeout) => {
                    self.shared.publish_connected(session.is_connected());
                    if self.shared.idle_for() >= config.idle_timeout {
                        return Exit::Idle;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return Exit::HandleDropped,
            }
        }
    }

    fn process(&self, session: &mut F::Session, envelope: RequestEnvelope<F::Session>) {
        self.shared.dequeued();
        let identity = self.shared.identity;

        if envelope.is_abandoned() {
            debug!(
                "connection {identity}: skipping request {} abandoned by its caller",
                envelope.correlation_id
            );
            envelope.job.reject(GatewayError::RequestTimeout {
                identity,
                correlation_id: envelope.correlation_id,
                timeout: envelope.submitted_at.elapsed(),
            });
            return;
        }

        let ctx = JobContext {
            identity,
            correlation_id: envelope.correlation_id,
            classifier: &self.classifier,
        };
        self.shared.set_busy(true);
        let succeeded = envelope.job.run(session, &ctx);
        self.shared.set_busy(false);

        if envelope.counts_as_activity {
            self.shared.record_outcome(succeeded);
            self.shared.touch();
        }
        self.shared.publish_connected(session.is_connected());

        debug!(
            "connection {identity}: request {} finished in {:?} (ok={succeeded})",
            envelope.correlation_id,
            envelope.submitted_at.elapsed()
        );
    }

    fn teardown(&self, mut session: F::Session, exit: Exit) {
        let identity = self.shared.identity;
        self.shared.mark_stopping();
        let rejected = self.reject_pending();

        // The session's connected flag is not trusted here: always disconnect.
        session.disconnect();
        self.shared.publish_connected(false);

        let state = match exit {
            Exit::Idle => HandleState::IdleStopped,
            Exit::Requested | Exit::HandleDropped => match self.shared.stop_reason() {
                Some(StopReason::Evicted) => HandleState::Evicted,
                _ => HandleState::Stopped,
            },
        };
        self.shared.set_state(state);

        let (processed, errored) = self.shared.counts();
        info!(
            "connection {identity} {} (processed={processed}, errored={errored}, rejected={rejected})",
            state.as_str()
        );
    }

    fn reject_pending(&self) -> usize {
        let mut rejected = 0;

        while let Ok(message) = self.receiver.try_recv() {
            let WorkerMessage::Request(envelope) = message else {
                continue;
            };
            self.shared.dequeued();
            envelope.job.reject(GatewayError::HandleStopped {
                identity: self.shared.identity,
            });
            rejected += 1;
        }

        rejected
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
