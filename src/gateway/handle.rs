use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender, TrySendError};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{Notify, oneshot};
use tracing::{debug, warn};

use super::envelope::{CallJob, RequestEnvelope, WorkerMessage};
use super::identity::ConnectionIdentity;
use super::session::{Endpoint, GatewaySession, SessionError, SessionFactory};
use super::worker;
use crate::cancellation::CancellationToken;
use crate::classifier::ErrorClassifier;
use crate::errors::GatewayError;

// -----------------------------------------------------------------------------
// ----- Constants -------------------------------------------------------------

/// Slack on top of the session's own timeouts before the caller gives up.
const PROBE_GRACE: Duration = Duration::from_millis(500);
const STARTUP_GRACE: Duration = Duration::from_secs(1);

// -----------------------------------------------------------------------------
// ----- HandleConfig ----------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleConfig {
    pub idle_timeout: Duration,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub probe_timeout: Duration,
    pub queue_capacity: usize,
    /// How often an idle worker wakes up to check for idle timeout and stop
    /// requests.
    pub poll_interval: Duration,
    /// Gap between two health checks above which a sleep/wake is suspected.
    pub sleep_wake_gap: Duration,
}

impl Default for HandleConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(180),
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(5),
            queue_capacity: 32,
            poll_interval: Duration::from_secs(1),
            sleep_wake_gap: Duration::from_secs(120),
        }
    }
}

// -----------------------------------------------------------------------------
// ----- HandleState / StopReason ----------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Created,
    Connecting,
    Connected,
    IdleStopped,
    Evicted,
    Failed,
    Stopped,
}

impl HandleState {
    pub fn as_str(self) -> &'static str {
        match self {
            HandleState::Created => "created",
            HandleState::Connecting => "connecting",
            HandleState::Connected => "connected",
            HandleState::IdleStopped => "idle_stopped",
            HandleState::Evicted => "evicted",
            HandleState::Failed => "failed",
            HandleState::Stopped => "stopped",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            HandleState::IdleStopped | HandleState::Evicted | HandleState::Failed | HandleState::Stopped
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Evicted,
    Shutdown,
}

// -----------------------------------------------------------------------------
// ----- HandleStats -----------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleStats {
    pub identity: ConnectionIdentity,
    pub state: HandleState,
    pub processed: u64,
    pub errored: u64,
    pub queued: usize,
    pub idle_for: Duration,
    pub uptime: Duration,
}

// -----------------------------------------------------------------------------
// ----- HandleShared ----------------------------------------------------------

/// State published by the worker thread. Callers only read it, apart from
/// raising the stop request.
#[derive(Debug)]
pub(crate) struct HandleShared {
    pub(crate) identity: ConnectionIdentity,
    pub(crate) config: HandleConfig,

    state: Mutex<HandleState>,
    stop_reason: Mutex<Option<StopReason>>,
    stopping: AtomicBool,
    worker_alive: AtomicBool,
    session_connected: AtomicBool,

    created_at: Instant,
    last_activity: Mutex<Instant>,
    busy_since: Mutex<Option<Instant>>,
    processed: AtomicU64,
    errored: AtomicU64,
    queued: AtomicUsize,

    exited: Notify,
}

impl HandleShared {
    fn new(identity: ConnectionIdentity, config: HandleConfig) -> Self {
        let now = Instant::now();
        Self {
            identity,
            config,
            state: Mutex::new(HandleState::Created),
            stop_reason: Mutex::new(None),
            stopping: AtomicBool::new(false),
            worker_alive: AtomicBool::new(true),
            session_connected: AtomicBool::new(false),
            created_at: now,
            last_activity: Mutex::new(now),
            busy_since: Mutex::new(None),
            processed: AtomicU64::new(0),
            errored: AtomicU64::new(0),
            queued: AtomicUsize::new(0),
            exited: Notify::new(),
        }
    }

    pub(crate) fn state(&self) -> HandleState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: HandleState) {
        *self.state.lock() = state;
    }

    pub(crate) fn stop_reason(&self) -> Option<StopReason> {
        *self.stop_reason.lock()
    }

    /// Returns true for the first stop request.
    fn request_stop(&self, reason: StopReason) -> bool {
        let mut guard = self.stop_reason.lock();
        if guard.is_some() {
            return false;
        }
        *guard = Some(reason);
        self.stopping.store(true, Ordering::Release);
        true
    }

    pub(crate) fn mark_stopping(&self) {
        self.stopping.store(true, Ordering::Release);
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    pub(crate) fn worker_alive(&self) -> bool {
        self.worker_alive.load(Ordering::Acquire)
    }

    pub(crate) fn mark_worker_exited(&self) {
        self.worker_alive.store(false, Ordering::Release);
        self.exited.notify_waiters();
    }

    pub(crate) fn publish_connected(&self, connected: bool) {
        self.session_connected.store(connected, Ordering::Release);
    }

    pub(crate) fn session_connected(&self) -> bool {
        self.session_connected.load(Ordering::Acquire)
    }

    pub(crate) fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    pub(crate) fn set_busy(&self, busy: bool) {
        *self.busy_since.lock() = busy.then(Instant::now);
    }

    pub(crate) fn busy_for(&self) -> Option<Duration> {
        self.busy_since.lock().map(|since| since.elapsed())
    }

    pub(crate) fn record_outcome(&self, succeeded: bool) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        if !succeeded {
            self.errored.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn dequeued(&self) {
        self.queued.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn counts(&self) -> (u64, u64) {
        (
            self.processed.load(Ordering::Relaxed),
            self.errored.load(Ordering::Relaxed),
        )
    }
}

// -----------------------------------------------------------------------------
// ----- ConnectionHandle ------------------------------------------------------

/// One gateway session and the dedicated thread that owns it.
///
/// Every call runs on that thread, one at a time, in submission order. The
/// handle itself only holds the sending side of the worker's bounded queue
/// and the state the worker publishes.
pub struct ConnectionHandle<F: SessionFactory> {
    shared: Arc<HandleShared>,
    sender: SyncSender<WorkerMessage<F::Session>>,
    ready: Mutex<Option<oneshot::Receiver<Result<(), SessionError>>>>,
    next_correlation: AtomicU64,
    last_health_check: Mutex<Option<SystemTime>>,
}

struct Submitted {
    correlation_id: u64,
    abandoned: Arc<AtomicBool>,
}

// -----------------------------------------------------------------------------
// ----- ConnectionHandle: Static ----------------------------------------------

impl<F: SessionFactory> ConnectionHandle<F> {
    /// Starts the worker thread, which creates and connects the session.
    /// Use [`Self::wait_ready`] to learn whether that worked.
    pub fn spawn(
        factory: Arc<F>,
        identity: ConnectionIdentity,
        endpoint: Endpoint,
        config: HandleConfig,
        classifier: Arc<ErrorClassifier>,
    ) -> Result<Self, SessionError> {
        let (sender, receiver) = mpsc::sync_channel(config.queue_capacity.max(1));
        let (ready_tx, ready_rx) = oneshot::channel();
        let shared = Arc::new(HandleShared::new(identity, config));

        worker::spawn(factory, endpoint, shared.clone(), classifier, receiver, ready_tx)
            .map_err(|e| SessionError::transport(format!("failed to spawn worker thread: {e}")))?;

        Ok(Self {
            shared,
            sender,
            ready: Mutex::new(Some(ready_rx)),
            next_correlation: AtomicU64::new(1),
            last_health_check: Mutex::new(None),
        })
    }

    /// Spawns and waits until the session is connected and answered its
    /// first probe. On failure the worker is told to stop.
    pub async fn open(
        factory: Arc<F>,
        identity: ConnectionIdentity,
        endpoint: Endpoint,
        config: HandleConfig,
        classifier: Arc<ErrorClassifier>,
    ) -> Result<Self, SessionError> {
        let handle = Self::spawn(factory, identity, endpoint, config, classifier)?;
        if let Err(err) = handle.wait_ready().await {
            handle.shutdown(StopReason::Shutdown);
            return Err(err);
        }
        Ok(handle)
    }
}

// -----------------------------------------------------------------------------
// ----- ConnectionHandle: Public ----------------------------------------------

impl<F: SessionFactory> ConnectionHandle<F> {
    pub fn identity(&self) -> ConnectionIdentity {
        self.shared.identity
    }

    pub fn state(&self) -> HandleState {
        self.shared.state()
    }

    pub fn config(&self) -> &HandleConfig {
        &self.shared.config
    }

    pub fn idle_for(&self) -> Duration {
        self.shared.idle_for()
    }

    pub fn is_worker_alive(&self) -> bool {
        self.shared.worker_alive()
    }

    /// How long the call currently running on the worker has been running.
    pub fn busy_for(&self) -> Option<Duration> {
        self.shared.busy_for()
    }

    pub fn queued(&self) -> usize {
        self.shared.queued.load(Ordering::Acquire)
    }

    pub async fn wait_ready(&self) -> Result<(), SessionError> {
        let Some(ready) = self.ready.lock().take() else {
            return match self.state() {
                HandleState::Connected => Ok(()),
                state => Err(SessionError::transport(format!(
                    "connection {} is {}",
                    self.identity(),
                    state.as_str()
                ))),
            };
        };

        let config = &self.shared.config;
        let limit = config.connect_timeout + config.probe_timeout + STARTUP_GRACE;

        match tokio::time::timeout(limit, ready).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SessionError::transport(
                "worker exited before the session was established",
            )),
            Err(_) => Err(SessionError::transport(format!(
                "session startup timed out after {limit:?}"
            ))),
        }
    }

    /// Runs `call` on the worker, waiting up to the configured request
    /// timeout.
    pub async fn execute<T, C>(&self, call: C) -> Result<T, GatewayError>
    where
        T: Send + 'static,
        C: FnOnce(&mut F::Session) -> Result<T, SessionError> + Send + 'static,
    {
        self.execute_with_timeout(call, self.shared.config.request_timeout)
            .await
    }

    pub async fn execute_with_timeout<T, C>(
        &self,
        call: C,
        timeout: Duration,
    ) -> Result<T, GatewayError>
    where
        T: Send + 'static,
        C: FnOnce(&mut F::Session) -> Result<T, SessionError> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let submitted = self.submit(
            call,
            move |result| {
                let _ = tx.send(result);
            },
            true,
        )?;

        self.await_result(rx, submitted, timeout).await
    }

    /// Thread-style counterpart of [`Self::execute`]. Blocks the current
    /// thread; don't call it from an async task.
    pub fn execute_blocking<T, C>(&self, call: C) -> Result<T, GatewayError>
    where
        T: Send + 'static,
        C: FnOnce(&mut F::Session) -> Result<T, SessionError> + Send + 'static,
    {
        self.execute_blocking_with_timeout(call, self.shared.config.request_timeout)
    }

    pub fn execute_blocking_with_timeout<T, C>(
        &self,
        call: C,
        timeout: Duration,
    ) -> Result<T, GatewayError>
    where
        T: Send + 'static,
        C: FnOnce(&mut F::Session) -> Result<T, SessionError> + Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(1);
        let submitted = self.submit(
            call,
            move |result| {
                let _ = tx.send(result);
            },
            true,
        )?;

        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Disconnected) => Err(self.stopped_error()),
            Err(RecvTimeoutError::Timeout) => Err(self.timed_out(submitted, timeout)),
        }
    }

    /// Runs `call` unless `token` is already cancelled. A running call is
    /// never interrupted; if the token was cancelled while it ran,
    /// `compensate` is submitted afterwards (e.g. to stop a remote
    /// subscription) and the operation reports cancellation.
    pub async fn execute_cancellable<T, C, K>(
        &self,
        token: &CancellationToken,
        call: C,
        compensate: K,
    ) -> Result<T, GatewayError>
    where
        T: Send + 'static,
        C: FnOnce(&mut F::Session) -> Result<T, SessionError> + Send + 'static,
        K: FnOnce(&mut F::Session) -> Result<(), SessionError> + Send + 'static,
    {
        token.check()?;

        let result = self.execute(call).await;

        if token.is_cancelled() {
            debug!(
                "connection {}: operation {} cancelled during call, compensating",
                self.identity(),
                token.operation_id()
            );
            if let Err(err) = self.execute(compensate).await {
                warn!(
                    "connection {}: compensating call for {} failed: {err}",
                    self.identity(),
                    token.operation_id()
                );
            }
            token.check()?;
        }

        result
    }

    /// Active round trip through the worker. Doesn't count as activity, so
    /// probing never keeps an idle connection alive.
    pub async fn probe(&self) -> Result<(), GatewayError> {
        let probe_timeout = self.shared.config.probe_timeout;
        let (tx, rx) = oneshot::channel();

        let submitted = self.submit(
            move |session| {
                if !session.is_connected() {
                    return Err(SessionError::transport("session reports not connected"));
                }
                session.probe(probe_timeout)
            },
            move |result| {
                let _ = tx.send(result);
            },
            false,
        )?;

        self.await_result(rx, submitted, probe_timeout + PROBE_GRACE)
            .await
    }

    /// Worker alive, not stopping, session says connected, not idle for too
    /// long, and an active probe succeeds. The probe is what counts: the
    /// session's own flag can't be trusted after a sleep/wake.
    pub async fn is_healthy(&self) -> bool {
        if !self.shared.worker_alive() || self.shared.is_stopping() {
            return false;
        }

        if self.state() != HandleState::Connected || !self.shared.session_connected() {
            return false;
        }

        if self.shared.idle_for() >= self.shared.config.idle_timeout {
            return false;
        }

        self.note_health_check();

        match self.probe().await {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    "connection {} failed its health probe: {err}",
                    self.identity()
                );
                false
            }
        }
    }

    /// Asks the worker to stop. The session is torn down on the worker
    /// thread; queued requests are rejected.
    pub fn shutdown(&self, reason: StopReason) {
        if self.shared.request_stop(reason) {
            debug!("connection {}: stop requested ({reason:?})", self.identity());
            let _ = self.sender.try_send(WorkerMessage::Shutdown);
        }
    }

    /// Resolves once the worker thread has torn down the session and exited.
    pub async fn stopped(&self) {
        loop {
            let notified = self.shared.exited.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.shared.worker_alive() {
                return;
            }

            notified.await;
        }
    }

    /// Returns whether the worker exited within `timeout`.
    pub async fn wait_stopped(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.stopped()).await.is_ok()
    }

    pub fn stats(&self) -> HandleStats {
        let (processed, errored) = self.shared.counts();

        HandleStats {
            identity: self.identity(),
            state: self.state(),
            processed,
            errored,
            queued: self.queued(),
            idle_for: self.shared.idle_for(),
            uptime: self.shared.created_at.elapsed(),
        }
    }
}

// -----------------------------------------------------------------------------
// ----- ConnectionHandle: Private ---------------------------------------------

impl<F: SessionFactory> ConnectionHandle<F> {
    fn submit<T, C, D>(
        &self,
        call: C,
        complete: D,
        counts_as_activity: bool,
    ) -> Result<Submitted, GatewayError>
    where
        T: Send + 'static,
        C: FnOnce(&mut F::Session) -> Result<T, SessionError> + Send + 'static,
        D: FnOnce(Result<T, GatewayError>) + Send + 'static,
    {
        if self.shared.is_stopping() {
            return Err(self.stopped_error());
        }

        let correlation_id = self.next_correlation.fetch_add(1, Ordering::Relaxed);
        let abandoned = Arc::new(AtomicBool::new(false));
        let envelope = RequestEnvelope {
            correlation_id,
            submitted_at: Instant::now(),
            counts_as_activity,
            abandoned: abandoned.clone(),
            job: Box::new(CallJob::new(call, complete)),
        };

        self.shared.queued.fetch_add(1, Ordering::AcqRel);
        match self.sender.try_send(WorkerMessage::Request(envelope)) {
            Ok(()) => Ok(Submitted {
                correlation_id,
                abandoned,
            }),
            Err(TrySendError::Full(_)) => {
                self.shared.dequeued();
                Err(GatewayError::QueueFull {
                    identity: self.identity(),
                    capacity: self.shared.config.queue_capacity,
                })
            }
            Err(TrySendError::Disconnected(_)) => {
                self.shared.dequeued();
                Err(self.stopped_error())
            }
        }
    }

    async fn await_result<T>(
        &self,
        rx: oneshot::Receiver<Result<T, GatewayError>>,
        submitted: Submitted,
        timeout: Duration,
    ) -> Result<T, GatewayError> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(self.stopped_error()),
            Err(_) => Err(self.timed_out(submitted, timeout)),
        }
    }

    fn timed_out(&self, submitted: Submitted, timeout: Duration) -> GatewayError {
        // Not started yet: the worker skips it. Already running: it finishes
        // and the result is dropped.
        submitted.abandoned.store(true, Ordering::Release);

        GatewayError::RequestTimeout {
            identity: self.identity(),
            correlation_id: submitted.correlation_id,
            timeout,
        }
    }

    fn stopped_error(&self) -> GatewayError {
        GatewayError::HandleStopped {
            identity: self.identity(),
        }
    }

    fn note_health_check(&self) {
        let now = SystemTime::now();
        let previous = self.last_health_check.lock().replace(now);

        let Some(previous) = previous else {
            return;
        };
        let Ok(gap) = now.duration_since(previous) else {
            return;
        };

        if gap > self.shared.config.sleep_wake_gap {
            warn!(
                "connection {}: {gap:?} since the previous health check, possible sleep/wake; relying on probe",
                self.identity()
            );
        }
    }
}

impl<F: SessionFactory> fmt::Debug for ConnectionHandle<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("identity", &self.shared.identity)
            .field("state", &self.shared.state())
            .field("stopping", &self.shared.is_stopping())
            .finish()
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
