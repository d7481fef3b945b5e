use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::handle::{ConnectionHandle, HandleConfig, HandleStats, StopReason};
use super::identity::{ConnectionIdentity, IdentityAllocator};
use super::session::{Endpoint, SessionError, SessionFactory};
use crate::cancellation::CancellationToken;
use crate::classifier::ErrorClassifier;
use crate::errors::GatewayError;

// -----------------------------------------------------------------------------
// ----- PoolConfig ------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub endpoint: Endpoint,
    pub max_connections: usize,
    pub min_connections: usize,
    pub acquire_timeout: Duration,
    pub identity_base: u32,
    pub identity_span: u32,
    pub identity_retry_attempts: u32,
    pub identity_retry_backoff: Duration,
    /// Gap between two pool-level checks above which every connection is
    /// assumed dead (host slept) and discarded.
    pub sleep_wake_gap: Duration,
    pub handle: HandleConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::default(),
            max_connections: 3,
            min_connections: 0,
            acquire_timeout: Duration::from_secs(30),
            identity_base: 1,
            identity_span: 32,
            identity_retry_attempts: 5,
            identity_retry_backoff: Duration::from_millis(500),
            sleep_wake_gap: Duration::from_secs(120),
            handle: HandleConfig::default(),
        }
    }
}

// -----------------------------------------------------------------------------
// ----- PoolStats -------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub endpoint: Endpoint,
    pub current: usize,
    pub max: usize,
    /// Connections being created right now.
    pub pending: usize,
    /// Evicted connections whose session isn't torn down yet.
    pub retiring: usize,
    pub created: u64,
    pub evicted: u64,
    pub creation_failures: u64,
    pub identity_conflicts: u64,
    pub sleep_wake_recoveries: u64,
    pub handles: Vec<HandleStats>,
}

// -----------------------------------------------------------------------------
// ----- ConnectionPool --------------------------------------------------------

/// Bounded set of gateway connections.
///
/// There is no release step: [`ConnectionPool::acquire`] hands out a shared
/// reference to a healthy connection, and connections expire on their own
/// through the idle timeout. Capacity counts every session the gateway may
/// still consider live: pooled connections, connections being created and
/// evicted connections still tearing down. At capacity, a connection that is
/// mid-call is shared; its queue serializes the callers.
pub struct ConnectionPool<F: SessionFactory> {
    factory: Arc<F>,
    classifier: Arc<ErrorClassifier>,
    config: PoolConfig,
    inner: Mutex<PoolInner<F>>,
    counters: PoolCounters,
    /// Notified whenever a pending or retiring slot is given back.
    slot_freed: Notify,
}

struct PoolInner<F: SessionFactory> {
    handles: Vec<Arc<ConnectionHandle<F>>>,
    pending: usize,
    retiring: usize,
    identities: IdentityAllocator,
    closed: bool,
    last_check: Option<SystemTime>,
}

impl<F: SessionFactory> PoolInner<F> {
    fn occupied(&self) -> usize {
        self.handles.len() + self.pending + self.retiring
    }
}

#[derive(Debug, Default)]
struct PoolCounters {
    created: AtomicU64,
    evicted: AtomicU64,
    creation_failures: AtomicU64,
    identity_conflicts: AtomicU64,
    sleep_wake_recoveries: AtomicU64,
}

// -----------------------------------------------------------------------------
// ----- ConnectionPool: Static ------------------------------------------------

impl<F: SessionFactory> ConnectionPool<F> {
    pub fn new(factory: Arc<F>, classifier: Arc<ErrorClassifier>, config: PoolConfig) -> Self {
        let max_connections = config.max_connections.max(1);
        let identities = IdentityAllocator::new(config.identity_base, config.identity_span);

        Self {
            factory,
            classifier,
            config: PoolConfig {
                max_connections,
                ..config
            },
            inner: Mutex::new(PoolInner {
                handles: Vec::new(),
                pending: 0,
                retiring: 0,
                identities,
                closed: false,
                last_check: None,
            }),
            counters: PoolCounters::default(),
            slot_freed: Notify::new(),
        }
    }
}

// -----------------------------------------------------------------------------
// ----- ConnectionPool: Public ------------------------------------------------

impl<F: SessionFactory> ConnectionPool<F> {
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn connection_count(&self) -> usize {
        self.inner.lock().handles.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn stats(&self) -> PoolStats {
        let (handles, current, pending, retiring) = {
            let inner = self.inner.lock();
            (
                inner.handles.clone(),
                inner.handles.len(),
                inner.pending,
                inner.retiring,
            )
        };

        PoolStats {
            endpoint: self.config.endpoint.clone(),
            current,
            max: self.config.max_connections,
            pending,
            retiring,
            created: self.counters.created.load(Ordering::Relaxed),
            evicted: self.counters.evicted.load(Ordering::Relaxed),
            creation_failures: self.counters.creation_failures.load(Ordering::Relaxed),
            identity_conflicts: self.counters.identity_conflicts.load(Ordering::Relaxed),
            sleep_wake_recoveries: self.counters.sleep_wake_recoveries.load(Ordering::Relaxed),
            handles: handles.iter().map(|h| h.stats()).collect(),
        }
    }

    pub async fn acquire_default(self: &Arc<Self>) -> Result<Arc<ConnectionHandle<F>>, GatewayError> {
        self.acquire(self.config.acquire_timeout).await
    }

    /// Reuses an idle healthy connection, or evicts the unhealthy ones and
    /// opens a new connection if there is room. At capacity it shares the
    /// least-loaded busy connection, or waits until `timeout` for a slot held
    /// by a connection being created or torn down.
    pub async fn acquire(
        self: &Arc<Self>,
        timeout: Duration,
    ) -> Result<Arc<ConnectionHandle<F>>, GatewayError> {
        let deadline = Instant::now() + timeout;
        self.check_sleep_wake();

        loop {
            let lookup = self.find_healthy().await?;
            if let Some(handle) = lookup.healthy {
                debug!("reusing connection {}", handle.identity());
                return Ok(handle);
            }

            let exhausted = match self.reserve_slot() {
                Ok(slot) => {
                    let handle = self.create(deadline).await;
                    drop(slot);
                    return handle;
                }
                Err(err @ GatewayError::ConnectionExhausted { .. }) => err,
                Err(err) => return Err(err),
            };

            if let Some(handle) = lookup.busy {
                debug!(
                    "pool at capacity, sharing busy connection {} ({} queued)",
                    handle.identity(),
                    handle.queued()
                );
                return Ok(handle);
            }

            if !self.wait_for_slot(deadline).await {
                return Err(exhausted);
            }
        }
    }

    /// Opens connections until `min_connections` are pooled.
    pub async fn warm_min(self: &Arc<Self>) {
        let current = self.connection_count();
        if current >= self.config.min_connections {
            return;
        }

        let target = self.config.min_connections - current;
        info!(
            "warming pool for {}: creating {target} connection(s)",
            self.config.endpoint
        );

        for _ in 0..target {
            let deadline = Instant::now() + self.config.acquire_timeout;
            let result = match self.reserve_slot() {
                Ok(_slot) => self.create(deadline).await.map(|_| ()),
                Err(err) => Err(err),
            };

            if let Err(err) = result {
                warn!("failed to warm connection to {}: {err}", self.config.endpoint);
                return;
            }
        }
    }

    /// Discards every connection when the wall clock jumped more than
    /// `sleep_wake_gap` since the previous pool-level check. Returns whether
    /// a recovery happened.
    pub fn check_sleep_wake(self: &Arc<Self>) -> bool {
        let now = SystemTime::now();

        let (gap, discarded) = {
            let mut inner = self.inner.lock();
            let gap = inner
                .last_check
                .replace(now)
                .and_then(|previous| now.duration_since(previous).ok());

            match gap {
                Some(gap) if gap > self.config.sleep_wake_gap && !inner.handles.is_empty() => {
                    (gap, std::mem::take(&mut inner.handles))
                }
                _ => return false,
            }
        };

        warn!(
            "{gap:?} since the previous pool check, possible sleep/wake: discarding {} connection(s)",
            discarded.len()
        );
        self.counters
            .sleep_wake_recoveries
            .fetch_add(1, Ordering::Relaxed);

        for handle in discarded {
            self.retire(handle, StopReason::Evicted);
        }
        true
    }

    /// Probes every idle connection and evicts the ones that fail. Returns
    /// how many were evicted.
    pub async fn evict_unhealthy(self: &Arc<Self>) -> usize {
        let candidates = self.inner.lock().handles.clone();
        let mut evicted = 0;

        for handle in candidates {
            if self.assess(&handle).await == Assessment::Unhealthy && self.evict(&handle) {
                evicted += 1;
            }
        }

        evicted
    }

    /// Periodic sleep/wake check and eviction until `token` is cancelled.
    pub async fn run_health_monitor(self: Arc<Self>, interval: Duration, token: CancellationToken) {
        info!("health monitor for {} running every {interval:?}", self.config.endpoint);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    if self.is_closed() {
                        break;
                    }
                    self.check_sleep_wake();
                    let evicted = self.evict_unhealthy().await;
                    if evicted > 0 {
                        info!("health monitor evicted {evicted} connection(s)");
                    }
                }
            }
        }

        debug!("health monitor for {} stopped", self.config.endpoint);
    }

    /// Stops every connection and refuses new acquisitions. Waits up to
    /// `grace` for sessions to be torn down; returns how many didn't make it.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        let handles = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            std::mem::take(&mut inner.handles)
        };
        self.slot_freed.notify_waiters();

        info!(
            "shutting down pool for {}: stopping {} connection(s)",
            self.config.endpoint,
            handles.len()
        );

        for handle in &handles {
            handle.shutdown(StopReason::Shutdown);
        }

        let deadline = Instant::now() + grace;
        let mut lingering = 0;
        for handle in handles {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if handle.wait_stopped(remaining).await {
                self.inner.lock().identities.release(handle.identity());
            } else {
                warn!(
                    "connection {} did not stop within {grace:?}",
                    handle.identity()
                );
                lingering += 1;
            }
        }

        lingering
    }
}

// -----------------------------------------------------------------------------
// ----- ConnectionPool: Private -----------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Assessment {
    Healthy,
    Busy,
    Unhealthy,
}

/// Outcome of one pass over the pooled connections.
struct Lookup<F: SessionFactory> {
    healthy: Option<Arc<ConnectionHandle<F>>>,
    /// Least-queued connection that is mid-call but not stuck.
    busy: Option<Arc<ConnectionHandle<F>>>,
}

impl<F: SessionFactory> ConnectionPool<F> {
    async fn find_healthy(self: &Arc<Self>) -> Result<Lookup<F>, GatewayError> {
        let candidates = {
            let inner = self.inner.lock();
            if inner.closed {
                return Err(GatewayError::ShuttingDown);
            }
            inner.handles.clone()
        };

        let mut lookup = Lookup {
            healthy: None,
            busy: None,
        };
        let mut unhealthy = Vec::new();

        for handle in candidates {
            match self.assess(&handle).await {
                Assessment::Healthy => {
                    lookup.healthy = Some(handle);
                    break;
                }
                Assessment::Busy => {
                    let lighter = lookup
                        .busy
                        .as_ref()
                        .is_none_or(|current| handle.queued() < current.queued());
                    if lighter {
                        lookup.busy = Some(handle);
                    }
                }
                Assessment::Unhealthy => unhealthy.push(handle),
            }
        }

        for handle in &unhealthy {
            self.evict(handle);
        }

        Ok(lookup)
    }

    /// Waits until a pending or retiring slot is given back. Returns true if
    /// the pool changed since the last lookup and is worth another look,
    /// false once `deadline` passes.
    async fn wait_for_slot(&self, deadline: Instant) -> bool {
        let notified = self.slot_freed.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        {
            let inner = self.inner.lock();
            let changed = inner.closed
                || !inner.handles.is_empty()
                || inner.occupied() < self.config.max_connections;
            if changed {
                return true;
            }
        }

        tokio::time::timeout_at(deadline, notified).await.is_ok()
    }

    /// A connection in the middle of a call is not probed, and is only shared
    /// when the pool is full, unless the call has been running longer than
    /// the request timeout.
    async fn assess(&self, handle: &ConnectionHandle<F>) -> Assessment {
        if let Some(busy_for) = handle.busy_for() {
            if busy_for < handle.config().request_timeout {
                return Assessment::Busy;
            }
            warn!(
                "connection {} stuck in a call for {busy_for:?}",
                handle.identity()
            );
            return Assessment::Unhealthy;
        }

        if handle.queued() > 0 && handle.is_worker_alive() {
            return Assessment::Busy;
        }

        if handle.is_healthy().await {
            Assessment::Healthy
        } else {
            Assessment::Unhealthy
        }
    }

    fn reserve_slot(&self) -> Result<PendingSlot<'_, F>, GatewayError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(GatewayError::ShuttingDown);
        }

        let current = inner.occupied();
        let max = self.config.max_connections;
        if current >= max {
            return Err(GatewayError::ConnectionExhausted { current, max });
        }

        inner.pending += 1;
        Ok(PendingSlot { pool: self })
    }

    async fn create(
        self: &Arc<Self>,
        deadline: Instant,
    ) -> Result<Arc<ConnectionHandle<F>>, GatewayError> {
        let attempts = self.config.identity_retry_attempts.max(1);
        let mut last_error: Option<SessionError> = None;

        for attempt in 1..=attempts {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(self.creation_failed(attempt - 1, last_error, "acquire timed out"));
            }

            let allocated = self.inner.lock().identities.allocate();
            let Some(identity) = allocated else {
                return Err(self.creation_failed(attempt, last_error, "no free connection identity"));
            };

            let handle = match ConnectionHandle::spawn(
                self.factory.clone(),
                identity,
                self.config.endpoint.clone(),
                self.config.handle.clone(),
                self.classifier.clone(),
            ) {
                Ok(handle) => Arc::new(handle),
                Err(err) => {
                    self.inner.lock().identities.release(identity);
                    return Err(self.creation_failed(attempt, Some(err), "worker spawn failed"));
                }
            };

            let started = match tokio::time::timeout(remaining, handle.wait_ready()).await {
                Ok(result) => result,
                Err(_) => Err(SessionError::transport("acquire timed out while connecting")),
            };

            let err = match started {
                Ok(()) => return self.admit(handle),
                Err(err) => err,
            };

            self.retire(handle, StopReason::Shutdown);

            if !ErrorClassifier::is_identity_conflict(&err.message) {
                return Err(self.creation_failed(attempt, Some(err), "connect failed"));
            }

            self.counters
                .identity_conflicts
                .fetch_add(1, Ordering::Relaxed);
            warn!(
                "identity {identity} already in use on {} (attempt {attempt}/{attempts}), trying the next one",
                self.config.endpoint
            );
            last_error = Some(err);

            if attempt < attempts {
                let pause = self.retry_backoff().min(deadline.saturating_duration_since(Instant::now()));
                tokio::time::sleep(pause).await;
            }
        }

        Err(self.creation_failed(attempts, last_error, "identity conflicts"))
    }

    fn admit(
        self: &Arc<Self>,
        handle: Arc<ConnectionHandle<F>>,
    ) -> Result<Arc<ConnectionHandle<F>>, GatewayError> {
        {
            let mut inner = self.inner.lock();
            if !inner.closed {
                inner.handles.push(handle.clone());
                self.counters.created.fetch_add(1, Ordering::Relaxed);
                info!(
                    "connection {} added to pool ({}/{})",
                    handle.identity(),
                    inner.handles.len(),
                    self.config.max_connections
                );
                return Ok(handle);
            }
        }

        self.retire(handle, StopReason::Shutdown);
        Err(GatewayError::ShuttingDown)
    }

    fn creation_failed(
        &self,
        attempts: u32,
        last_error: Option<SessionError>,
        context: &str,
    ) -> GatewayError {
        self.counters
            .creation_failures
            .fetch_add(1, Ordering::Relaxed);

        let reason = match last_error {
            Some(err) => format!("{context}: {err}"),
            None => context.to_string(),
        };

        GatewayError::ConnectionCreationFailed { attempts, reason }
    }

    fn retry_backoff(&self) -> Duration {
        let base = self.config.identity_retry_backoff;
        let jitter_ms = (base.as_millis() as u64) / 2;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }

    /// Removes `handle` from the pool and retires it. Returns false if it
    /// was already gone.
    fn evict(self: &Arc<Self>, handle: &Arc<ConnectionHandle<F>>) -> bool {
        {
            let mut inner = self.inner.lock();
            let Some(index) = inner.handles.iter().position(|h| Arc::ptr_eq(h, handle)) else {
                return false;
            };
            inner.handles.swap_remove(index);
        }

        self.counters.evicted.fetch_add(1, Ordering::Relaxed);
        info!("evicting connection {}", handle.identity());
        self.retire(handle.clone(), StopReason::Evicted);
        true
    }

    /// Stops a connection that is no longer pooled. Its identity stays
    /// reserved, and its slot counted, until the worker has torn down the
    /// session.
    fn retire(self: &Arc<Self>, handle: Arc<ConnectionHandle<F>>, reason: StopReason) {
        handle.shutdown(reason);

        // Idle-stopped or failed: the session is already gone.
        if !handle.is_worker_alive() {
            self.inner.lock().identities.release(handle.identity());
            self.slot_freed.notify_waiters();
            debug!("connection {} already stopped; identity released", handle.identity());
            return;
        }

        self.inner.lock().retiring += 1;

        let pool = Arc::clone(self);
        tokio::spawn(async move {
            handle.stopped().await;
            pool.finish_retire(handle.identity());
        });
    }

    fn finish_retire(&self, identity: ConnectionIdentity) {
        {
            let mut inner = self.inner.lock();
            inner.retiring = inner.retiring.saturating_sub(1);
            inner.identities.release(identity);
        }
        self.slot_freed.notify_waiters();
        debug!("connection {identity} torn down; identity released");
    }
}

// -----------------------------------------------------------------------------
// ----- PendingSlot -----------------------------------------------------------

struct PendingSlot<'a, F: SessionFactory> {
    pool: &'a ConnectionPool<F>,
}

impl<F: SessionFactory> Drop for PendingSlot<'_, F> {
    fn drop(&mut self) {
        {
            let mut inner = self.pool.inner.lock();
            inner.pending = inner.pending.saturating_sub(1);
        }
        self.pool.slot_freed.notify_waiters();
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::session::GatewaySession;

    struct Offline;

    impl GatewaySession for Offline {
        fn connect(
            &mut self,
            _endpoint: &Endpoint,
            _identity: ConnectionIdentity,
            _timeout: Duration,
        ) -> Result<(), SessionError> {
            Err(SessionError::transport("connection refused"))
        }
        fn disconnect(&mut self) {}
        fn is_connected(&self) -> bool {
            false
        }
        fn probe(&mut self, _timeout: Duration) -> Result<(), SessionError> {
            Err(SessionError::transport("offline"))
        }
    }

    struct OfflineFactory;

    impl SessionFactory for OfflineFactory {
        type Session = Offline;

        fn create(&self, _identity: ConnectionIdentity) -> Offline {
            Offline
        }
    }

    fn pool(max_connections: usize) -> ConnectionPool<OfflineFactory> {
        ConnectionPool::new(
            Arc::new(OfflineFactory),
            Arc::new(ErrorClassifier::new()),
            PoolConfig {
                max_connections,
                ..PoolConfig::default()
            },
        )
    }

    #[test]
    fn capacity_counts_pending_and_retiring() {
        let pool = pool(2);

        let slot = pool.reserve_slot().ok().unwrap();
        pool.inner.lock().retiring = 1;

        match pool.reserve_slot() {
            Err(GatewayError::ConnectionExhausted { current, max }) => {
                assert_eq!((current, max), (2, 2));
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("slot reserved past capacity"),
        }

        drop(slot);
        assert_eq!(pool.inner.lock().pending, 0);
        assert!(pool.reserve_slot().is_ok());
    }

    #[test]
    fn zero_max_connections_means_one() {
        assert_eq!(pool(0).config().max_connections, 1);
    }

    #[test]
    fn retry_backoff_stays_within_jitter() {
        let pool = pool(1);
        let base = pool.config().identity_retry_backoff;

        for _ in 0..50 {
            let pause = pool.retry_backoff();
            assert!(pause >= base && pause <= base + base / 2, "{pause:?}");
        }
    }

    #[tokio::test]
    async fn failed_creation_frees_its_slot_and_identity() {
        let pool = Arc::new(pool(1));

        let err = pool.acquire(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::ConnectionCreationFailed { attempts: 1, .. }
        ));
        assert_eq!(pool.stats().creation_failures, 1);

        for _ in 0..200 {
            let inner = pool.inner.lock();
            if inner.retiring == 0 && inner.identities.reserved() == 0 {
                assert_eq!(inner.pending, 0);
                return;
            }
            drop(inner);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("identity never released");
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
