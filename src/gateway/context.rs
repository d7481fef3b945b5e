use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::pool::ConnectionPool;
use super::session::{SessionError, SessionFactory};
use crate::cancellation::{CancellationCoordinator, CancellationToken};
use crate::classifier::ErrorClassifier;
use crate::config::GatewayConfig;
use crate::errors::GatewayError;
use crate::pacing::{CallClass, PaceManager};

// -----------------------------------------------------------------------------
// ----- Constants -------------------------------------------------------------

const MONITOR_OPERATION: &str = "pool-health-monitor";
const SHUTDOWN_REASON: &str = "gateway shutting down";

// -----------------------------------------------------------------------------
// ----- GatewayContext --------------------------------------------------------

/// Everything a caller needs to talk to the gateway: one classifier, one
/// pacing budget, one cancellation coordinator and one pool. Built once at
/// startup and passed around explicitly.
pub struct GatewayContext<F: SessionFactory> {
    classifier: Arc<ErrorClassifier>,
    pace: Arc<PaceManager>,
    coordinator: Arc<CancellationCoordinator>,
    pool: Arc<ConnectionPool<F>>,
    health_check_interval: Duration,
    monitor_token: CancellationToken,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

// -----------------------------------------------------------------------------
// ----- GatewayContext: Static ------------------------------------------------

impl<F: SessionFactory> GatewayContext<F> {
    pub fn init(config: &GatewayConfig, factory: Arc<F>) -> Self {
        let classifier = Arc::new(ErrorClassifier::new().with_rules(config.error_codes.clone()));
        let pace = Arc::new(PaceManager::new(config.pacing.clone()));
        let coordinator = Arc::new(CancellationCoordinator::new());
        let pool = Arc::new(ConnectionPool::new(
            factory,
            classifier.clone(),
            config.pool.clone(),
        ));

        info!(
            "gateway context ready: endpoint={} max_connections={} known_codes={}",
            pool.config().endpoint,
            pool.config().max_connections,
            classifier.known_codes()
        );

        Self {
            classifier,
            pace,
            coordinator,
            pool,
            health_check_interval: config.health_check_interval,
            monitor_token: CancellationToken::new(MONITOR_OPERATION),
            monitor: Mutex::new(None),
        }
    }
}

// -----------------------------------------------------------------------------
// ----- GatewayContext: Public ------------------------------------------------

impl<F: SessionFactory> GatewayContext<F> {
    pub fn classifier(&self) -> &Arc<ErrorClassifier> {
        &self.classifier
    }

    pub fn pace(&self) -> &Arc<PaceManager> {
        &self.pace
    }

    pub fn coordinator(&self) -> &Arc<CancellationCoordinator> {
        &self.coordinator
    }

    pub fn pool(&self) -> &Arc<ConnectionPool<F>> {
        &self.pool
    }

    /// Starts the periodic pool health monitor. Does nothing if it's already
    /// running or the interval is zero.
    pub fn start_health_monitor(&self) {
        if self.health_check_interval.is_zero() {
            debug!("pool health monitor disabled");
            return;
        }

        let mut monitor = self.monitor.lock();
        if monitor.is_some() {
            return;
        }

        let pool = self.pool.clone();
        let token = self.monitor_token.clone();
        let interval = self.health_check_interval;
        *monitor = Some(tokio::spawn(pool.run_health_monitor(interval, token)));
    }

    /// Acquires a connection, waits for the pacing budget and runs `call`.
    pub async fn call<T, C>(&self, class: &CallClass, call: C) -> Result<T, GatewayError>
    where
        T: Send + 'static,
        C: FnOnce(&mut F::Session) -> Result<T, SessionError> + Send + 'static,
    {
        if self.coordinator.is_globally_cancelled() {
            return Err(GatewayError::ShuttingDown);
        }

        let handle = self.pool.acquire_default().await?;
        self.pace.wait_if_needed(class).await;
        handle.execute(call).await
    }

    /// Like [`Self::call`], registered under `operation_id` so it can be
    /// cancelled. Cancellation is observed before acquiring, during the
    /// pacing wait and before submitting; a call already running completes
    /// and is followed by `compensate`.
    pub async fn call_cancellable<T, C, K>(
        &self,
        operation_id: &str,
        class: &CallClass,
        call: C,
        compensate: K,
    ) -> Result<T, GatewayError>
    where
        T: Send + 'static,
        C: FnOnce(&mut F::Session) -> Result<T, SessionError> + Send + 'static,
        K: FnOnce(&mut F::Session) -> Result<(), SessionError> + Send + 'static,
    {
        self.coordinator
            .execute_with_cancellation(operation_id, |token| async move {
                token.check()?;
                let handle = self.pool.acquire_default().await?;

                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = self.pace.wait_if_needed(class) => {}
                }
                token.check()?;

                handle.execute_cancellable(&token, call, compensate).await
            })
            .await
    }

    pub fn cancel_operation(&self, operation_id: &str, reason: &str) -> bool {
        self.coordinator.cancel_operation(operation_id, reason)
    }

    /// Cancels every operation, stops the health monitor and shuts the pool
    /// down. Returns how many connections didn't stop within `grace`.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        info!("shutting down gateway context");

        self.coordinator.cancel_all(SHUTDOWN_REASON);
        self.monitor_token.cancel(SHUTDOWN_REASON);

        let monitor = self.monitor.lock().take();
        if let Some(monitor) = monitor {
            if let Err(err) = monitor.await {
                warn!("health monitor task failed: {err}");
            }
        }

        self.pool.shutdown(grace).await
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
