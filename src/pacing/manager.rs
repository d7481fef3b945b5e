use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::call_class::CallClass;
use super::state::{PaceLimits, RateLimitState};

// -----------------------------------------------------------------------------
// ----- Constants -------------------------------------------------------------

const LONG_WAIT: Duration = Duration::from_secs(10);

// -----------------------------------------------------------------------------
// ----- PaceStats -------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaceStats {
    pub calls_in_window: usize,
    pub heavy_weight_in_window: u32,
    pub tracked_resources: usize,
    pub recorded_calls: u64,
    pub delayed_calls: u64,
    pub total_wait: Duration,
}

// -----------------------------------------------------------------------------
// ----- PaceManager -----------------------------------------------------------

/// Gate in front of every gateway call.
///
/// The constraints depend on each other, so the check and the record of a
/// call happen under one lock. The lock is never held while waiting: a
/// caller that has to wait sleeps, then checks again from scratch.
#[derive(Debug)]
pub struct PaceManager {
    state: Mutex<RateLimitState>,
    recorded: AtomicU64,
    delayed: AtomicU64,
    waited_ms: AtomicU64,
}

// -----------------------------------------------------------------------------
// ----- PaceManager: Static ---------------------------------------------------

impl PaceManager {
    pub fn new(limits: PaceLimits) -> Self {
        Self {
            state: Mutex::new(RateLimitState::new(limits)),
            recorded: AtomicU64::new(0),
            delayed: AtomicU64::new(0),
            waited_ms: AtomicU64::new(0),
        }
    }
}

impl Default for PaceManager {
    fn default() -> Self {
        Self::new(PaceLimits::default())
    }
}

// -----------------------------------------------------------------------------
// ----- PaceManager: Public ---------------------------------------------------

impl PaceManager {
    /// Suspends the calling task until `call` fits every limit, then records
    /// it. Returns how long the caller waited.
    pub async fn wait_if_needed(&self, call: &CallClass) -> Duration {
        let mut waited = Duration::ZERO;

        loop {
            let wait = self.try_record(call);
            if wait.is_zero() {
                self.finish(waited);
                return waited;
            }

            self.log_wait(call, wait);
            tokio::time::sleep(wait).await;
            waited += wait;
        }
    }

    /// Thread-style counterpart of [`Self::wait_if_needed`].
    pub fn wait_if_needed_blocking(&self, call: &CallClass) -> Duration {
        let mut waited = Duration::ZERO;

        loop {
            let wait = self.try_record(call);
            if wait.is_zero() {
                self.finish(waited);
                return waited;
            }

            self.log_wait(call, wait);
            std::thread::sleep(wait);
            waited += wait;
        }
    }

    /// Same computation as [`Self::wait_if_needed`] without recording.
    pub fn can_proceed(&self, call: &CallClass) -> (bool, Duration) {
        let wait = self.state.lock().required_wait(Instant::now(), call);
        (wait.is_zero(), wait)
    }

    pub fn limits(&self) -> PaceLimits {
        self.state.lock().limits().clone()
    }

    pub fn stats(&self) -> PaceStats {
        let state = self.state.lock();

        PaceStats {
            calls_in_window: state.calls_in_window(),
            heavy_weight_in_window: state.heavy_weight_in_window(),
            tracked_resources: state.tracked_resources(),
            recorded_calls: self.recorded.load(Ordering::Relaxed),
            delayed_calls: self.delayed.load(Ordering::Relaxed),
            total_wait: Duration::from_millis(self.waited_ms.load(Ordering::Relaxed)),
        }
    }
}

// -----------------------------------------------------------------------------
// ----- PaceManager: Private --------------------------------------------------

impl PaceManager {
    /// Records the call and returns zero, or returns the wait without
    /// touching the trackers.
    fn try_record(&self, call: &CallClass) -> Duration {
        let mut state = self.state.lock();
        let now = Instant::now();

        let wait = state.required_wait(now, call);
        if wait.is_zero() {
            state.record(now, call);
        }
        wait
    }

    fn finish(&self, waited: Duration) {
        self.recorded.fetch_add(1, Ordering::Relaxed);
        if !waited.is_zero() {
            self.delayed.fetch_add(1, Ordering::Relaxed);
            self.waited_ms
                .fetch_add(waited.as_millis() as u64, Ordering::Relaxed);
        }
    }

    fn log_wait(&self, call: &CallClass, wait: Duration) {
        let key = call.resource_key.as_deref().unwrap_or("-");
        if wait >= LONG_WAIT {
            warn!("pacing: holding heavy={} key={key} for {wait:?}", call.heavy);
        } else {
            debug!("pacing: holding heavy={} key={key} for {wait:?}", call.heavy);
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
