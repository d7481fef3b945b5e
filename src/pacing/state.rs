use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

use super::call_class::CallClass;

// -----------------------------------------------------------------------------
// ----- PaceLimits ------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaceLimits {
    /// Calls of any kind allowed inside `global_window`.
    pub max_calls_per_window: usize,
    pub global_window: Duration,

    /// Minimum gap between two heavy calls.
    pub heavy_min_spacing: Duration,

    /// Weighted heavy calls allowed inside `rolling_window`.
    pub rolling_max_weight: u32,
    pub rolling_window: Duration,

    /// Heavy calls per resource key allowed inside `resource_window`.
    pub resource_max_calls: usize,
    pub resource_window: Duration,

    /// Minimum gap between two heavy calls for the same resource key.
    pub duplicate_cooldown: Duration,
}

impl Default for PaceLimits {
    fn default() -> Self {
        Self {
            max_calls_per_window: 50,
            global_window: Duration::from_secs(1),
            heavy_min_spacing: Duration::from_secs(2),
            rolling_max_weight: 60,
            rolling_window: Duration::from_secs(600),
            resource_max_calls: 6,
            resource_window: Duration::from_secs(2),
            duplicate_cooldown: Duration::from_secs(15),
        }
    }
}

// -----------------------------------------------------------------------------
// ----- RateLimitState --------------------------------------------------------

/// The five pacing trackers. Not synchronized; [`super::PaceManager`] keeps
/// it behind one lock so a check and its record are applied as a unit.
#[derive(Debug)]
pub struct RateLimitState {
    limits: PaceLimits,

    recent_calls: VecDeque<Instant>,
    last_heavy: Option<Instant>,
    heavy_log: VecDeque<(Instant, u32)>,
    heavy_weight: u32,
    per_resource: HashMap<String, VecDeque<Instant>>,
    last_by_resource: HashMap<String, Instant>,
}

// -----------------------------------------------------------------------------
// ----- RateLimitState: Static ------------------------------------------------

impl RateLimitState {
    pub fn new(limits: PaceLimits) -> Self {
        Self {
            limits,
            recent_calls: VecDeque::new(),
            last_heavy: None,
            heavy_log: VecDeque::new(),
            heavy_weight: 0,
            per_resource: HashMap::new(),
            last_by_resource: HashMap::new(),
        }
    }
}

// -----------------------------------------------------------------------------
// ----- RateLimitState: Public ------------------------------------------------

impl RateLimitState {
    pub fn limits(&self) -> &PaceLimits {
        &self.limits
    }

    /// Longest wait any applicable constraint imposes on `call` at `now`.
    /// Prunes expired entries but records nothing.
    pub fn required_wait(&mut self, now: Instant, call: &CallClass) -> Duration {
        self.prune(now);

        let mut wait = self.global_wait(now);

        if call.heavy {
            wait = wait.max(self.spacing_wait(now));
            wait = wait.max(self.rolling_wait(now, call.weight()));

            if let Some(key) = call.heavy_key() {
                wait = wait.max(self.resource_wait(now, key));
                wait = wait.max(self.duplicate_wait(now, key));
            }
        }

        wait
    }

    /// Counts `call` at `now` against every tracker that applies to it.
    pub fn record(&mut self, now: Instant, call: &CallClass) {
        self.recent_calls.push_back(now);

        if !call.heavy {
            return;
        }

        self.last_heavy = Some(now);
        self.heavy_log.push_back((now, call.weight()));
        self.heavy_weight += call.weight();

        if let Some(key) = call.heavy_key() {
            self.per_resource
                .entry(key.to_string())
                .or_default()
                .push_back(now);
            self.last_by_resource.insert(key.to_string(), now);
        }
    }

    pub fn calls_in_window(&self) -> usize {
        self.recent_calls.len()
    }

    pub fn heavy_weight_in_window(&self) -> u32 {
        self.heavy_weight
    }

    pub fn tracked_resources(&self) -> usize {
        self.last_by_resource.len()
    }
}

// -----------------------------------------------------------------------------
// ----- RateLimitState: Private -----------------------------------------------

impl RateLimitState {
    fn global_wait(&self, now: Instant) -> Duration {
        if self.recent_calls.len() < self.limits.max_calls_per_window {
            return Duration::ZERO;
        }
        // Once the window is full, the call may go when enough of the oldest
        // entries have expired to make room.
        let excess = self.recent_calls.len() - self.limits.max_calls_per_window;
        match self.recent_calls.get(excess) {
            Some(ts) => until(now, *ts + self.limits.global_window),
            None => Duration::ZERO,
        }
    }

    fn spacing_wait(&self, now: Instant) -> Duration {
        match self.last_heavy {
            Some(last) => until(now, last + self.limits.heavy_min_spacing),
            None => Duration::ZERO,
        }
    }

    fn rolling_wait(&self, now: Instant, weight: u32) -> Duration {
        let max = self.limits.rolling_max_weight;
        if self.heavy_weight + weight <= max {
            return Duration::ZERO;
        }

        let mut remaining = self.heavy_weight;
        for (ts, entry_weight) in &self.heavy_log {
            remaining -= entry_weight;
            if remaining + weight <= max {
                return until(now, *ts + self.limits.rolling_window);
            }
        }

        // A single call heavier than the whole budget: wait for a clean window.
        match self.heavy_log.back() {
            Some((ts, _)) => until(now, *ts + self.limits.rolling_window),
            None => Duration::ZERO,
        }
    }

    fn resource_wait(&self, now: Instant, key: &str) -> Duration {
        let Some(log) = self.per_resource.get(key) else {
            return Duration::ZERO;
        };
        if log.len() < self.limits.resource_max_calls {
            return Duration::ZERO;
        }

        let excess = log.len() - self.limits.resource_max_calls;
        match log.get(excess) {
            Some(ts) => until(now, *ts + self.limits.resource_window),
            None => Duration::ZERO,
        }
    }

    fn duplicate_wait(&self, now: Instant, key: &str) -> Duration {
        match self.last_by_resource.get(key) {
            Some(last) => until(now, *last + self.limits.duplicate_cooldown),
            None => Duration::ZERO,
        }
    }

    fn prune(&mut self, now: Instant) {
        let limits = &self.limits;

        while let Some(ts) = self.recent_calls.front() {
            if !expired(now, *ts, limits.global_window) {
                break;
            }
            self.recent_calls.pop_front();
        }

        while let Some((ts, weight)) = self.heavy_log.front() {
            if !expired(now, *ts, limits.rolling_window) {
                break;
            }
            self.heavy_weight -= weight;
            self.heavy_log.pop_front();
        }

        self.per_resource.retain(|_, log| {
            while let Some(ts) = log.front() {
                if !expired(now, *ts, limits.resource_window) {
                    break;
                }
                log.pop_front();
            }
            !log.is_empty()
        });

        self.last_by_resource
            .retain(|_, last| !expired(now, *last, limits.duplicate_cooldown));
    }
}

// -----------------------------------------------------------------------------
// ----- Internal: Helpers -----------------------------------------------------

#[inline]
fn until(now: Instant, deadline: Instant) -> Duration {
    deadline.saturating_duration_since(now)
}

#[inline]
fn expired(now: Instant, ts: Instant, window: Duration) -> bool {
    now.saturating_duration_since(ts) >= window
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
