#![allow(dead_code)]

use parking_lot::{Condvar, Mutex};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use gatelink::classifier::ErrorClassifier;
use gatelink::gateway::{
    ConnectionIdentity, Endpoint, GatewaySession, HandleConfig, PoolConfig, SessionError,
    SessionFactory,
};

// -----------------------------------------------------------------------------
// ----- Script ----------------------------------------------------------------

/// Behaviour shared by every fake session a factory creates. Tests flip these
/// knobs to make the "gateway" misbehave.
#[derive(Default)]
pub struct Script {
    /// Errors returned by the next connects, in order.
    connect_failures: Mutex<VecDeque<SessionError>>,
    /// Every connect fails while set.
    refuse_connects: AtomicBool,
    /// Identities the gateway considers already in use.
    conflicting: Mutex<HashSet<u32>>,
    /// Identities whose transport died: probes and calls fail.
    dead: Mutex<HashSet<u32>>,
    /// `is_connected` answers this instead of the truth when set.
    connected_lie: Mutex<Option<bool>>,

    disconnect_blocked: Mutex<bool>,
    disconnect_released: Condvar,

    pub connects: AtomicU64,
    pub disconnects: AtomicU64,
    pub probes: AtomicU64,
    pub calls: AtomicU64,
    pub compensations: AtomicU64,
    pub disconnected_ids: Mutex<Vec<u32>>,

    active_calls: AtomicUsize,
    pub max_active_calls: AtomicUsize,
}

impl Script {
    pub fn fail_next_connect(&self, err: SessionError) {
        self.connect_failures.lock().push_back(err);
    }

    pub fn refuse_connects(&self, refuse: bool) {
        self.refuse_connects.store(refuse, Ordering::SeqCst);
    }

    pub fn conflict_on(&self, identity: u32) {
        self.conflicting.lock().insert(identity);
    }

    pub fn kill(&self, identity: ConnectionIdentity) {
        self.dead.lock().insert(identity.value());
    }

    pub fn lie_connected(&self, answer: Option<bool>) {
        *self.connected_lie.lock() = answer;
    }

    pub fn block_disconnects(&self) {
        *self.disconnect_blocked.lock() = true;
    }

    pub fn release_disconnects(&self) {
        *self.disconnect_blocked.lock() = false;
        self.disconnect_released.notify_all();
    }

    pub fn disconnects(&self) -> u64 {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }

    fn is_dead(&self, identity: u32) -> bool {
        self.dead.lock().contains(&identity)
    }
}

// -----------------------------------------------------------------------------
// ----- FakeFactory -----------------------------------------------------------

#[derive(Clone, Default)]
pub struct FakeFactory {
    pub script: Arc<Script>,
}

impl FakeFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl SessionFactory for FakeFactory {
    type Session = FakeSession;

    fn create(&self, identity: ConnectionIdentity) -> FakeSession {
        FakeSession {
            identity: identity.value(),
            connected: false,
            script: self.script.clone(),
        }
    }
}

// -----------------------------------------------------------------------------
// ----- FakeSession -----------------------------------------------------------

pub struct FakeSession {
    pub identity: u32,
    connected: bool,
    script: Arc<Script>,
}

impl FakeSession {
    /// A call that takes `latency` and returns the session's identity.
    pub fn work(&mut self, latency: Duration) -> Result<u32, SessionError> {
        let script = &self.script;
        script.calls.fetch_add(1, Ordering::SeqCst);

        let active = script.active_calls.fetch_add(1, Ordering::SeqCst) + 1;
        script.max_active_calls.fetch_max(active, Ordering::SeqCst);
        thread::sleep(latency);
        script.active_calls.fetch_sub(1, Ordering::SeqCst);

        if !self.connected || script.is_dead(self.identity) {
            return Err(SessionError::transport("socket closed"));
        }
        Ok(self.identity)
    }

    /// Stands in for a remote "stop" request after a cancelled call.
    pub fn stop_subscription(&mut self) -> Result<(), SessionError> {
        self.script.compensations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl GatewaySession for FakeSession {
    fn connect(
        &mut self,
        _endpoint: &Endpoint,
        identity: ConnectionIdentity,
        _timeout: Duration,
    ) -> Result<(), SessionError> {
        let script = &self.script;
        script.connects.fetch_add(1, Ordering::SeqCst);

        if let Some(err) = script.connect_failures.lock().pop_front() {
            return Err(err);
        }
        if script.refuse_connects.load(Ordering::SeqCst) {
            return Err(SessionError::transport("connection refused"));
        }
        if script.conflicting.lock().contains(&identity.value()) {
            return Err(SessionError::gateway(
                326,
                "Unable to connect as the client id is already in use. Retry with a unique client id.",
            ));
        }

        self.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) {
        let script = &self.script;

        let mut blocked = script.disconnect_blocked.lock();
        while *blocked {
            script.disconnect_released.wait(&mut blocked);
        }
        drop(blocked);

        self.connected = false;
        script.disconnects.fetch_add(1, Ordering::SeqCst);
        script.disconnected_ids.lock().push(self.identity);
    }

    fn is_connected(&self) -> bool {
        match *self.script.connected_lie.lock() {
            Some(answer) => answer,
            None => self.connected,
        }
    }

    fn probe(&mut self, _timeout: Duration) -> Result<(), SessionError> {
        self.script.probes.fetch_add(1, Ordering::SeqCst);

        if !self.connected || self.script.is_dead(self.identity) {
            return Err(SessionError::transport("probe got no answer"));
        }
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// ----- Configs ---------------------------------------------------------------

pub fn fast_handle_config() -> HandleConfig {
    HandleConfig {
        idle_timeout: Duration::from_secs(60),
        request_timeout: Duration::from_secs(2),
        connect_timeout: Duration::from_secs(1),
        probe_timeout: Duration::from_millis(500),
        queue_capacity: 16,
        poll_interval: Duration::from_millis(20),
        sleep_wake_gap: Duration::from_secs(120),
    }
}

pub fn fast_pool_config(max_connections: usize) -> PoolConfig {
    PoolConfig {
        max_connections,
        acquire_timeout: Duration::from_secs(5),
        identity_retry_backoff: Duration::from_millis(10),
        handle: fast_handle_config(),
        ..PoolConfig::default()
    }
}

pub fn classifier() -> Arc<ErrorClassifier> {
    Arc::new(ErrorClassifier::new())
}

/// Polls `cond` every 10ms for up to `limit`.
pub async fn eventually(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
