use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};

use serde::Serialize;

use super::config::{Algorithm, BalancerSettings};
use super::strategy::Strategy;

/// Lifecycle of a strategy runtime. ACTIVE serves traffic; DRAINING admits
/// nothing while in-flight work settles; RETIRED is terminal and never
/// observable through the admin surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuntimeState {
    Active,
    Draining,
    Retired,
}

impl RuntimeState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => RuntimeState::Active,
            1 => RuntimeState::Draining,
            _ => RuntimeState::Retired,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            RuntimeState::Active => 0,
            RuntimeState::Draining => 1,
            RuntimeState::Retired => 2,
        }
    }
}

/// One executing strategy bound to a pool: the strategy itself plus queue
/// gate, lifecycle state and reject accounting.
pub struct StrategyRuntime {
    pub runtime_id: String,
    pub algorithm: Algorithm,
    pub activated_at_ms: i64,
    pub strategy: Box<dyn Strategy>,
    state: AtomicU8,
    queue_depth: AtomicI64,
    queue_capacity: AtomicI64,
    reject_queue_full: AtomicU64,
    drain_since_ms: AtomicI64,
}

impl StrategyRuntime {
    pub fn new(
        runtime_id: String,
        algorithm: Algorithm,
        settings: &BalancerSettings,
        strategy: Box<dyn Strategy>,
        now_ms: i64,
    ) -> Self {
        Self {
            runtime_id,
            algorithm,
            activated_at_ms: now_ms,
            strategy,
            state: AtomicU8::new(RuntimeState::Active.as_u8()),
            queue_depth: AtomicI64::new(0),
            queue_capacity: AtomicI64::new(settings.queue_capacity.max(1)),
            reject_queue_full: AtomicU64::new(0),
            drain_since_ms: AtomicI64::new(0),
        }
    }

    pub fn state(&self) -> RuntimeState {
        RuntimeState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn mark_draining(&self, now_ms: i64) {
        self.state
            .store(RuntimeState::Draining.as_u8(), Ordering::SeqCst);
        self.drain_since_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn mark_retired(&self) {
        self.state
            .store(RuntimeState::Retired.as_u8(), Ordering::SeqCst);
    }

    /// CAS-increments the in-flight depth unless the configured capacity is
    /// already reached. The capacity is re-read from settings on every
    /// attempt so a settings change takes effect without a swap.
    pub fn try_enter_queue(&self, configured_capacity: i64) -> bool {
        let cap = configured_capacity.max(1);
        self.queue_capacity.store(cap, Ordering::SeqCst);
        loop {
            let current = self.queue_depth.load(Ordering::SeqCst);
            if current >= cap {
                return false;
            }
            if self
                .queue_depth
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// CAS-decrements the in-flight depth, never below zero.
    pub fn leave_queue(&self) {
        loop {
            let current = self.queue_depth.load(Ordering::SeqCst);
            if current <= 0 {
                return;
            }
            if self
                .queue_depth
                .compare_exchange(current, current - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return;
            }
        }
    }

    pub fn queue_depth(&self) -> i64 {
        self.queue_depth.load(Ordering::SeqCst)
    }

    pub fn queue_capacity(&self) -> i64 {
        self.queue_capacity.load(Ordering::SeqCst)
    }

    pub fn record_queue_full(&self) {
        self.reject_queue_full.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reject_queue_full(&self) -> u64 {
        self.reject_queue_full.load(Ordering::Relaxed)
    }

    pub fn drain_duration_ms(&self, now_ms: i64) -> Option<i64> {
        if self.state() != RuntimeState::Draining {
            return None;
        }
        let since = self.drain_since_ms.load(Ordering::SeqCst);
        if since > 0 { Some((now_ms - since).max(0)) } else { None }
    }
}
