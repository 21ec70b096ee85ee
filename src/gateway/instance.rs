use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use serde::{Deserialize, Serialize};

use super::config::DEFAULT_POOL_KEY;

pub type InstanceId = i64;

/// Consecutive failures that open the circuit.
const CIRCUIT_OPEN_FAILURES: i64 = 3;

/// One configured backend endpoint as the instance store hands it over.
#[derive(Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub id: InstanceId,
    #[serde(default)]
    pub provider_name: String,
    pub model_name: String,
    pub url: String,
    pub api_key: String,
    /// JSON request template with `$placeholder` values; empty means the
    /// minimal default payload.
    #[serde(default)]
    pub request_template: String,
    #[serde(default)]
    pub response_request_id_path: String,
    #[serde(default)]
    pub response_content_path: String,
    #[serde(default)]
    pub response_seq_path: String,
    #[serde(default)]
    pub response_raw_enabled: bool,
    #[serde(default)]
    pub rpm_limit: i64,
    #[serde(default)]
    pub tpm_limit: i64,
    /// Legacy per-second cap, only consulted when `rpm_limit` is unset.
    #[serde(default)]
    pub max_qps: i64,
    #[serde(default)]
    pub pool_key: String,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl std::fmt::Debug for InstanceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceConfig")
            .field("id", &self.id)
            .field("provider_name", &self.provider_name)
            .field("model_name", &self.model_name)
            .field("url", &self.url)
            .field("api_key", &"<redacted>")
            .field("pool_key", &self.pool_key)
            .field("active", &self.active)
            .finish()
    }
}

/// A configured endpoint plus its transient runtime counters. Configuration
/// is immutable for the lifetime of the wrapper; counters are atomics shared
/// across every request touching the instance.
#[derive(Debug)]
pub struct ModelInstance {
    config: InstanceConfig,
    request_count: AtomicI64,
    failure_count: AtomicI64,
    total_latency_ms: AtomicI64,
    last_used_ms: AtomicI64,
    last_failure_ms: AtomicI64,
    last_heartbeat_ms: AtomicI64,
    circuit_open: AtomicBool,
}

/// Runtime counters captured before a refresh and re-applied to the matching
/// incoming instance so reloads do not reset circuit and usage state.
#[derive(Clone, Copy, Debug, Default)]
pub struct RuntimeSnapshot {
    pub request_count: i64,
    pub failure_count: i64,
    pub total_latency_ms: i64,
    pub last_used_ms: i64,
    pub last_failure_ms: i64,
    pub last_heartbeat_ms: i64,
    pub circuit_open: bool,
}

impl ModelInstance {
    pub fn new(config: InstanceConfig, now_ms: i64) -> Self {
        Self {
            config,
            request_count: AtomicI64::new(0),
            failure_count: AtomicI64::new(0),
            total_latency_ms: AtomicI64::new(0),
            last_used_ms: AtomicI64::new(now_ms),
            last_failure_ms: AtomicI64::new(0),
            last_heartbeat_ms: AtomicI64::new(0),
            circuit_open: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    pub fn id(&self) -> InstanceId {
        self.config.id
    }

    pub fn name(&self) -> String {
        format!("{}-{}", self.config.provider_name, self.config.model_name)
    }

    pub fn pool_key(&self) -> &str {
        let key = self.config.pool_key.trim();
        if key.is_empty() { DEFAULT_POOL_KEY } else { key }
    }

    pub fn effective_rpm_limit(&self) -> i64 {
        if self.config.rpm_limit > 0 {
            return self.config.rpm_limit;
        }
        if self.config.max_qps > 0 {
            return self.config.max_qps * 60;
        }
        600
    }

    pub fn effective_tpm_limit(&self) -> i64 {
        if self.config.tpm_limit > 0 {
            self.config.tpm_limit
        } else {
            600_000
        }
    }

    /// Healthy = configured active and circuit closed.
    pub fn is_healthy(&self) -> bool {
        self.config.active && !self.circuit_open.load(Ordering::Relaxed)
    }

    pub fn is_circuit_open(&self) -> bool {
        self.circuit_open.load(Ordering::Relaxed)
    }

    /// A success anywhere closes the circuit and clears the failure streak.
    pub fn record_success(&self, latency_ms: i64, now_ms: i64) {
        self.circuit_open.store(false, Ordering::Relaxed);
        self.failure_count.store(0, Ordering::Relaxed);
        self.request_count.fetch_add(1, Ordering::Relaxed);
        self.total_latency_ms
            .fetch_add(latency_ms.max(0), Ordering::Relaxed);
        self.last_used_ms.store(now_ms, Ordering::Relaxed);
        self.last_heartbeat_ms.store(now_ms, Ordering::Relaxed);
    }

    pub fn record_failure(&self, now_ms: i64) {
        let failures = self.failure_count.fetch_add(1, Ordering::Relaxed) + 1;
        self.last_failure_ms.store(now_ms, Ordering::Relaxed);
        if failures >= CIRCUIT_OPEN_FAILURES {
            self.circuit_open.store(true, Ordering::Relaxed);
        }
    }

    pub fn request_count(&self) -> i64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub fn failure_count(&self) -> i64 {
        self.failure_count.load(Ordering::Relaxed)
    }

    pub fn total_latency_ms(&self) -> i64 {
        self.total_latency_ms.load(Ordering::Relaxed)
    }

    pub fn last_used_ms(&self) -> i64 {
        self.last_used_ms.load(Ordering::Relaxed)
    }

    /// Best-effort read of the counters; fields are loaded independently so
    /// the composite may straddle a concurrent update.
    pub fn snapshot(&self) -> RuntimeSnapshot {
        RuntimeSnapshot {
            request_count: self.request_count.load(Ordering::Relaxed),
            failure_count: self.failure_count.load(Ordering::Relaxed),
            total_latency_ms: self.total_latency_ms.load(Ordering::Relaxed),
            last_used_ms: self.last_used_ms.load(Ordering::Relaxed),
            last_failure_ms: self.last_failure_ms.load(Ordering::Relaxed),
            last_heartbeat_ms: self.last_heartbeat_ms.load(Ordering::Relaxed),
            circuit_open: self.circuit_open.load(Ordering::Relaxed),
        }
    }

    pub fn restore(&self, snapshot: &RuntimeSnapshot) {
        self.request_count
            .store(snapshot.request_count, Ordering::Relaxed);
        self.failure_count
            .store(snapshot.failure_count, Ordering::Relaxed);
        self.total_latency_ms
            .store(snapshot.total_latency_ms, Ordering::Relaxed);
        self.last_used_ms.store(snapshot.last_used_ms, Ordering::Relaxed);
        self.last_failure_ms
            .store(snapshot.last_failure_ms, Ordering::Relaxed);
        self.last_heartbeat_ms
            .store(snapshot.last_heartbeat_ms, Ordering::Relaxed);
        self.circuit_open
            .store(snapshot.circuit_open, Ordering::Relaxed);
    }
}
