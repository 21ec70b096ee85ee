use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::Serialize;

/// Categorical failure reasons, surfaced on the metrics endpoint and mapped
/// to HTTP statuses at the edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureReason {
    BadRequest,
    DuplicateRequest,
    NoInstanceOrRateLimit,
    DownstreamError,
    ClientCancelled,
    UnexpectedError,
    RateLimitHint,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::BadRequest => "BAD_REQUEST",
            FailureReason::DuplicateRequest => "DUPLICATE_REQUEST",
            FailureReason::NoInstanceOrRateLimit => "NO_INSTANCE_OR_RATE_LIMIT",
            FailureReason::DownstreamError => "DOWNSTREAM_ERROR",
            FailureReason::ClientCancelled => "CLIENT_CANCELLED",
            FailureReason::UnexpectedError => "UNEXPECTED_ERROR",
            FailureReason::RateLimitHint => "RATE_LIMIT_HINT",
        }
    }

    const ALL: [FailureReason; 7] = [
        FailureReason::BadRequest,
        FailureReason::DuplicateRequest,
        FailureReason::NoInstanceOrRateLimit,
        FailureReason::DownstreamError,
        FailureReason::ClientCancelled,
        FailureReason::UnexpectedError,
        FailureReason::RateLimitHint,
    ];

    fn index(&self) -> usize {
        Self::ALL.iter().position(|reason| reason == self).unwrap_or(0)
    }
}

/// Request counters shared across the whole gateway. Plain atomics; snapshot
/// reads are best-effort.
#[derive(Debug, Default)]
pub struct Metrics {
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    estimated_tokens: AtomicU64,
    failures_by_reason: [AtomicU64; 7],
    inflight: AtomicI64,
}

#[derive(Clone, Debug, Serialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub estimated_tokens: u64,
    pub inflight: i64,
    pub failures_by_reason: BTreeMap<&'static str, u64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a request entering the gateway.
    pub fn on_request_start(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.inflight.fetch_add(1, Ordering::Relaxed);
    }

    /// Marks a request leaving the gateway, floor zero on the gauge.
    pub fn on_request_end(&self) {
        loop {
            let current = self.inflight.load(Ordering::Relaxed);
            if current <= 0 {
                return;
            }
            if self
                .inflight
                .compare_exchange(current, current - 1, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    pub fn record_success(&self, estimated_tokens: i64) {
        self.successful_requests.fetch_add(1, Ordering::Relaxed);
        self.estimated_tokens
            .fetch_add(estimated_tokens.max(0) as u64, Ordering::Relaxed);
    }

    pub fn record_failure(&self, reason: FailureReason) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
        self.failures_by_reason[reason.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn inflight(&self) -> i64 {
        self.inflight.load(Ordering::Relaxed)
    }

    pub fn failures_for(&self, reason: FailureReason) -> u64 {
        self.failures_by_reason[reason.index()].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut failures_by_reason = BTreeMap::new();
        for reason in FailureReason::ALL {
            let count = self.failures_by_reason[reason.index()].load(Ordering::Relaxed);
            if count > 0 {
                failures_by_reason.insert(reason.as_str(), count);
            }
        }
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successful_requests: self.successful_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            estimated_tokens: self.estimated_tokens.load(Ordering::Relaxed),
            inflight: self.inflight.load(Ordering::Relaxed),
            failures_by_reason,
        }
    }
}
