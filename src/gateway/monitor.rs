use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde::Serialize;

use super::balancer::LoadBalancer;
use super::observability::Metrics;
use super::Clock;

/// Gauges are recomputed from counter deltas at this cadence.
pub const SAMPLE_INTERVAL_MS: i64 = 5_000;
/// Bounded history per series (~10 minutes at the default cadence).
const MAX_POINTS: usize = 120;

#[derive(Clone, Copy, Debug, Serialize)]
pub struct MetricPoint {
    pub ts_ms: i64,
    pub value: f64,
}

#[derive(Clone, Debug, Serialize)]
pub struct FailureReasonStat {
    pub reason: &'static str,
    pub count: u64,
    pub ratio: f64,
}

/// Point-in-time monitoring view: current gauges, their recent history and
/// the all-time failure breakdown.
#[derive(Clone, Debug, Serialize)]
pub struct MonitorSnapshot {
    pub qps: f64,
    pub success_rate: f64,
    pub failure_rate: f64,
    pub token_throughput: f64,
    pub resource_usage: f64,
    pub qps_series: Vec<MetricPoint>,
    pub success_rate_series: Vec<MetricPoint>,
    pub failure_rate_series: Vec<MetricPoint>,
    pub token_throughput_series: Vec<MetricPoint>,
    pub resource_usage_series: Vec<MetricPoint>,
    pub failure_reasons: Vec<FailureReasonStat>,
}

#[derive(Debug)]
struct SamplerState {
    last_sample_ms: i64,
    last_total: u64,
    last_success: u64,
    last_failed: u64,
    last_tokens: u64,
    qps: f64,
    success_rate: f64,
    failure_rate: f64,
    token_throughput: f64,
    resource_usage: f64,
    qps_series: VecDeque<MetricPoint>,
    success_rate_series: VecDeque<MetricPoint>,
    failure_rate_series: VecDeque<MetricPoint>,
    token_throughput_series: VecDeque<MetricPoint>,
    resource_usage_series: VecDeque<MetricPoint>,
}

impl SamplerState {
    fn new(now_ms: i64) -> Self {
        Self {
            last_sample_ms: now_ms,
            last_total: 0,
            last_success: 0,
            last_failed: 0,
            last_tokens: 0,
            qps: 0.0,
            success_rate: 1.0,
            failure_rate: 0.0,
            token_throughput: 0.0,
            resource_usage: 0.0,
            qps_series: VecDeque::new(),
            success_rate_series: VecDeque::new(),
            failure_rate_series: VecDeque::new(),
            token_throughput_series: VecDeque::new(),
            resource_usage_series: VecDeque::new(),
        }
    }
}

/// Derives rate gauges from the request counters and the balancer's budget
/// headroom. Sampling runs off the request path on a background tick; reads
/// copy the current state.
pub struct GatewayMonitor {
    metrics: Arc<Metrics>,
    balancer: Arc<LoadBalancer>,
    clock: Arc<dyn Clock>,
    state: Mutex<SamplerState>,
}

impl GatewayMonitor {
    pub fn new(metrics: Arc<Metrics>, balancer: Arc<LoadBalancer>, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_millis();
        Self {
            metrics,
            balancer,
            clock,
            state: Mutex::new(SamplerState::new(now)),
        }
    }

    /// Takes one sample if at least the sample interval elapsed; otherwise a
    /// no-op. Returns whether a sample was recorded.
    pub fn sample(&self) -> bool {
        let now = self.clock.now_millis();
        let mut guard = self.state.lock().expect("monitor lock poisoned");
        let state = &mut *guard;
        if now - state.last_sample_ms < SAMPLE_INTERVAL_MS {
            return false;
        }
        let interval_sec = ((now - state.last_sample_ms) as f64 / 1000.0).max(1.0);

        let snapshot = self.metrics.snapshot();
        let delta_total = snapshot.total_requests.saturating_sub(state.last_total);
        let delta_success = snapshot.successful_requests.saturating_sub(state.last_success);
        let delta_failed = snapshot.failed_requests.saturating_sub(state.last_failed);
        let delta_tokens = snapshot.estimated_tokens.saturating_sub(state.last_tokens);

        state.qps = delta_total as f64 / interval_sec;
        state.token_throughput = delta_tokens as f64 / interval_sec;
        if delta_total > 0 {
            state.success_rate = delta_success as f64 / delta_total as f64;
            state.failure_rate = delta_failed as f64 / delta_total as f64;
        } else {
            state.success_rate = 1.0;
            state.failure_rate = 0.0;
        }
        state.resource_usage = self.resource_usage();

        push_point(&mut state.qps_series, now, state.qps);
        push_point(&mut state.success_rate_series, now, state.success_rate);
        push_point(&mut state.failure_rate_series, now, state.failure_rate);
        push_point(&mut state.token_throughput_series, now, state.token_throughput);
        push_point(&mut state.resource_usage_series, now, state.resource_usage);

        state.last_sample_ms = now;
        state.last_total = snapshot.total_requests;
        state.last_success = snapshot.successful_requests;
        state.last_failed = snapshot.failed_requests;
        state.last_tokens = snapshot.estimated_tokens;
        true
    }

    /// Fraction of the fleet's minute budget currently committed, the worse
    /// of the RPM and TPM dimensions.
    fn resource_usage(&self) -> f64 {
        let stats = self.balancer.stats();
        let mut total_rpm = 0i64;
        let mut total_tpm = 0i64;
        for instance in self.balancer.instances() {
            if !instance.config().active {
                continue;
            }
            total_rpm += instance.effective_rpm_limit().max(0);
            total_tpm += instance.effective_tpm_limit().max(0);
        }
        let rpm_usage = if total_rpm <= 0 {
            0.0
        } else {
            1.0 - stats.available_rpm as f64 / total_rpm as f64
        };
        let tpm_usage = if total_tpm <= 0 {
            0.0
        } else {
            1.0 - stats.available_tpm as f64 / total_tpm as f64
        };
        clamp01(rpm_usage.max(tpm_usage))
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        let metrics = self.metrics.snapshot();
        let total_failed = metrics.failed_requests;
        let failure_reasons = metrics
            .failures_by_reason
            .iter()
            .map(|(reason, count)| FailureReasonStat {
                reason,
                count: *count,
                ratio: if total_failed > 0 {
                    *count as f64 / total_failed as f64
                } else {
                    0.0
                },
            })
            .collect();

        let state = self.state.lock().expect("monitor lock poisoned");
        MonitorSnapshot {
            qps: state.qps,
            success_rate: state.success_rate,
            failure_rate: state.failure_rate,
            token_throughput: state.token_throughput,
            resource_usage: state.resource_usage,
            qps_series: state.qps_series.iter().copied().collect(),
            success_rate_series: state.success_rate_series.iter().copied().collect(),
            failure_rate_series: state.failure_rate_series.iter().copied().collect(),
            token_throughput_series: state.token_throughput_series.iter().copied().collect(),
            resource_usage_series: state.resource_usage_series.iter().copied().collect(),
            failure_reasons,
        }
    }

    /// Clears gauges and history; the underlying request counters keep
    /// counting, the sampler baselines are re-anchored to their current
    /// values so the next delta starts clean.
    pub fn reset(&self) {
        let snapshot = self.metrics.snapshot();
        let now = self.clock.now_millis();
        let mut state = self.state.lock().expect("monitor lock poisoned");
        *state = SamplerState::new(now);
        state.last_total = snapshot.total_requests;
        state.last_success = snapshot.successful_requests;
        state.last_failed = snapshot.failed_requests;
        state.last_tokens = snapshot.estimated_tokens;
        tracing::info!("monitor gauges reset");
    }
}

fn push_point(series: &mut VecDeque<MetricPoint>, ts_ms: i64, value: f64) {
    series.push_back(MetricPoint { ts_ms, value });
    while series.len() > MAX_POINTS {
        series.pop_front();
    }
}

fn clamp01(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}
