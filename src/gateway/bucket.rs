use std::collections::VecDeque;
use std::sync::{Mutex, RwLock};

use super::config::{parse_csv_positive_ints, BalancerSettings};

/// Histogram samples required before boundaries may adapt.
const MIN_SAMPLES_FOR_ADAPTATION: usize = 32;
/// Floor for any bucket boundary.
const MIN_BOUNDARY_TOKENS: i64 = 64;

/// Classifies requests into token-size buckets and adapts the bucket
/// boundaries to the observed request distribution.
///
/// Boundary reads are a snapshot; the histogram and the boundary/weight swap
/// share one critical section so observers never see a half-applied update.
#[derive(Debug)]
pub struct BucketManager {
    active: RwLock<ActiveBuckets>,
    state: Mutex<HistogramState>,
}

#[derive(Debug, Clone)]
struct ActiveBuckets {
    ranges: Vec<i64>,
    weights: Vec<i64>,
}

#[derive(Debug)]
struct HistogramState {
    samples: VecDeque<i64>,
    last_boundary_update_ms: i64,
    last_observed_dist: Option<Vec<f64>>,
}

impl Default for BucketManager {
    fn default() -> Self {
        Self {
            active: RwLock::new(ActiveBuckets {
                ranges: vec![1024, 2048, 4096, 8192, 16384],
                weights: vec![30, 25, 20, 15, 10],
            }),
            state: Mutex::new(HistogramState {
                samples: VecDeque::new(),
                last_boundary_update_ms: 0,
                last_observed_dist: None,
            }),
        }
    }
}

impl BucketManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn init_from_settings(&self, settings: &BalancerSettings) {
        let count = settings.bucket_count.clamp(5, 6) as usize;
        let ranges = parse_bucket_ranges(settings, count);
        let weights = parse_bucket_weights(settings, count);
        let mut active = self.active.write().expect("bucket lock poisoned");
        active.ranges = ranges;
        active.weights = weights;
    }

    pub fn update_from_settings(&self, settings: &BalancerSettings) {
        self.init_from_settings(settings);
    }

    pub fn active_ranges(&self) -> Vec<i64> {
        self.active.read().expect("bucket lock poisoned").ranges.clone()
    }

    pub fn active_weights(&self) -> Vec<i64> {
        self.active.read().expect("bucket lock poisoned").weights.clone()
    }

    /// Lowest index whose upper bound covers `estimated_tokens`; the last
    /// bucket catches everything beyond the final boundary.
    pub fn resolve_bucket_index(&self, estimated_tokens: i64) -> usize {
        let active = self.active.read().expect("bucket lock poisoned");
        let tokens = estimated_tokens.max(1);
        for (index, upper) in active.ranges.iter().enumerate() {
            if tokens <= *upper {
                return index;
            }
        }
        active.ranges.len().saturating_sub(1)
    }

    /// Records one observation and, when dynamic bucketing is enabled, the
    /// histogram is warm and the adaptive interval has elapsed, recomputes
    /// boundaries from histogram quantiles. Returns the new boundaries and
    /// weights when an update happened.
    pub fn record_and_maybe_adapt(
        &self,
        estimated_tokens: i64,
        settings: &BalancerSettings,
        now_ms: i64,
    ) -> Option<(Vec<i64>, Vec<i64>)> {
        let mut guard = self.state.lock().expect("bucket lock poisoned");
        let state = &mut *guard;
        state.samples.push_back(estimated_tokens.max(1));
        let cap = settings.histogram_sample_size.max(1) as usize;
        while state.samples.len() > cap {
            state.samples.pop_front();
        }

        if !settings.dynamic_bucketing_enabled {
            return None;
        }
        if state.samples.len() < MIN_SAMPLES_FOR_ADAPTATION {
            return None;
        }

        let current_ranges = self.active.read().expect("bucket lock poisoned").ranges.clone();
        let interval_sec = compute_adaptive_interval_seconds(
            &state.samples,
            &current_ranges,
            &mut state.last_observed_dist,
            settings,
        );
        if now_ms - state.last_boundary_update_ms < interval_sec * 1000 {
            return None;
        }
        state.last_boundary_update_ms = now_ms;

        let mut sorted: Vec<i64> = state.samples.iter().copied().collect();
        sorted.sort_unstable();
        let count = settings.bucket_count.clamp(5, 6) as usize;
        let mut updated = Vec::with_capacity(count);
        let mut prev = MIN_BOUNDARY_TOKENS;
        let n = sorted.len();
        for i in 1..=count {
            let idx = ((n - 1) * i) / count;
            let value = sorted[idx.min(n - 1)].max(prev + 1);
            updated.push(value);
            prev = value;
        }
        let weights = parse_bucket_weights(settings, updated.len());

        let mut active = self.active.write().expect("bucket lock poisoned");
        active.ranges = updated.clone();
        active.weights = weights.clone();
        Some((updated, weights))
    }

    #[cfg(test)]
    fn histogram_len(&self) -> usize {
        self.state.lock().expect("bucket lock poisoned").samples.len()
    }
}

fn parse_bucket_ranges(settings: &BalancerSettings, count: usize) -> Vec<i64> {
    let mut ranges = parse_csv_positive_ints(&settings.bucket_ranges);
    if ranges.len() != count {
        ranges = default_ranges_by_context(settings.max_context_k, count);
    }
    ranges.sort_unstable();
    ranges
}

fn parse_bucket_weights(settings: &BalancerSettings, count: usize) -> Vec<i64> {
    let weights = parse_csv_positive_ints(&settings.bucket_weights);
    if weights.len() == count {
        weights
    } else {
        default_weights(count)
    }
}

/// Spreads the context budget linearly across the buckets, floored at 64.
fn default_ranges_by_context(max_context_k: i64, count: usize) -> Vec<i64> {
    let max_tokens = (max_context_k * 1024).max(1024);
    (1..=count as i64)
        .map(|i| ((max_tokens * i) / count as i64).max(MIN_BOUNDARY_TOKENS))
        .collect()
}

/// Even split of 100 across `count` buckets, remainder on the last.
fn default_weights(count: usize) -> Vec<i64> {
    let mut weights = Vec::with_capacity(count);
    let mut remain = 100i64;
    for i in 0..count {
        let w = if i == count - 1 {
            remain
        } else {
            (remain / (count - i) as i64).max(1)
        };
        weights.push(w);
        remain -= w;
    }
    weights
}

/// Scores how far the observed bucket distribution sits from the configured
/// target weights (0.7) and how much it drifted since the last look (0.3),
/// then maps the score linearly onto [min, max] seconds: a perfect, stable
/// fit refreshes slowly; mismatch or drift refreshes fast.
fn compute_adaptive_interval_seconds(
    samples: &VecDeque<i64>,
    ranges: &[i64],
    last_observed_dist: &mut Option<Vec<f64>>,
    settings: &BalancerSettings,
) -> i64 {
    let mut min_sec = settings.bucket_update_interval_min_seconds.clamp(3, 60);
    let mut max_sec = settings.bucket_update_interval_max_seconds.clamp(3, 60);
    if min_sec > max_sec {
        std::mem::swap(&mut min_sec, &mut max_sec);
    }
    if samples.is_empty() || ranges.is_empty() {
        return ((min_sec + max_sec) / 2).clamp(3, 60);
    }

    let bucket_count = ranges.len();
    let mut counts = vec![0usize; bucket_count];
    for sample in samples {
        let tokens = (*sample).max(1);
        let mut idx = 0;
        while idx < bucket_count && tokens > ranges[idx] {
            idx += 1;
        }
        counts[idx.min(bucket_count - 1)] += 1;
    }
    let total: usize = counts.iter().sum();
    if total == 0 {
        return 20;
    }
    let observed: Vec<f64> = counts
        .iter()
        .map(|count| *count as f64 / total as f64)
        .collect();

    let weights = parse_bucket_weights(settings, bucket_count);
    let weight_sum: f64 = weights.iter().map(|w| (*w).max(1) as f64).sum();
    let target: Vec<f64> = weights
        .iter()
        .map(|w| {
            if weight_sum <= 0.0 {
                1.0 / bucket_count as f64
            } else {
                (*w).max(1) as f64 / weight_sum
            }
        })
        .collect();

    let loss: f64 = observed
        .iter()
        .zip(&target)
        .map(|(o, t)| (o - t).abs())
        .sum::<f64>()
        .clamp(0.0, 2.0);

    let shift = match last_observed_dist.as_ref() {
        Some(last) if last.len() == bucket_count => observed
            .iter()
            .zip(last)
            .map(|(o, l)| (o - l).abs())
            .sum::<f64>()
            .clamp(0.0, 2.0),
        _ => 0.0,
    };
    *last_observed_dist = Some(observed);

    let score = (0.7 * (loss / 2.0) + 0.3 * (shift / 2.0)).clamp(0.0, 1.0);
    let interval = (max_sec as f64 - score * (max_sec - min_sec) as f64).round() as i64;
    interval.clamp(min_sec, max_sec)
}
