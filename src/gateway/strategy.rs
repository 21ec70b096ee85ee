use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use rand::seq::SliceRandom;

use serde::Serialize;

use super::budget::MinuteBudget;
use super::config::BalancerSettings;
use super::instance::ModelInstance;
use super::Clock;

/// Reject counters a strategy accumulates over its lifetime.
#[derive(Clone, Copy, Debug, Default)]
pub struct StrategyMetrics {
    pub reject_budget: u64,
    pub reject_sampling: u64,
}

/// Aggregate view over one strategy's instances, for monitoring.
#[derive(Clone, Debug, Default, Serialize)]
pub struct PoolStats {
    pub total_instances: usize,
    pub healthy_instances: usize,
    pub available_rpm: i64,
    pub available_tpm: i64,
    pub last_window_reset_ms: i64,
}

/// Seam between the runtime lifecycle and a concrete selection algorithm.
/// Implementations never fail loudly: acquire answers with an instance or
/// nothing, bumping a reject counter on the way out.
pub trait Strategy: Send + Sync {
    fn on_activate(&self, settings: &BalancerSettings);
    fn on_deactivate(&self);
    fn on_settings_changed(&self, settings: &BalancerSettings);
    fn refresh_instances(&self, instances: Vec<Arc<ModelInstance>>, settings: &BalancerSettings);
    fn acquire(&self, estimated_tokens: i64, bucket_index: usize) -> Option<Arc<ModelInstance>>;
    fn snapshot_metrics(&self) -> StrategyMetrics;
    fn instances(&self) -> Vec<Arc<ModelInstance>>;
    fn stats(&self) -> PoolStats;
}

struct InstanceSlot {
    instance: Arc<ModelInstance>,
    budget: MinuteBudget,
}

/// Power-of-K sampling with multi-round retry.
///
/// Each round draws K distinct instances uniformly, shuffles them so tied
/// candidates see no positional bias, and admits the first whose minute
/// budget accepts the request.
pub struct SamplingStrategy {
    slots: RwLock<Vec<Arc<InstanceSlot>>>,
    settings: RwLock<BalancerSettings>,
    clock: Arc<dyn Clock>,
    reject_budget: AtomicU64,
    reject_sampling: AtomicU64,
}

impl SamplingStrategy {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
            settings: RwLock::new(BalancerSettings::default()),
            clock,
            reject_budget: AtomicU64::new(0),
            reject_sampling: AtomicU64::new(0),
        }
    }

    fn sample_slots(&self, sample_count: i64) -> Vec<Arc<InstanceSlot>> {
        let slots = self.slots.read().expect("strategy lock poisoned");
        if slots.is_empty() {
            return Vec::new();
        }
        let count = (sample_count.max(1) as usize).min(slots.len());
        let mut rng = rand::thread_rng();
        let indices = rand::seq::index::sample(&mut rng, slots.len(), count);
        indices.iter().map(|idx| Arc::clone(&slots[idx])).collect()
    }
}

impl Strategy for SamplingStrategy {
    fn on_activate(&self, settings: &BalancerSettings) {
        *self.settings.write().expect("strategy lock poisoned") = settings.clone();
    }

    fn on_deactivate(&self) {
        self.slots.write().expect("strategy lock poisoned").clear();
    }

    fn on_settings_changed(&self, settings: &BalancerSettings) {
        *self.settings.write().expect("strategy lock poisoned") = settings.clone();
    }

    fn refresh_instances(&self, instances: Vec<Arc<ModelInstance>>, settings: &BalancerSettings) {
        *self.settings.write().expect("strategy lock poisoned") = settings.clone();
        let now = self.clock.now_millis();
        let slots = instances
            .into_iter()
            .map(|instance| {
                Arc::new(InstanceSlot {
                    instance,
                    budget: MinuteBudget::new(now),
                })
            })
            .collect();
        *self.slots.write().expect("strategy lock poisoned") = slots;
    }

    fn acquire(&self, estimated_tokens: i64, _bucket_index: usize) -> Option<Arc<ModelInstance>> {
        let (rounds, sample_count) = {
            let settings = self.settings.read().expect("strategy lock poisoned");
            (settings.sampling_rounds.max(1), settings.sample_count)
        };

        let mut budget_rejected = false;
        let mut sampling_rejected = false;
        for _ in 0..rounds {
            let mut samples = self.sample_slots(sample_count);
            if samples.is_empty() {
                sampling_rejected = true;
                break;
            }
            samples.shuffle(&mut rand::thread_rng());
            let now = self.clock.now_millis();
            for slot in samples {
                if slot.budget.try_acquire(&slot.instance, estimated_tokens, now) {
                    return Some(Arc::clone(&slot.instance));
                }
                budget_rejected = true;
            }
        }

        if sampling_rejected || !budget_rejected {
            self.reject_sampling.fetch_add(1, Ordering::Relaxed);
        } else {
            self.reject_budget.fetch_add(1, Ordering::Relaxed);
        }
        None
    }

    fn snapshot_metrics(&self) -> StrategyMetrics {
        StrategyMetrics {
            reject_budget: self.reject_budget.load(Ordering::Relaxed),
            reject_sampling: self.reject_sampling.load(Ordering::Relaxed),
        }
    }

    fn instances(&self) -> Vec<Arc<ModelInstance>> {
        self.slots
            .read()
            .expect("strategy lock poisoned")
            .iter()
            .map(|slot| Arc::clone(&slot.instance))
            .collect()
    }

    fn stats(&self) -> PoolStats {
        let now = self.clock.now_millis();
        let slots = self.slots.read().expect("strategy lock poisoned");
        let mut stats = PoolStats {
            total_instances: slots.len(),
            last_window_reset_ms: now,
            ..PoolStats::default()
        };
        for slot in slots.iter() {
            if !slot.instance.is_healthy() {
                continue;
            }
            stats.healthy_instances += 1;
            stats.available_rpm += slot.budget.available_rpm(&slot.instance, now);
            stats.available_tpm += slot.budget.available_tpm(&slot.instance, now);
        }
        stats
    }
}
