use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;

use super::bucket::BucketManager;
use super::client_pool::InstanceClientManager;
use super::config::{Algorithm, BalancerSettings};
use super::instance::{InstanceId, ModelInstance, RuntimeSnapshot};
use super::runtime::{RuntimeState, StrategyRuntime};
use super::store::InstanceStore;
use super::strategy::SamplingStrategy;
use super::Clock;

/// Pool-ordered instance admission with hot-swappable strategy runtimes.
///
/// One runtime serves each configured pool; a settings update that changes
/// the algorithm or the pool ordering drains the current runtimes and brings
/// up fresh ones without dropping in-flight traffic. Updates and refreshes
/// are serialized behind one balancer-wide lock; the acquire path only takes
/// read locks and per-runtime atomics.
pub struct LoadBalancer {
    store: Arc<dyn InstanceStore>,
    clients: Arc<InstanceClientManager>,
    clock: Arc<dyn Clock>,
    update_lock: Mutex<()>,
    settings: RwLock<BalancerSettings>,
    ordered_pool_keys: RwLock<Vec<String>>,
    runtimes: RwLock<Vec<Arc<StrategyRuntime>>>,
    by_pool: RwLock<HashMap<String, Arc<StrategyRuntime>>>,
    buckets: BucketManager,
    runtime_seq: AtomicU64,
    accepting: AtomicBool,
}

/// A granted admission: the selected instance plus the queue slot it holds.
/// Dropping the lease returns the slot, so the slot lives exactly as long as
/// the request does.
pub struct InstanceLease {
    instance: Arc<ModelInstance>,
    runtime: Arc<StrategyRuntime>,
}

impl InstanceLease {
    pub fn instance(&self) -> &Arc<ModelInstance> {
        &self.instance
    }
}

impl Drop for InstanceLease {
    fn drop(&mut self) {
        self.runtime.leave_queue();
    }
}

/// One admin status row per live runtime.
#[derive(Clone, Debug, Serialize)]
pub struct StrategyStatus {
    pub runtime_id: String,
    pub algorithm: &'static str,
    pub state: RuntimeState,
    pub activated_at_ms: i64,
    pub queue_depth: i64,
    pub queue_capacity: i64,
    pub reject_queue_full: u64,
    pub reject_budget: u64,
    pub reject_sampling: u64,
    pub bucket_count: usize,
    pub bucket_ranges: Vec<i64>,
    pub bucket_weights: Vec<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drain_duration_ms: Option<i64>,
}

/// Aggregate monitoring view across every pool.
#[derive(Clone, Debug, Serialize)]
pub struct BalancerStats {
    pub total_instances: usize,
    pub healthy_instances: usize,
    pub available_rpm: i64,
    pub available_tpm: i64,
    pub last_window_reset_ms: i64,
    pub algorithm: &'static str,
}

impl LoadBalancer {
    /// Builds the balancer, activates one runtime per configured pool and
    /// performs the initial instance load.
    pub fn new(
        store: Arc<dyn InstanceStore>,
        clients: Arc<InstanceClientManager>,
        clock: Arc<dyn Clock>,
        initial_settings: Option<BalancerSettings>,
    ) -> Arc<Self> {
        let settings = initial_settings.unwrap_or_default().normalized();
        let balancer = Arc::new(Self {
            store,
            clients,
            clock,
            update_lock: Mutex::new(()),
            ordered_pool_keys: RwLock::new(settings.ordered_pool_keys_list()),
            buckets: BucketManager::new(),
            settings: RwLock::new(settings.clone()),
            runtimes: RwLock::new(Vec::new()),
            by_pool: RwLock::new(HashMap::new()),
            runtime_seq: AtomicU64::new(0),
            accepting: AtomicBool::new(true),
        });
        balancer.buckets.init_from_settings(&settings);
        {
            let _guard = balancer.update_lock.lock().expect("balancer lock poisoned");
            balancer.initialize_runtimes(settings.algorithm, &settings);
            balancer.refresh_locked();
        }
        balancer
    }

    /// Selects an instance for a request of `estimated_tokens`, trying pools
    /// in configured order. `None` means every pool refused (queue full,
    /// budget exhausted or no candidates) or the balancer is shutting down.
    pub fn acquire(&self, estimated_tokens: i64) -> Option<InstanceLease> {
        if !self.accepting.load(Ordering::SeqCst) {
            return None;
        }
        let tokens = estimated_tokens.max(1);
        let settings = self.settings.read().expect("balancer lock poisoned").clone();
        let now = self.clock.now_millis();
        self.buckets.record_and_maybe_adapt(tokens, &settings, now);
        let bucket_index = self.buckets.resolve_bucket_index(tokens);

        let ordered = self
            .ordered_pool_keys
            .read()
            .expect("balancer lock poisoned")
            .clone();
        for pool_key in ordered {
            let runtime = {
                let by_pool = self.by_pool.read().expect("balancer lock poisoned");
                by_pool.get(&pool_key).cloned()
            };
            let Some(runtime) = runtime else { continue };
            if runtime.state() != RuntimeState::Active {
                continue;
            }
            if !runtime.try_enter_queue(settings.queue_capacity) {
                runtime.record_queue_full();
                continue;
            }
            match runtime.strategy.acquire(tokens, bucket_index) {
                Some(instance) => {
                    return Some(InstanceLease { instance, runtime });
                }
                None => runtime.leave_queue(),
            }
        }
        None
    }

    /// Applies a new settings document. Parameter-only changes propagate in
    /// place; an algorithm or pool-ordering change swaps runtimes smoothly.
    pub fn update_settings(&self, new_settings: BalancerSettings) {
        let _guard = self.update_lock.lock().expect("balancer lock poisoned");
        let new_settings = new_settings.normalized();
        let new_ordered = new_settings.ordered_pool_keys_list();

        let current = self.active_runtime();
        let algorithm_change = current
            .as_ref()
            .is_some_and(|runtime| runtime.algorithm != new_settings.algorithm);
        let pool_order_change = {
            let ordered = self.ordered_pool_keys.read().expect("balancer lock poisoned");
            *ordered != new_ordered
        };

        *self.settings.write().expect("balancer lock poisoned") = new_settings.clone();
        self.buckets.update_from_settings(&new_settings);

        if algorithm_change || pool_order_change {
            if algorithm_change {
                tracing::info!(
                    from = current.as_ref().map(|r| r.algorithm.as_str()).unwrap_or("-"),
                    to = new_settings.algorithm.as_str(),
                    "smooth-switching load balancing algorithm"
                );
            }
            let now = self.clock.now_millis();
            {
                let by_pool = self.by_pool.read().expect("balancer lock poisoned");
                for runtime in by_pool.values() {
                    runtime.mark_draining(now);
                }
            }
            *self
                .ordered_pool_keys
                .write()
                .expect("balancer lock poisoned") = new_ordered;
            self.initialize_runtimes(new_settings.algorithm, &new_settings);
            self.refresh_locked();
            self.cleanup_draining_runtimes();
        } else {
            let by_pool = self.by_pool.read().expect("balancer lock poisoned");
            for runtime in by_pool.values() {
                runtime.strategy.on_settings_changed(&new_settings);
            }
        }
    }

    /// Reloads instances from the store, carrying runtime counters over by
    /// instance id and disposing clients of departed instances.
    pub fn refresh(&self) {
        let _guard = self.update_lock.lock().expect("balancer lock poisoned");
        self.refresh_locked();
    }

    /// Stops admitting new requests; in-flight streams continue.
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    /// Current settings, with the algorithm tag of the runtime actually
    /// serving the first pool.
    pub fn settings(&self) -> BalancerSettings {
        let mut copy = self.settings.read().expect("balancer lock poisoned").clone();
        if let Some(runtime) = self.active_runtime() {
            copy.algorithm = runtime.algorithm;
        }
        copy
    }

    pub fn stats(&self) -> BalancerStats {
        let mut stats = BalancerStats {
            total_instances: 0,
            healthy_instances: 0,
            available_rpm: 0,
            available_tpm: 0,
            last_window_reset_ms: self.clock.now_millis(),
            algorithm: Algorithm::Traditional.as_str(),
        };
        let by_pool = self.by_pool.read().expect("balancer lock poisoned");
        for runtime in by_pool.values() {
            let pool = runtime.strategy.stats();
            stats.total_instances += pool.total_instances;
            stats.healthy_instances += pool.healthy_instances;
            stats.available_rpm += pool.available_rpm;
            stats.available_tpm += pool.available_tpm;
            if pool.last_window_reset_ms > stats.last_window_reset_ms {
                stats.last_window_reset_ms = pool.last_window_reset_ms;
            }
            stats.algorithm = runtime.algorithm.as_str();
        }
        if let Some(runtime) = self.active_runtime() {
            stats.algorithm = runtime.algorithm.as_str();
        }
        stats
    }

    /// One status row per live runtime; a DRAINING runtime is visible with
    /// its drain duration until the swap that created it completes.
    pub fn strategy_statuses(&self) -> Vec<StrategyStatus> {
        let now = self.clock.now_millis();
        let ranges = self.buckets.active_ranges();
        let weights = self.buckets.active_weights();
        let runtimes = self.runtimes.read().expect("balancer lock poisoned");
        runtimes
            .iter()
            .map(|runtime| {
                let metrics = runtime.strategy.snapshot_metrics();
                StrategyStatus {
                    runtime_id: runtime.runtime_id.clone(),
                    algorithm: runtime.algorithm.as_str(),
                    state: runtime.state(),
                    activated_at_ms: runtime.activated_at_ms,
                    queue_depth: runtime.queue_depth(),
                    queue_capacity: runtime.queue_capacity(),
                    reject_queue_full: runtime.reject_queue_full(),
                    reject_budget: metrics.reject_budget,
                    reject_sampling: metrics.reject_sampling,
                    bucket_count: ranges.len(),
                    bucket_ranges: ranges.clone(),
                    bucket_weights: weights.clone(),
                    drain_duration_ms: runtime.drain_duration_ms(now),
                }
            })
            .collect()
    }

    /// Every instance currently owned by any pool runtime.
    pub fn instances(&self) -> Vec<Arc<ModelInstance>> {
        let by_pool = self.by_pool.read().expect("balancer lock poisoned");
        by_pool
            .values()
            .flat_map(|runtime| runtime.strategy.instances())
            .collect()
    }

    fn active_runtime(&self) -> Option<Arc<StrategyRuntime>> {
        let ordered = self.ordered_pool_keys.read().expect("balancer lock poisoned");
        let first = ordered.first()?;
        let by_pool = self.by_pool.read().expect("balancer lock poisoned");
        by_pool.get(first).cloned()
    }

    fn create_runtime(
        &self,
        algorithm: Algorithm,
        settings: &BalancerSettings,
    ) -> Arc<StrategyRuntime> {
        // Both tags currently resolve to the sampling strategy; the tag still
        // drives the smooth-switch decision.
        let strategy = Box::new(SamplingStrategy::new(Arc::clone(&self.clock)));
        let seq = self.runtime_seq.fetch_add(1, Ordering::Relaxed) + 1;
        Arc::new(StrategyRuntime::new(
            format!("rt-{seq}"),
            algorithm,
            settings,
            strategy,
            self.clock.now_millis(),
        ))
    }

    /// Creates one ACTIVE runtime per pool key, replacing the pool map. Any
    /// previous runtimes stay in the runtime list (as DRAINING) until the
    /// cleanup sweep retires them.
    fn initialize_runtimes(&self, algorithm: Algorithm, settings: &BalancerSettings) {
        let ordered = self
            .ordered_pool_keys
            .read()
            .expect("balancer lock poisoned")
            .clone();
        let mut new_map = HashMap::new();
        {
            let mut runtimes = self.runtimes.write().expect("balancer lock poisoned");
            runtimes.retain(|runtime| runtime.state() == RuntimeState::Draining);
            for pool_key in &ordered {
                let runtime = self.create_runtime(algorithm, settings);
                runtime.strategy.on_activate(settings);
                new_map.insert(pool_key.clone(), Arc::clone(&runtime));
                runtimes.push(runtime);
            }
        }
        *self.by_pool.write().expect("balancer lock poisoned") = new_map;
    }

    /// Retires every DRAINING runtime: the strategy releases its instances
    /// and the runtime leaves the observable registry for good.
    fn cleanup_draining_runtimes(&self) {
        let mut runtimes = self.runtimes.write().expect("balancer lock poisoned");
        runtimes.retain(|runtime| {
            if runtime.state() != RuntimeState::Draining {
                return true;
            }
            runtime.strategy.on_deactivate();
            runtime.mark_retired();
            false
        });
    }

    fn refresh_locked(&self) {
        let configs = self.store.load_instances();
        let snapshots = self.snapshot_runtime_states();
        let now = self.clock.now_millis();
        let settings = self.settings.read().expect("balancer lock poisoned").clone();

        let mut grouped: HashMap<String, Vec<Arc<ModelInstance>>> = HashMap::new();
        let mut active_ids: HashSet<InstanceId> = HashSet::new();
        let mut restored = 0usize;
        let mut fresh = 0usize;
        let total = configs.len();
        for config in configs {
            let instance = Arc::new(ModelInstance::new(config, now));
            match snapshots.get(&instance.id()) {
                Some(snapshot) => {
                    instance.restore(snapshot);
                    restored += 1;
                }
                None => fresh += 1,
            }
            active_ids.insert(instance.id());
            grouped
                .entry(instance.pool_key().to_string())
                .or_default()
                .push(instance);
        }
        tracing::info!(total, restored, fresh, "instance list refreshed");

        let ordered = self
            .ordered_pool_keys
            .read()
            .expect("balancer lock poisoned")
            .clone();
        for pool_key in &ordered {
            let runtime = {
                let by_pool = self.by_pool.read().expect("balancer lock poisoned");
                by_pool.get(pool_key).cloned()
            };
            if let Some(runtime) = runtime {
                let pool_instances = grouped.remove(pool_key).unwrap_or_default();
                runtime.strategy.refresh_instances(pool_instances, &settings);
            }
        }

        self.clients.refresh(&active_ids);
    }

    /// Captures runtime counters for every instance in every pool. Reads are
    /// best-effort; a duplicate id keeps the last snapshot seen.
    fn snapshot_runtime_states(&self) -> HashMap<InstanceId, RuntimeSnapshot> {
        let mut map = HashMap::new();
        let by_pool = self.by_pool.read().expect("balancer lock poisoned");
        for runtime in by_pool.values() {
            for instance in runtime.strategy.instances() {
                if map.insert(instance.id(), instance.snapshot()).is_some() {
                    tracing::warn!(instance_id = instance.id(), "duplicate instance id in snapshot");
                }
            }
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::instance::InstanceConfig;
    use crate::gateway::store::StaticInstanceStore;
    use std::sync::atomic::AtomicI64;

    struct ManualClock(AtomicI64);

    impl Clock for ManualClock {
        fn now_millis(&self) -> i64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn config(id: i64, rpm: i64, tpm: i64, pool_key: &str) -> InstanceConfig {
        InstanceConfig {
            id,
            provider_name: "p".to_string(),
            model_name: format!("m{id}"),
            url: "http://localhost/v1".to_string(),
            api_key: "k".to_string(),
            request_template: String::new(),
            response_request_id_path: String::new(),
            response_content_path: String::new(),
            response_seq_path: String::new(),
            response_raw_enabled: false,
            rpm_limit: rpm,
            tpm_limit: tpm,
            max_qps: 0,
            pool_key: pool_key.to_string(),
            active: true,
        }
    }

    fn balancer_with(configs: Vec<InstanceConfig>) -> Arc<LoadBalancer> {
        LoadBalancer::new(
            Arc::new(StaticInstanceStore::new(configs)),
            Arc::new(InstanceClientManager::new()),
            Arc::new(ManualClock(AtomicI64::new(1_000))),
            None,
        )
    }

    #[test]
    fn acquire_returns_instance_and_releases_queue_slot_on_drop() {
        let balancer = balancer_with(vec![config(1, 10, 10_000, "")]);
        let lease = balancer.acquire(100).expect("admitted");
        assert_eq!(lease.instance().id(), 1);

        let statuses = balancer.strategy_statuses();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].queue_depth, 1);
        drop(lease);
        assert_eq!(balancer.strategy_statuses()[0].queue_depth, 0);
    }

    #[test]
    fn budget_exhaustion_rejects_with_budget_reason() {
        let balancer = balancer_with(vec![config(1, 2, 1_000, "")]);
        assert!(balancer.acquire(100).is_some());
        assert!(balancer.acquire(100).is_some());
        assert!(balancer.acquire(100).is_none());
        let status = &balancer.strategy_statuses()[0];
        assert_eq!(status.reject_budget, 1);
        assert_eq!(status.reject_sampling, 0);
    }

    #[test]
    fn empty_store_rejects_with_sampling_reason() {
        let balancer = balancer_with(Vec::new());
        assert!(balancer.acquire(100).is_none());
        let status = &balancer.strategy_statuses()[0];
        assert_eq!(status.reject_sampling, 1);
    }

    #[test]
    fn stopped_balancer_admits_nothing() {
        let balancer = balancer_with(vec![config(1, 10, 10_000, "")]);
        balancer.stop_accepting();
        assert!(balancer.acquire(100).is_none());
    }

    #[test]
    fn pools_are_tried_in_configured_order() {
        let mut settings = BalancerSettings::default();
        settings.ordered_pool_keys = "premium,default".to_string();
        let balancer = LoadBalancer::new(
            Arc::new(StaticInstanceStore::new(vec![
                config(1, 1, 10_000, "premium"),
                config(2, 10, 10_000, "default"),
            ])),
            Arc::new(InstanceClientManager::new()),
            Arc::new(ManualClock(AtomicI64::new(1_000))),
            Some(settings),
        );

        // First request drains the premium pool (rpm 1), second falls back.
        let first = balancer.acquire(10).expect("premium admitted");
        assert_eq!(first.instance().id(), 1);
        let second = balancer.acquire(10).expect("fallback admitted");
        assert_eq!(second.instance().id(), 2);
    }

    #[test]
    fn algorithm_change_swaps_runtimes_and_retires_old() {
        let balancer = balancer_with(vec![config(1, 10, 10_000, "")]);
        let before = balancer.strategy_statuses();
        assert_eq!(before.len(), 1);
        let old_id = before[0].runtime_id.clone();

        let mut updated = balancer.settings();
        updated.algorithm = Algorithm::ObjectPool;
        balancer.update_settings(updated);

        let after = balancer.strategy_statuses();
        assert_eq!(after.len(), 1, "no DRAINING runtime survives the update");
        assert_ne!(after[0].runtime_id, old_id);
        assert_eq!(after[0].state, RuntimeState::Active);
        assert_eq!(after[0].algorithm, "object_pool");

        // The new runtime serves traffic immediately.
        assert!(balancer.acquire(10).is_some());
    }

    #[test]
    fn parameter_only_update_keeps_runtimes() {
        let balancer = balancer_with(vec![config(1, 10, 10_000, "")]);
        let old_id = balancer.strategy_statuses()[0].runtime_id.clone();

        let mut updated = balancer.settings();
        updated.queue_capacity = 7;
        balancer.update_settings(updated);

        let statuses = balancer.strategy_statuses();
        assert_eq!(statuses[0].runtime_id, old_id);
        assert_eq!(balancer.settings().queue_capacity, 7);
    }

    #[test]
    fn refresh_preserves_counters_for_surviving_ids() {
        let store = Arc::new(StaticInstanceStore::new(vec![config(1, 10, 10_000, "")]));
        let balancer = LoadBalancer::new(
            Arc::clone(&store) as Arc<dyn InstanceStore>,
            Arc::new(InstanceClientManager::new()),
            Arc::new(ManualClock(AtomicI64::new(1_000))),
            None,
        );

        let instance = balancer.instances().pop().expect("loaded");
        instance.record_success(25, 2_000);
        instance.record_failure(3_000);

        store.replace(vec![config(1, 10, 10_000, ""), config(2, 10, 10_000, "")]);
        balancer.refresh();

        let mut instances = balancer.instances();
        instances.sort_by_key(|instance| instance.id());
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].request_count(), 1);
        assert_eq!(instances[0].failure_count(), 1);
        assert_eq!(instances[0].total_latency_ms(), 25);
        assert_eq!(instances[1].request_count(), 0);
    }

    #[test]
    fn refresh_to_empty_store_fails_soft() {
        let store = Arc::new(StaticInstanceStore::new(vec![config(1, 10, 10_000, "")]));
        let balancer = LoadBalancer::new(
            Arc::clone(&store) as Arc<dyn InstanceStore>,
            Arc::new(InstanceClientManager::new()),
            Arc::new(ManualClock(AtomicI64::new(1_000))),
            None,
        );
        assert!(balancer.acquire(10).is_some());

        store.replace(Vec::new());
        balancer.refresh();
        assert!(balancer.acquire(10).is_none());
        assert!(balancer.instances().is_empty());
    }
}
