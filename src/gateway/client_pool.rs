use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use thiserror::Error;

use super::instance::{InstanceId, ModelInstance};

const MIN_POOL_CONNECTIONS: i64 = 10;
const MAX_POOL_CONNECTIONS: i64 = 200;

#[derive(Debug, Error)]
pub enum ClientPoolError {
    #[error("failed to build http client for instance {instance_id}: {source}")]
    Build {
        instance_id: InstanceId,
        source: reqwest::Error,
    },
}

/// One outbound `reqwest::Client` per instance id, each with its own
/// connection pool sized from the instance's effective RPM.
///
/// Creation is double-checked: a shared read probe first, then a per-id lock
/// so concurrent first requests to one instance build a single client while
/// other instances proceed. `refresh` holds the global refresh lock, and
/// removal also clears the per-id lock entry so the lock map cannot grow
/// unboundedly.
pub struct InstanceClientManager {
    clients: RwLock<HashMap<InstanceId, reqwest::Client>>,
    creation_locks: Mutex<HashMap<InstanceId, Arc<Mutex<()>>>>,
    refresh_lock: Mutex<()>,
}

impl Default for InstanceClientManager {
    fn default() -> Self {
        Self::new()
    }
}

impl InstanceClientManager {
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            creation_locks: Mutex::new(HashMap::new()),
            refresh_lock: Mutex::new(()),
        }
    }

    /// Returns the instance's client, building it on first use.
    pub fn get(&self, instance: &ModelInstance) -> Result<reqwest::Client, ClientPoolError> {
        let id = instance.id();
        if let Some(client) = self.clients.read().expect("client pool lock poisoned").get(&id) {
            return Ok(client.clone());
        }

        let id_lock = {
            let mut locks = self.creation_locks.lock().expect("client pool lock poisoned");
            Arc::clone(locks.entry(id).or_default())
        };
        let _creating = id_lock.lock().expect("client pool lock poisoned");

        if let Some(client) = self.clients.read().expect("client pool lock poisoned").get(&id) {
            return Ok(client.clone());
        }

        let client = build_client_for_instance(instance)?;
        self.clients
            .write()
            .expect("client pool lock poisoned")
            .insert(id, client.clone());
        tracing::info!(
            instance = %instance.name(),
            instance_id = id,
            max_connections = pool_connections(instance),
            "created http client for instance"
        );
        Ok(client)
    }

    /// Drops the client (and its pool) of every instance no longer present.
    pub fn refresh(&self, active_ids: &HashSet<InstanceId>) {
        let _guard = self.refresh_lock.lock().expect("client pool lock poisoned");
        let stale: Vec<InstanceId> = {
            let clients = self.clients.read().expect("client pool lock poisoned");
            clients
                .keys()
                .filter(|id| !active_ids.contains(id))
                .copied()
                .collect()
        };
        for id in &stale {
            self.remove(*id);
        }
        if !stale.is_empty() {
            tracing::info!(disposed = stale.len(), "disposed http clients during refresh");
        }
    }

    /// Disposes every pool; used on process shutdown.
    pub fn shutdown(&self) {
        let _guard = self.refresh_lock.lock().expect("client pool lock poisoned");
        let ids: Vec<InstanceId> = {
            let clients = self.clients.read().expect("client pool lock poisoned");
            clients.keys().copied().collect()
        };
        for id in ids {
            self.remove(id);
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().expect("client pool lock poisoned").len()
    }

    fn remove(&self, id: InstanceId) {
        let id_lock = {
            let locks = self.creation_locks.lock().expect("client pool lock poisoned");
            locks.get(&id).cloned()
        };
        // Hold the id lock so an in-flight creation cannot resurrect the
        // entry between the removal of the client and the lock entry.
        let _creating = id_lock.as_ref().map(|lock| lock.lock().expect("client pool lock poisoned"));
        self.clients
            .write()
            .expect("client pool lock poisoned")
            .remove(&id);
        self.creation_locks
            .lock()
            .expect("client pool lock poisoned")
            .remove(&id);
    }
}

fn pool_connections(instance: &ModelInstance) -> i64 {
    (instance.effective_rpm_limit() / 10).clamp(MIN_POOL_CONNECTIONS, MAX_POOL_CONNECTIONS)
}

fn build_client_for_instance(instance: &ModelInstance) -> Result<reqwest::Client, ClientPoolError> {
    reqwest::Client::builder()
        .pool_max_idle_per_host(pool_connections(instance) as usize)
        .pool_idle_timeout(Duration::from_secs(20))
        .connect_timeout(Duration::from_secs(5))
        .read_timeout(Duration::from_secs(60))
        .tcp_keepalive(Duration::from_secs(60))
        .gzip(true)
        .build()
        .map_err(|source| ClientPoolError::Build {
            instance_id: instance.id(),
            source,
        })
}
