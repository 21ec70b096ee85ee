use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

const DEFAULT_TTL_SECONDS: u64 = 300;
/// Store round-trips are bounded; a slow store must not stall admission.
const STORE_OP_TIMEOUT: Duration = Duration::from_millis(100);

/// Duplicate-request gate at the edge. `try_acquire` is an atomic
/// set-if-absent with TTL: `true` means first use. Store failures admit the
/// request (availability over strictness) and are logged.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn try_acquire(&self, key: &str) -> bool;
    async fn release(&self, key: &str);
}

/// Redis-backed guard using `SET key 1 NX EX ttl`.
pub struct RedisIdempotencyStore {
    client: redis::Client,
    prefix: String,
    ttl_seconds: u64,
}

impl RedisIdempotencyStore {
    pub fn new(url: impl AsRef<str>) -> Result<Self, redis::RedisError> {
        Ok(Self {
            client: redis::Client::open(url.as_ref())?,
            prefix: "relay:idempotency".to_string(),
            ttl_seconds: DEFAULT_TTL_SECONDS,
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn redis_key(&self, key: &str) -> String {
        format!("{}:{key}", self.prefix)
    }

    async fn acquire_inner(&self, key: &str) -> Result<bool, redis::RedisError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.redis_key(key))
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(self.ttl_seconds)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn release_inner(&self, key: &str) -> Result<(), redis::RedisError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        redis::cmd("DEL")
            .arg(self.redis_key(key))
            .query_async::<()>(&mut conn)
            .await
    }
}

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    async fn try_acquire(&self, key: &str) -> bool {
        if key.is_empty() {
            return false;
        }
        match tokio::time::timeout(STORE_OP_TIMEOUT, self.acquire_inner(key)).await {
            Ok(Ok(first_use)) => first_use,
            Ok(Err(err)) => {
                tracing::error!(key, error = %err, "idempotency check failed, admitting");
                true
            }
            Err(_) => {
                tracing::warn!(key, "idempotency check timed out, admitting");
                true
            }
        }
    }

    async fn release(&self, key: &str) {
        if key.is_empty() {
            return;
        }
        match tokio::time::timeout(STORE_OP_TIMEOUT, self.release_inner(key)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::warn!(key, error = %err, "idempotency release failed"),
            Err(_) => tracing::warn!(key, "idempotency release timed out"),
        }
    }
}

/// Process-local guard for tests and single-node deployments.
pub struct InMemoryIdempotencyStore {
    entries: Mutex<HashMap<String, Instant>>,
    ttl: Duration,
}

impl Default for InMemoryIdempotencyStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_TTL_SECONDS))
    }
}

impl InMemoryIdempotencyStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn try_acquire(&self, key: &str) -> bool {
        if key.is_empty() {
            return false;
        }
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("idempotency lock poisoned");
        entries.retain(|_, acquired_at| now.duration_since(*acquired_at) < self.ttl);
        match entries.get(key) {
            Some(_) => false,
            None => {
                entries.insert(key.to_string(), now);
                true
            }
        }
    }

    async fn release(&self, key: &str) {
        let mut entries = self.entries.lock().expect("idempotency lock poisoned");
        entries.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_acquire_wins_second_loses() {
        let store = InMemoryIdempotencyStore::default();
        assert!(store.try_acquire("k1").await);
        assert!(!store.try_acquire("k1").await);
        assert!(store.try_acquire("k2").await);
    }

    #[tokio::test]
    async fn release_frees_the_key() {
        let store = InMemoryIdempotencyStore::default();
        assert!(store.try_acquire("k1").await);
        store.release("k1").await;
        assert!(store.try_acquire("k1").await);
    }

    #[tokio::test]
    async fn expired_entries_are_reaped() {
        let store = InMemoryIdempotencyStore::new(Duration::from_millis(0));
        assert!(store.try_acquire("k1").await);
        assert!(store.try_acquire("k1").await);
    }

    #[tokio::test]
    async fn empty_key_is_refused() {
        let store = InMemoryIdempotencyStore::default();
        assert!(!store.try_acquire("").await);
    }
}
