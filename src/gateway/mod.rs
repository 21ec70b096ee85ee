//! Gateway core: admission, balancing and the streaming pipeline.

pub mod balancer;
pub mod bucket;
pub mod budget;
pub mod client_pool;
pub mod config;
pub mod estimate;
pub mod http;
pub mod idempotency;
pub mod instance;
pub mod monitor;
pub mod observability;
pub mod pipeline;
pub mod runtime;
pub mod state_file;
pub mod store;
pub mod strategy;

use thiserror::Error;

pub use balancer::{InstanceLease, LoadBalancer, StrategyStatus};
pub use bucket::BucketManager;
pub use client_pool::InstanceClientManager;
pub use config::{Algorithm, BalancerSettings};
pub use http::AppState;
pub use idempotency::{IdempotencyStore, InMemoryIdempotencyStore, RedisIdempotencyStore};
pub use instance::{InstanceConfig, ModelInstance, RuntimeSnapshot};
pub use monitor::GatewayMonitor;
pub use observability::{FailureReason, Metrics};
pub use state_file::SettingsFile;
pub use store::{InstanceStore, JsonFileInstanceStore, StaticInstanceStore};

/// Synchronous-phase request failures, mapped to HTTP statuses at the edge.
/// Once streaming has begun, errors are folded into the stream instead.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("message must not be empty")]
    BadRequest,
    #[error("duplicate request")]
    DuplicateRequest,
    #[error("no available instances or rate limit exceeded")]
    NoInstanceOrRateLimit,
    #[error("downstream error: {0}")]
    Downstream(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl GatewayError {
    pub fn reason(&self) -> FailureReason {
        match self {
            GatewayError::BadRequest => FailureReason::BadRequest,
            GatewayError::DuplicateRequest => FailureReason::DuplicateRequest,
            GatewayError::NoInstanceOrRateLimit => FailureReason::NoInstanceOrRateLimit,
            GatewayError::Downstream(_) => FailureReason::DownstreamError,
            GatewayError::Unexpected(_) => FailureReason::UnexpectedError,
        }
    }
}

/// Millisecond clock seam; swapped for a manual clock in tests so minute
/// windows and adaptation intervals can be driven deterministically.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_else(|_| std::time::Duration::from_secs(0));
        now.as_millis() as i64
    }
}
