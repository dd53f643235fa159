//! Shared counter store abstraction.
//!
//! All rate limit and ban state lives behind [`CounterStore`]. Every
//! operation touches a single key and is atomic for that key, so replicas
//! sharing a store enforce one global limit without coordinating with each
//! other.

mod bounded;
mod memory;
mod mesh;
mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::Clock;
use crate::config::{StoreBackend, StoreConfig};
use crate::ratelimit::{Identifier, TimeWindow};

pub use self::bounded::BoundedStore;
pub use self::memory::MemoryStore;
pub use self::mesh::MeshStore;
pub use self::redis::RedisStore;

/// Errors returned by store backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store operation timed out")]
    Timeout,
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("corrupt value under key {key}: {detail}")]
    Corrupt { key: String, detail: String },
}

/// Refill parameters of a token bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketSpec {
    /// Tokens added per second
    pub rate_per_sec: f64,
    /// Maximum tokens the bucket holds
    pub capacity: f64,
}

impl BucketSpec {
    /// Time for an empty bucket to fill completely; used as the key TTL.
    pub fn fill_time(&self) -> Duration {
        if self.rate_per_sec <= 0.0 {
            return Duration::from_secs(1);
        }
        Duration::from_secs_f64((self.capacity / self.rate_per_sec).max(1.0).ceil())
    }

    /// Wait until `deficit` tokens have refilled.
    pub fn wait_for(&self, deficit: f64) -> Duration {
        if deficit <= 0.0 {
            return Duration::ZERO;
        }
        if self.rate_per_sec <= 0.0 {
            return Duration::from_secs(1);
        }
        Duration::from_millis(((deficit / self.rate_per_sec) * 1000.0).ceil() as u64)
    }
}

/// Result of taking tokens from a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketOutcome {
    pub allowed: bool,
    /// Whole tokens left after this take
    pub remaining: u64,
    /// Milliseconds until the requested tokens are available; zero when allowed
    pub retry_after_ms: u64,
}

/// Continuous token-bucket refill shared by the in-process backends.
///
/// Returns the outcome and the new token level.
pub(crate) fn refill_and_take(
    tokens: f64,
    last_refill_ms: i64,
    spec: BucketSpec,
    cost: f64,
    now_ms: i64,
) -> (BucketOutcome, f64) {
    let elapsed = (now_ms - last_refill_ms).max(0) as f64 / 1000.0;
    let available = (tokens + elapsed * spec.rate_per_sec).min(spec.capacity);

    if available >= cost {
        let left = available - cost;
        (
            BucketOutcome {
                allowed: true,
                remaining: left.floor() as u64,
                retry_after_ms: 0,
            },
            left,
        )
    } else {
        let wait = spec.wait_for(cost - available);
        (
            BucketOutcome {
                allowed: false,
                remaining: available.floor() as u64,
                retry_after_ms: wait.as_millis() as u64,
            },
            available,
        )
    }
}

/// An atomic key-value store with TTL expiry.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically add `amount` to the counter at `key` and return the new value.
    ///
    /// The TTL is set when the key is created and is not extended by later
    /// increments.
    async fn increment(&self, key: &str, amount: u64, ttl: Duration) -> Result<u64, StoreError>;

    /// Atomically refill the bucket at `key` and take `cost` tokens if available.
    async fn take_tokens(
        &self,
        key: &str,
        spec: BucketSpec,
        cost: u64,
        now_ms: i64,
    ) -> Result<BucketOutcome, StoreError>;

    /// Read a plain value.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write a plain value, optionally expiring after `ttl`.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Remove a key; returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// All live plain values whose key starts with `prefix`.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError>;

    /// Backend name for logs and status output.
    fn name(&self) -> &'static str;
}

/// Key layout for everything the limiter writes.
#[derive(Debug, Clone)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn window(&self, id: &Identifier, window: TimeWindow, bucket: i64) -> String {
        format!("{}:win:{}:{}:{}", self.prefix, id, window, bucket)
    }

    pub fn bucket(&self, id: &Identifier) -> String {
        format!("{}:tb:{}", self.prefix, id)
    }

    pub fn violations(&self, id: &Identifier, bucket: i64) -> String {
        format!("{}:viol:{}:{}", self.prefix, id, bucket)
    }

    pub fn ban(&self, id: &Identifier) -> String {
        format!("{}{}", self.ban_prefix(), id)
    }

    pub fn ban_prefix(&self) -> String {
        format!("{}:ban:", self.prefix)
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new("floodgate")
    }
}

/// Build the configured store backend, wrapped with the call timeout.
pub async fn connect(
    config: &StoreConfig,
    clock: Arc<dyn Clock>,
    cluster: Option<Arc<crate::mesh::Cluster>>,
) -> crate::error::Result<Arc<dyn CounterStore>> {
    let backend: Arc<dyn CounterStore> = match config.backend {
        StoreBackend::Memory => Arc::new(MemoryStore::with_clock(clock)),
        StoreBackend::Redis => {
            let url = config.url.as_deref().ok_or_else(|| {
                crate::error::FloodgateError::Config("store.url is required for redis".into())
            })?;
            Arc::new(RedisStore::connect(url).await?)
        }
        StoreBackend::Mesh => {
            let cluster = cluster.ok_or_else(|| {
                crate::error::FloodgateError::Config(
                    "mesh store requires mesh.enabled = true".into(),
                )
            })?;
            Arc::new(MeshStore::new(cluster, clock))
        }
    };

    Ok(Arc::new(BoundedStore::new(
        backend,
        Duration::from_millis(config.timeout_ms),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let keys = KeySpace::new("fg");
        let id = Identifier::user("alice");

        assert_eq!(keys.window(&id, TimeWindow::Minute, 120), "fg:win:user:alice:minute:120");
        assert_eq!(keys.bucket(&id), "fg:tb:user:alice");
        assert_eq!(keys.violations(&id, 60), "fg:viol:user:alice:60");
        assert_eq!(keys.ban(&id), "fg:ban:user:alice");
        assert!(keys.ban(&id).starts_with(&keys.ban_prefix()));
    }

    #[test]
    fn test_refill_and_take() {
        let spec = BucketSpec {
            rate_per_sec: 10.0,
            capacity: 10.0,
        };

        // Full bucket
        let (outcome, left) = refill_and_take(10.0, 0, spec, 1.0, 0);
        assert!(outcome.allowed);
        assert_eq!(outcome.remaining, 9);
        assert_eq!(left, 9.0);

        // Empty bucket, 100ms later one token is back
        let (outcome, _) = refill_and_take(0.0, 0, spec, 1.0, 100);
        assert!(outcome.allowed);

        // Empty bucket, no time elapsed
        let (outcome, left) = refill_and_take(0.0, 0, spec, 1.0, 0);
        assert!(!outcome.allowed);
        assert_eq!(outcome.retry_after_ms, 100);
        assert_eq!(left, 0.0);

        // Refill never exceeds capacity
        let (_, left) = refill_and_take(5.0, 0, spec, 0.0, 60_000);
        assert_eq!(left, 10.0);
    }

    #[test]
    fn test_bucket_fill_time() {
        let spec = BucketSpec {
            rate_per_sec: 10.0,
            capacity: 30.0,
        };
        assert_eq!(spec.fill_time(), Duration::from_secs(3));
        assert_eq!(spec.wait_for(0.5), Duration::from_millis(50));
        assert_eq!(spec.wait_for(0.0), Duration::ZERO);
    }
}
