//! Deadline decorator for store calls.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{BucketOutcome, BucketSpec, CounterStore, StoreError};

/// Wraps a store so that no call outlives the configured timeout.
///
/// The limiter sits on the request path; a slow store must surface as an
/// error the failure policy can act on rather than as request latency.
pub struct BoundedStore {
    inner: Arc<dyn CounterStore>,
    timeout: Duration,
}

impl BoundedStore {
    pub fn new(inner: Arc<dyn CounterStore>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn bounded<T>(
        &self,
        fut: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| StoreError::Timeout)?
    }
}

#[async_trait]
impl CounterStore for BoundedStore {
    async fn increment(&self, key: &str, amount: u64, ttl: Duration) -> Result<u64, StoreError> {
        self.bounded(self.inner.increment(key, amount, ttl)).await
    }

    async fn take_tokens(
        &self,
        key: &str,
        spec: BucketSpec,
        cost: u64,
        now_ms: i64,
    ) -> Result<BucketOutcome, StoreError> {
        self.bounded(self.inner.take_tokens(key, spec, cost, now_ms))
            .await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.bounded(self.inner.get(key)).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.bounded(self.inner.set(key, value, ttl)).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.bounded(self.inner.delete(key)).await
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        self.bounded(self.inner.scan_prefix(prefix)).await
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}
