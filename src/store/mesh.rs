//! Gossip-replicated store for deployments without a central Redis.
//!
//! Counters converge across replicas within a few gossip rounds, so limits
//! are enforced approximately: a burst spread over several nodes can exceed
//! a ceiling by up to one gossip interval's worth of traffic. Token buckets
//! cannot be shared over gossip at all; each node runs its own bucket with
//! the rate and capacity divided by the number of live nodes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{BucketOutcome, BucketSpec, CounterStore, MemoryStore, StoreError};
use crate::clock::Clock;
use crate::mesh::{Cluster, CounterKey, RegisterValue};

/// Minimum lifetime of a deletion marker.
const TOMBSTONE_TTL: Duration = Duration::from_secs(86_400);

pub struct MeshStore {
    cluster: Arc<Cluster>,
    buckets: MemoryStore,
    clock: Arc<dyn Clock>,
}

impl MeshStore {
    pub fn new(cluster: Arc<Cluster>, clock: Arc<dyn Clock>) -> Self {
        Self {
            cluster,
            buckets: MemoryStore::with_clock(clock.clone()),
            clock,
        }
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    fn now_ms(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }

    fn expiry(now_ms: i64, ttl: Duration) -> i64 {
        now_ms.saturating_add(ttl.as_millis().min(i64::MAX as u128) as i64)
    }

    /// Remove this node's expired keys from its gossip state.
    pub async fn collect_garbage(&self) -> usize {
        self.buckets.evict_expired();
        self.cluster.gc_expired(self.now_ms()).await
    }
}

#[async_trait]
impl CounterStore for MeshStore {
    async fn increment(&self, key: &str, amount: u64, ttl: Duration) -> Result<u64, StoreError> {
        let now = self.now_ms();
        Ok(self
            .cluster
            .increment_counter(&CounterKey::new(key), amount, Self::expiry(now, ttl), now)
            .await)
    }

    async fn take_tokens(
        &self,
        key: &str,
        spec: BucketSpec,
        cost: u64,
        now_ms: i64,
    ) -> Result<BucketOutcome, StoreError> {
        let nodes = self.cluster.live_node_count().await.max(1) as f64;
        let local = BucketSpec {
            rate_per_sec: spec.rate_per_sec / nodes,
            capacity: (spec.capacity / nodes).max(1.0),
        };
        self.buckets.take_tokens(key, local, cost, now_ms).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = self.now_ms();
        Ok(self
            .cluster
            .get_register(key)
            .await
            .filter(|v| v.expires_ms.map_or(true, |at| now < at))
            .and_then(|v| v.value))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let now = self.now_ms();
        self.cluster
            .set_register(
                key,
                &RegisterValue {
                    written_ms: now,
                    expires_ms: ttl.map(|ttl| Self::expiry(now, ttl)),
                    value: Some(value.to_string()),
                },
            )
            .await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let now = self.now_ms();
        let writes = self.cluster.register_writes(key).await;
        let existed = writes
            .iter()
            .max_by_key(|v| v.written_ms)
            .map_or(false, |v| v.value.is_some() && v.expires_ms.map_or(true, |at| now < at));

        // The tombstone must outlive every write it shadows, or GC would
        // bring an older value back.
        let expires_ms = writes.iter().try_fold(
            Self::expiry(now, TOMBSTONE_TTL),
            |latest, v| v.expires_ms.map(|at| latest.max(at)),
        );
        self.cluster
            .set_register(
                key,
                &RegisterValue {
                    written_ms: now,
                    expires_ms,
                    value: None,
                },
            )
            .await;
        Ok(existed)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        Ok(self
            .cluster
            .scan_registers(prefix, self.now_ms())
            .await
            .into_iter()
            .filter_map(|(key, v)| v.value.map(|value| (key, value)))
            .collect())
    }

    fn name(&self) -> &'static str {
        "mesh"
    }
}
