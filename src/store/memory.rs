//! In-process store backed by a concurrent hash map.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use rand::Rng;
use tracing::trace;

use super::{refill_and_take, BucketOutcome, BucketSpec, CounterStore, StoreError};
use crate::clock::{Clock, SystemClock};

/// Roughly one in this many writes sweeps expired entries.
const EVICTION_ODDS: u32 = 256;

#[derive(Debug, Clone)]
enum Slot {
    Counter(u64),
    Bucket { tokens: f64, last_refill_ms: i64 },
    Value(String),
}

#[derive(Debug, Clone)]
struct Entry {
    slot: Slot,
    /// Epoch milliseconds after which the entry is gone
    expires_at_ms: Option<i64>,
}

impl Entry {
    fn is_live(&self, now_ms: i64) -> bool {
        self.expires_at_ms.map_or(true, |at| now_ms < at)
    }
}

/// A single-process [`CounterStore`].
///
/// Each key is guarded by the map's shard lock for the duration of one
/// operation, which makes every operation atomic per key.
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    fn now_ms(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }

    fn expiry(now_ms: i64, ttl: Duration) -> i64 {
        now_ms.saturating_add(ttl.as_millis().min(i64::MAX as u128) as i64)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = self.now_ms();
        self.entries.iter().filter(|e| e.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all expired entries.
    pub fn evict_expired(&self) {
        let now = self.now_ms();
        self.entries.retain(|_, entry| entry.is_live(now));
    }

    fn maybe_evict(&self) {
        if rand::thread_rng().gen_ratio(1, EVICTION_ODDS) {
            trace!("Sweeping expired memory store entries");
            self.evict_expired();
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment(&self, key: &str, amount: u64, ttl: Duration) -> Result<u64, StoreError> {
        self.maybe_evict();
        let now = self.now_ms();

        match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if !entry.is_live(now) {
                    *entry = Entry {
                        slot: Slot::Counter(amount),
                        expires_at_ms: Some(Self::expiry(now, ttl)),
                    };
                    return Ok(amount);
                }
                match &mut entry.slot {
                    Slot::Counter(count) => {
                        *count = count.saturating_add(amount);
                        Ok(*count)
                    }
                    _ => Err(StoreError::Corrupt {
                        key: key.to_string(),
                        detail: "not a counter".to_string(),
                    }),
                }
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(Entry {
                    slot: Slot::Counter(amount),
                    expires_at_ms: Some(Self::expiry(now, ttl)),
                });
                Ok(amount)
            }
        }
    }

    async fn take_tokens(
        &self,
        key: &str,
        spec: BucketSpec,
        cost: u64,
        now_ms: i64,
    ) -> Result<BucketOutcome, StoreError> {
        self.maybe_evict();
        let expires_at_ms = Some(Self::expiry(now_ms, spec.fill_time()));

        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            slot: Slot::Bucket {
                tokens: spec.capacity,
                last_refill_ms: now_ms,
            },
            expires_at_ms,
        });

        if !entry.is_live(now_ms) {
            entry.slot = Slot::Bucket {
                tokens: spec.capacity,
                last_refill_ms: now_ms,
            };
        }

        match &mut entry.slot {
            Slot::Bucket {
                tokens,
                last_refill_ms,
            } => {
                let (outcome, left) =
                    refill_and_take(*tokens, *last_refill_ms, spec, cost as f64, now_ms);
                *tokens = left;
                *last_refill_ms = now_ms.max(*last_refill_ms);
                entry.expires_at_ms = expires_at_ms;
                Ok(outcome)
            }
            _ => Err(StoreError::Corrupt {
                key: key.to_string(),
                detail: "not a token bucket".to_string(),
            }),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = self.now_ms();
        let Some(entry) = self.entries.get(key) else {
            return Ok(None);
        };
        if !entry.is_live(now) {
            return Ok(None);
        }
        Ok(match &entry.slot {
            Slot::Counter(count) => Some(count.to_string()),
            Slot::Value(value) => Some(value.clone()),
            Slot::Bucket { tokens, .. } => Some(tokens.to_string()),
        })
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let now = self.now_ms();
        self.entries.insert(
            key.to_string(),
            Entry {
                slot: Slot::Value(value.to_string()),
                expires_at_ms: ttl.map(|ttl| Self::expiry(now, ttl)),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let now = self.now_ms();
        Ok(self
            .entries
            .remove(key)
            .map_or(false, |(_, entry)| entry.is_live(now)))
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        let now = self.now_ms();
        Ok(self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix) && e.is_live(now))
            .filter_map(|e| match &e.slot {
                Slot::Value(value) => Some((e.key().clone(), value.clone())),
                _ => None,
            })
            .collect())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store() -> (MemoryStore, ManualClock) {
        let clock = ManualClock::default();
        (MemoryStore::with_clock(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn test_increment() {
        let (store, _) = store();
        let ttl = Duration::from_secs(60);

        assert_eq!(store.increment("k", 1, ttl).await.unwrap(), 1);
        assert_eq!(store.increment("k", 4, ttl).await.unwrap(), 5);
        assert_eq!(store.increment("other", 1, ttl).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_increment_restarts_after_expiry() {
        let (store, clock) = store();
        let ttl = Duration::from_secs(1);

        store.increment("k", 3, ttl).await.unwrap();
        clock.advance(Duration::from_millis(1500));

        assert_eq!(store.increment("k", 1, ttl).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_ttl_is_not_extended_by_increments() {
        let (store, clock) = store();
        let ttl = Duration::from_secs(10);

        store.increment("k", 1, ttl).await.unwrap();
        clock.advance(Duration::from_secs(6));
        store.increment("k", 1, ttl).await.unwrap();
        clock.advance(Duration::from_secs(6));

        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_values_expire() {
        let (store, clock) = store();

        store
            .set("a", "1", Some(Duration::from_secs(5)))
            .await
            .unwrap();
        store.set("b", "2", None).await.unwrap();
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("1"));

        clock.advance(Duration::from_secs(6));
        assert_eq!(store.get("a").await.unwrap(), None);
        assert_eq!(store.get("b").await.unwrap().as_deref(), Some("2"));

        store.evict_expired();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_and_scan() {
        let (store, _) = store();

        store.set("ban:user:a", "x", None).await.unwrap();
        store.set("ban:user:b", "y", None).await.unwrap();
        store.set("other", "z", None).await.unwrap();
        store
            .increment("ban:counter", 1, Duration::from_secs(5))
            .await
            .unwrap();

        let mut found = store.scan_prefix("ban:user:").await.unwrap();
        found.sort();
        assert_eq!(
            found,
            vec![
                ("ban:user:a".to_string(), "x".to_string()),
                ("ban:user:b".to_string(), "y".to_string()),
            ]
        );

        assert!(store.delete("ban:user:a").await.unwrap());
        assert!(!store.delete("ban:user:a").await.unwrap());
        assert_eq!(store.scan_prefix("ban:").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_token_bucket_burst_and_refill() {
        let (store, _) = store();
        let spec = BucketSpec {
            rate_per_sec: 10.0,
            capacity: 15.0,
        };

        // Capacity covers the steady rate plus burst
        for _ in 0..15 {
            assert!(store.take_tokens("tb", spec, 1, 0).await.unwrap().allowed);
        }
        let denied = store.take_tokens("tb", spec, 1, 0).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after_ms, 100);

        // Continuous refill: 200ms later two tokens are back
        assert!(store.take_tokens("tb", spec, 2, 200).await.unwrap().allowed);
        assert!(!store.take_tokens("tb", spec, 1, 200).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_type_mismatch_is_corrupt() {
        let (store, _) = store();
        store.set("k", "v", None).await.unwrap();

        let err = store
            .increment("k", 1, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }
}
