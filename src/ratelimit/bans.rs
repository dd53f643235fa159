//! Violation tracking and bans.
//!
//! Every denied request counts as a violation against the caller. When the
//! count within one violation window passes `max_attempts`, the caller is
//! banned for `ban_duration`. Operators can also ban and lift bans by hand;
//! a manual ban without a duration never expires.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::identifier::{Identifier, IdentifierClass};
use crate::config::BanConfig;
use crate::store::{CounterStore, KeySpace, StoreError};

/// A ban as persisted in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanRecord {
    pub identifier: Identifier,
    pub started_at: DateTime<Utc>,
    /// `None` for a permanent ban
    pub expires_at: Option<DateTime<Utc>>,
    /// Violations counted when the ban was triggered; zero for manual bans
    pub violations: u64,
    pub reason: String,
}

impl BanRecord {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }

    pub fn is_permanent(&self) -> bool {
        self.expires_at.is_none()
    }
}

/// Records violations and answers ban queries against the counter store.
pub struct BanTracker {
    store: Arc<dyn CounterStore>,
    keys: KeySpace,
    enabled: bool,
    max_attempts: u64,
    violation_window: Duration,
    ban_duration: Duration,
}

impl BanTracker {
    pub fn new(store: Arc<dyn CounterStore>, keys: KeySpace, config: &BanConfig) -> Self {
        Self {
            store,
            keys,
            enabled: config.enabled,
            max_attempts: config.max_attempts,
            violation_window: Duration::from_secs(config.violation_window_secs.max(1)),
            ban_duration: Duration::from_secs(config.ban_duration_secs),
        }
    }

    /// Whether violations are counted toward automatic bans.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Count a violation and ban the identifier once it crosses the threshold.
    ///
    /// Returns the new record when this call triggered a ban.
    pub async fn record_violation(
        &self,
        id: &Identifier,
        now: DateTime<Utc>,
    ) -> Result<Option<BanRecord>, StoreError> {
        if !self.enabled || id.class() == IdentifierClass::Global {
            return Ok(None);
        }

        let window_secs = self.violation_window.as_secs() as i64;
        let bucket = now.timestamp().div_euclid(window_secs) * window_secs;
        let count = self
            .store
            .increment(&self.keys.violations(id, bucket), 1, self.violation_window)
            .await?;

        if count <= self.max_attempts {
            return Ok(None);
        }
        // Concurrent violations past the threshold must not stack bans
        if self.ban_record(id, now).await?.is_some() {
            return Ok(None);
        }

        let record = BanRecord {
            identifier: id.clone(),
            started_at: now,
            expires_at: Some(now + chrono_duration(self.ban_duration)),
            violations: count,
            reason: format!(
                "exceeded {} violations within {}s",
                self.max_attempts, window_secs
            ),
        };
        self.write(&record, Some(self.ban_duration)).await?;

        info!(
            identifier = %id,
            violations = count,
            duration_secs = self.ban_duration.as_secs(),
            "Identifier banned"
        );
        Ok(Some(record))
    }

    pub async fn is_banned(&self, id: &Identifier, now: DateTime<Utc>) -> Result<bool, StoreError> {
        Ok(self.ban_record(id, now).await?.is_some())
    }

    /// The active ban for `id`, if any.
    pub async fn ban_record(
        &self,
        id: &Identifier,
        now: DateTime<Utc>,
    ) -> Result<Option<BanRecord>, StoreError> {
        let key = self.keys.ban(id);
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(None);
        };
        let record = decode(&key, &raw)?;
        Ok(record.is_active(now).then_some(record))
    }

    /// Ban `id` by hand. A `None` duration is permanent.
    pub async fn ban(
        &self,
        id: &Identifier,
        duration: Option<Duration>,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<BanRecord, StoreError> {
        let record = BanRecord {
            identifier: id.clone(),
            started_at: now,
            expires_at: duration.map(|d| now + chrono_duration(d)),
            violations: 0,
            reason: reason.into(),
        };
        self.write(&record, duration).await?;

        info!(
            identifier = %id,
            permanent = record.is_permanent(),
            reason = %record.reason,
            "Manual ban applied"
        );
        Ok(record)
    }

    /// Remove any ban on `id`; returns whether one existed.
    pub async fn lift(&self, id: &Identifier) -> Result<bool, StoreError> {
        let lifted = self.store.delete(&self.keys.ban(id)).await?;
        if lifted {
            info!(identifier = %id, "Ban lifted");
        }
        Ok(lifted)
    }

    /// All active bans, oldest first.
    pub async fn list(&self, now: DateTime<Utc>) -> Result<Vec<BanRecord>, StoreError> {
        let mut records: Vec<BanRecord> = self
            .store
            .scan_prefix(&self.keys.ban_prefix())
            .await?
            .into_iter()
            .filter_map(|(key, raw)| match decode(&key, &raw) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping unreadable ban record");
                    None
                }
            })
            .filter(|record| record.is_active(now))
            .collect();

        records.sort_by_key(|r| r.started_at);
        Ok(records)
    }

    pub async fn count(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        Ok(self.list(now).await?.len())
    }

    async fn write(&self, record: &BanRecord, ttl: Option<Duration>) -> Result<(), StoreError> {
        let key = self.keys.ban(&record.identifier);
        let raw = serde_json::to_string(record).map_err(|e| StoreError::Corrupt {
            key: key.clone(),
            detail: e.to_string(),
        })?;
        self.store.set(&key, &raw, ttl).await
    }
}

fn decode(key: &str, raw: &str) -> Result<BanRecord, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        detail: e.to_string(),
    })
}

fn chrono_duration(d: Duration) -> ChronoDuration {
    ChronoDuration::from_std(d).unwrap_or_else(|_| ChronoDuration::days(36_500))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::store::MemoryStore;

    fn tracker(clock: &ManualClock, max_attempts: u64) -> BanTracker {
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        let config = BanConfig {
            max_attempts,
            ..BanConfig::default()
        };
        BanTracker::new(store, KeySpace::default(), &config)
    }

    #[tokio::test]
    async fn test_ban_triggers_after_threshold() {
        let clock = ManualClock::default();
        let bans = tracker(&clock, 3);
        let id = Identifier::user("mallory");
        let now = clock.now();

        for _ in 0..3 {
            assert!(bans.record_violation(&id, now).await.unwrap().is_none());
        }
        assert!(!bans.is_banned(&id, now).await.unwrap());

        let record = bans.record_violation(&id, now).await.unwrap().unwrap();
        assert_eq!(record.violations, 4);
        assert_eq!(record.expires_at, Some(now + ChronoDuration::seconds(3600)));
        assert!(bans.is_banned(&id, now).await.unwrap());

        // Further violations do not re-trigger
        assert!(bans.record_violation(&id, now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ban_expires() {
        let clock = ManualClock::default();
        let bans = tracker(&clock, 1);
        let id = Identifier::ip("10.1.1.1".parse().unwrap());

        bans.record_violation(&id, clock.now()).await.unwrap();
        assert!(bans.record_violation(&id, clock.now()).await.unwrap().is_some());

        clock.advance(Duration::from_secs(3601));
        assert!(!bans.is_banned(&id, clock.now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_disabled_tracker_ignores_violations() {
        let clock = ManualClock::default();
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        let config = BanConfig {
            enabled: false,
            max_attempts: 1,
            ..BanConfig::default()
        };
        let bans = BanTracker::new(store, KeySpace::default(), &config);
        let id = Identifier::user("eve");

        for _ in 0..5 {
            assert!(bans.record_violation(&id, clock.now()).await.unwrap().is_none());
        }
        assert!(!bans.is_banned(&id, clock.now()).await.unwrap());

        // Manual bans still apply
        bans.ban(&id, None, "abuse report", clock.now()).await.unwrap();
        assert!(bans.is_banned(&id, clock.now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_global_identifier_never_banned() {
        let clock = ManualClock::default();
        let bans = tracker(&clock, 1);

        for _ in 0..5 {
            assert!(bans
                .record_violation(&Identifier::global(), clock.now())
                .await
                .unwrap()
                .is_none());
        }
    }

    #[tokio::test]
    async fn test_manual_ban_lift_and_list() {
        let clock = ManualClock::default();
        let bans = tracker(&clock, 100);
        let alice = Identifier::user("alice");
        let bob = Identifier::user("bob");

        let permanent = bans.ban(&alice, None, "fraud", clock.now()).await.unwrap();
        assert!(permanent.is_permanent());

        clock.advance(Duration::from_secs(1));
        bans.ban(&bob, Some(Duration::from_secs(60)), "spam", clock.now())
            .await
            .unwrap();

        let listed = bans.list(clock.now()).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].identifier, alice);

        // Banning again overwrites rather than duplicating
        bans.ban(&bob, Some(Duration::from_secs(60)), "spam", clock.now())
            .await
            .unwrap();
        assert_eq!(bans.count(clock.now()).await.unwrap(), 2);

        clock.advance(Duration::from_secs(120));
        assert_eq!(bans.count(clock.now()).await.unwrap(), 1);
        assert!(bans.is_banned(&alice, clock.now()).await.unwrap());

        assert!(bans.lift(&alice).await.unwrap());
        assert!(!bans.lift(&alice).await.unwrap());
        assert!(!bans.is_banned(&alice, clock.now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_record_is_an_error() {
        let clock = ManualClock::default();
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        let keys = KeySpace::default();
        let id = Identifier::user("alice");
        store.set(&keys.ban(&id), "not json", None).await.unwrap();

        let bans = BanTracker::new(store, keys, &BanConfig::default());
        let err = bans.is_banned(&id, clock.now()).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
        assert!(bans.list(clock.now()).await.unwrap().is_empty());
    }
}
