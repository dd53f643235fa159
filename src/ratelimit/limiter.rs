//! Core rate limiter implementation.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, trace, warn};

use super::bans::BanTracker;
use super::decision::{Decision, DenyReason, Quota};
use super::identifier::Identifier;
use super::profile::LimitProfile;
use super::window::TimeWindow;
use crate::metrics::AdmissionMetrics;
use crate::store::{BucketSpec, CounterStore, KeySpace, StoreError};

/// Retry hint for a banned caller whose profile enforces no window.
const BANNED_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Evaluates one identifier against one profile.
///
/// The per-second window is a continuously refilling token bucket with the
/// profile's burst on top; longer windows are fixed buckets aligned to the
/// epoch. This struct holds no request state and can be shared across
/// tasks.
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    keys: KeySpace,
    bans: Arc<BanTracker>,
    metrics: AdmissionMetrics,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, keys: KeySpace, bans: Arc<BanTracker>) -> Self {
        Self {
            store,
            keys,
            bans,
            metrics: AdmissionMetrics,
        }
    }

    /// Check `hits` requests from `id` against `profile`, with every ceiling
    /// scaled by `multiplier`.
    ///
    /// Windows are evaluated narrowest first and evaluation stops at the
    /// first denial, so a rejected request is not charged to longer windows.
    pub async fn check(
        &self,
        id: &Identifier,
        profile: &LimitProfile,
        now: DateTime<Utc>,
        multiplier: f64,
        hits: u64,
    ) -> Result<Decision, StoreError> {
        let subject = id.subject();

        if let Some(subject) = &subject {
            if self.bans.is_banned(subject, now).await? {
                debug!(identifier = %id, subject = %subject, "Request from banned identifier");
                return Ok(banned(profile, multiplier, hits, now));
            }
        }

        trace!(identifier = %id, hits = hits, multiplier = multiplier, "Checking rate limit");

        let mut tightest: Option<Quota> = None;
        for window in profile.windows() {
            let Some(limit) = profile.scaled(window, multiplier) else {
                continue;
            };

            let (quota, denied_retry) = match window {
                TimeWindow::Second => self.take_burst(id, limit, profile.burst, hits, now).await?,
                _ => self.count_window(id, window, limit, hits, now).await?,
            };

            if let Some(retry_after) = denied_retry {
                debug!(
                    identifier = %id,
                    window = %window,
                    limit = quota.limit,
                    "Rate limit exceeded"
                );
                if let Some(subject) = &subject {
                    self.record_violation(subject, now).await;
                }
                return Ok(Decision::deny(
                    DenyReason::QuotaExceeded(window),
                    Some(quota),
                    Some(retry_after),
                ));
            }

            tightest = match tightest {
                Some(current) if current.remaining <= quota.remaining => Some(current),
                _ => Some(quota),
            };
        }

        Ok(Decision::allow(tightest))
    }

    /// Take tokens from the per-second bucket.
    async fn take_burst(
        &self,
        id: &Identifier,
        limit: u64,
        burst: u64,
        hits: u64,
        now: DateTime<Utc>,
    ) -> Result<(Quota, Option<Duration>), StoreError> {
        let spec = bucket_spec(limit, burst);
        let outcome = self
            .store
            .take_tokens(&self.keys.bucket(id), spec, hits, now.timestamp_millis())
            .await?;

        let quota = Quota {
            limit: limit.saturating_add(burst),
            remaining: outcome.remaining,
            reset_after: spec.wait_for(spec.capacity - outcome.remaining as f64),
        };
        let retry = (!outcome.allowed).then(|| Duration::from_millis(outcome.retry_after_ms));
        Ok((quota, retry))
    }

    /// Charge a fixed window counter.
    async fn count_window(
        &self,
        id: &Identifier,
        window: TimeWindow,
        limit: u64,
        hits: u64,
        now: DateTime<Utc>,
    ) -> Result<(Quota, Option<Duration>), StoreError> {
        let key = self.keys.window(id, window, window.bucket(now));
        let count = self.store.increment(&key, hits, window.duration()).await?;

        let reset_after = window.reset_after(now);
        let quota = Quota {
            limit,
            remaining: limit.saturating_sub(count),
            reset_after,
        };
        Ok((quota, (count > limit).then_some(reset_after)))
    }

    /// Violations are best effort: the request is already denied, so a store
    /// failure here is logged rather than turning the denial into an error.
    async fn record_violation(&self, subject: &Identifier, now: DateTime<Utc>) {
        match self.bans.record_violation(subject, now).await {
            Ok(Some(_)) => self.metrics.ban_triggered(),
            Ok(None) => {}
            Err(e) => {
                self.metrics.store_error("record_violation");
                warn!(identifier = %subject, error = %e, "Failed to record violation");
            }
        }
    }
}

fn bucket_spec(limit: u64, burst: u64) -> BucketSpec {
    BucketSpec {
        rate_per_sec: limit as f64,
        capacity: limit.saturating_add(burst) as f64,
    }
}

/// The decision reported for a banned caller.
///
/// Shaped like a denial by the narrowest window with nothing left in it,
/// so the response does not tell the caller it is banned.
fn banned(profile: &LimitProfile, multiplier: f64, hits: u64, now: DateTime<Utc>) -> Decision {
    let narrowest = profile
        .windows()
        .find_map(|w| profile.scaled(w, multiplier).map(|limit| (w, limit)));
    let Some((window, limit)) = narrowest else {
        return Decision::deny(DenyReason::Banned, None, Some(BANNED_RETRY_AFTER));
    };

    let (quota, retry_after) = match window {
        TimeWindow::Second => {
            let spec = bucket_spec(limit, profile.burst);
            let quota = Quota {
                limit: limit.saturating_add(profile.burst),
                remaining: 0,
                reset_after: spec.wait_for(spec.capacity),
            };
            (quota, spec.wait_for(hits as f64))
        }
        _ => {
            let reset_after = window.reset_after(now);
            let quota = Quota {
                limit,
                remaining: 0,
                reset_after,
            };
            (quota, reset_after)
        }
    };
    Decision::deny(DenyReason::Banned, Some(quota), Some(retry_after))
}
