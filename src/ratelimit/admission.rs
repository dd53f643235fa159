//! Admission control: the single entry point both transports call.
//!
//! A request passes through, in order: the master switch, the allowlist,
//! identity resolution, profile resolution, the degradation policy, the
//! scoped tier, and the optional global tier. Store failures never escape
//! this module; they are resolved by the configured [`FailurePolicy`].

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, trace, warn};

use super::allowlist::Allowlist;
use super::bans::{BanRecord, BanTracker};
use super::decision::{Decision, DenyReason};
use super::degradation::{Admission, DegradationController, DegradationLevel};
use super::identifier::Identifier;
use super::limiter::RateLimiter;
use super::profile::{ProfileSet, ResolvedProfile};
use crate::clock::Clock;
use crate::config::{FailurePolicy, FloodgateConfig};
use crate::error::Result;
use crate::metrics::AdmissionMetrics;
use crate::store::{CounterStore, KeySpace, StoreError};

/// Retry hint returned when the store is down and the policy is fail-closed.
const UNAVAILABLE_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Metric label for requests that matched no endpoint pattern.
const DEFAULT_ENDPOINT_LABEL: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Http,
    Grpc,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Http => "http",
            Transport::Grpc => "grpc",
        }
    }
}

/// What the transports know about a request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Client address after proxy resolution
    pub ip: Option<IpAddr>,
    /// Authenticated user, if any
    pub user: Option<String>,
    /// Request path or gRPC method path
    pub endpoint: String,
    pub transport: Transport,
    /// Units of quota this request consumes
    pub hits: u64,
}

impl RequestContext {
    pub fn new(endpoint: impl Into<String>, transport: Transport) -> Self {
        Self {
            ip: None,
            user: None,
            endpoint: endpoint.into(),
            transport,
            hits: 1,
        }
    }

    pub fn with_ip(mut self, ip: Option<IpAddr>) -> Self {
        self.ip = ip;
        self
    }

    pub fn with_user(mut self, user: Option<String>) -> Self {
        self.user = user.filter(|u| !u.is_empty());
        self
    }

    pub fn with_hits(mut self, hits: u64) -> Self {
        self.hits = hits.max(1);
        self
    }

    /// The caller identity: the user when authenticated, else the address.
    pub fn identity(&self) -> Identifier {
        match (&self.user, self.ip) {
            (Some(user), _) => Identifier::user(user.clone()),
            (None, Some(ip)) => Identifier::ip(ip),
            (None, None) => Identifier::unknown_ip(),
        }
    }
}

/// Point-in-time view of the controller for the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub enabled: bool,
    pub load: f64,
    pub level: DegradationLevel,
    pub multiplier: f64,
    /// `None` when the store could not be read
    pub banned: Option<usize>,
    pub store: &'static str,
    pub failure_policy: FailurePolicy,
    pub store_errors: u64,
}

pub struct AdmissionController {
    enabled: bool,
    failure_policy: FailurePolicy,
    profiles: ProfileSet,
    allowlist: Allowlist,
    limiter: RateLimiter,
    bans: Arc<BanTracker>,
    degradation: Arc<DegradationController>,
    clock: Arc<dyn Clock>,
    store_name: &'static str,
    store_errors: AtomicU64,
    metrics: AdmissionMetrics,
}

impl AdmissionController {
    pub fn new(
        config: &FloodgateConfig,
        store: Arc<dyn CounterStore>,
        degradation: Arc<DegradationController>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let keys = KeySpace::new(config.store.key_prefix.clone());
        let bans = Arc::new(BanTracker::new(store.clone(), keys.clone(), &config.bans));

        Ok(Self {
            enabled: config.rate_limiting.enabled,
            failure_policy: config.rate_limiting.failure_policy,
            profiles: config.rate_limiting.limits.clone(),
            allowlist: Allowlist::from_config(&config.allowlist)?,
            limiter: RateLimiter::new(store.clone(), keys, bans.clone()),
            bans,
            degradation,
            clock,
            store_name: store.name(),
            store_errors: AtomicU64::new(0),
            metrics: AdmissionMetrics,
        })
    }

    pub fn degradation(&self) -> &Arc<DegradationController> {
        &self.degradation
    }

    /// Decide whether a request may proceed.
    pub async fn admit(&self, ctx: &RequestContext) -> Decision {
        let started = Instant::now();
        let identity = ctx.identity();
        let class = identity.class().as_str();
        self.metrics.request(class, ctx.transport.as_str());

        let decision = self.decide(ctx, &identity).await;
        self.metrics.decision_duration(started.elapsed());
        decision
    }

    async fn decide(&self, ctx: &RequestContext, identity: &Identifier) -> Decision {
        let class = identity.class().as_str();

        if !self.enabled {
            self.metrics.bypassed("disabled");
            return Decision::bypass();
        }
        if self.allowlist.permits(ctx.ip, identity) {
            trace!(identifier = %identity, "Allowlisted request");
            self.metrics.bypassed("allowlist");
            return Decision::bypass();
        }

        let resolved = self.profiles.resolve(&ctx.endpoint, ctx.user.is_some());
        let endpoint = resolved.pattern.unwrap_or(DEFAULT_ENDPOINT_LABEL);

        let multiplier = match self
            .degradation
            .policy_for(self.degradation.is_priority(&ctx.endpoint))
        {
            Admission::Admit { multiplier } => multiplier,
            Admission::Shed => {
                debug!(identifier = %identity, endpoint = %ctx.endpoint, "Shedding request under load");
                let reason = DenyReason::Overloaded;
                self.metrics.blocked(class, endpoint, reason.as_str());
                return Decision::deny(reason, None, Some(self.degradation.retry_hint()));
            }
        };

        let decision = match self.evaluate(ctx, identity, resolved, multiplier).await {
            Ok(decision) => decision,
            Err(e) => self.on_store_error(identity, e),
        };

        match decision.deny_reason() {
            None => self.metrics.allowed(class, endpoint),
            Some(reason) => self.metrics.blocked(class, endpoint, reason.as_str()),
        }
        decision
    }

    async fn evaluate(
        &self,
        ctx: &RequestContext,
        identity: &Identifier,
        resolved: ResolvedProfile<'_>,
        multiplier: f64,
    ) -> std::result::Result<Decision, StoreError> {
        let now = self.clock.now();

        let scoped_id = match resolved.pattern {
            Some(pattern) => Identifier::scoped(pattern, identity),
            None => identity.clone(),
        };
        let scoped = self
            .limiter
            .check(&scoped_id, resolved.profile, now, multiplier, ctx.hits)
            .await?;
        if !scoped.is_allowed() {
            return Ok(scoped);
        }

        match &self.profiles.global {
            Some(global) => {
                let global = self
                    .limiter
                    .check(&Identifier::global(), global, now, multiplier, ctx.hits)
                    .await?;
                Ok(scoped.most_restrictive(global))
            }
            None => Ok(scoped),
        }
    }

    fn on_store_error(&self, identity: &Identifier, error: StoreError) -> Decision {
        self.store_errors.fetch_add(1, Ordering::Relaxed);
        self.metrics.store_error("check");
        warn!(
            identifier = %identity,
            error = %error,
            policy = ?self.failure_policy,
            "Counter store unavailable"
        );

        match self.failure_policy {
            FailurePolicy::Open => Decision::fail_open(),
            FailurePolicy::Closed => Decision::deny(
                DenyReason::StoreUnavailable,
                None,
                Some(UNAVAILABLE_RETRY_AFTER),
            ),
        }
    }

    /// Ban an identifier by hand. `None` is permanent.
    pub async fn ban(
        &self,
        id: &Identifier,
        duration: Option<Duration>,
        reason: &str,
    ) -> std::result::Result<BanRecord, StoreError> {
        let record = self.bans.ban(id, duration, reason, self.clock.now()).await?;
        self.refresh_ban_gauge().await;
        Ok(record)
    }

    pub async fn lift_ban(&self, id: &Identifier) -> std::result::Result<bool, StoreError> {
        let lifted = self.bans.lift(id).await?;
        self.refresh_ban_gauge().await;
        Ok(lifted)
    }

    pub async fn list_bans(&self) -> std::result::Result<Vec<BanRecord>, StoreError> {
        self.bans.list(self.clock.now()).await
    }

    pub async fn ban_status(
        &self,
        id: &Identifier,
    ) -> std::result::Result<Option<BanRecord>, StoreError> {
        self.bans.ban_record(id, self.clock.now()).await
    }

    /// Update the banned-identifiers gauge; returns the count when readable.
    pub async fn refresh_ban_gauge(&self) -> Option<usize> {
        match self.bans.count(self.clock.now()).await {
            Ok(count) => {
                self.metrics.banned_identifiers(count);
                Some(count)
            }
            Err(e) => {
                self.metrics.store_error("count_bans");
                warn!(error = %e, "Failed to count bans");
                None
            }
        }
    }

    pub async fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            enabled: self.enabled,
            load: self.degradation.current_load(),
            level: self.degradation.level(),
            multiplier: self.degradation.current_multiplier(),
            banned: self.refresh_ban_gauge().await,
            store: self.store_name,
            failure_policy: self.failure_policy,
            store_errors: self.store_errors.load(Ordering::Relaxed),
        }
    }
}
