//! Transport adapters that put the admission controller in front of HTTP
//! and gRPC services.
//!
//! The adapters only translate: they extract a [`RequestContext`] from the
//! request and map the [`Decision`] back onto the wire. All policy lives in
//! [`AdmissionController`].
//!
//! [`RequestContext`]: crate::ratelimit::RequestContext
//! [`AdmissionController`]: crate::ratelimit::AdmissionController

mod extract;
mod grpc;
mod http;

use std::sync::Arc;
use std::time::Duration;

use ::http::header::{HeaderMap, HeaderName, HeaderValue};

use crate::config::TransportConfig;
use crate::error::Result;
use crate::ratelimit::{AdmissionController, Decision};

pub use self::extract::{AuthenticatedUser, ClientIpResolver, SkipRules};
pub use self::grpc::{GrpcRateLimitLayer, GrpcRateLimitService};
pub use self::http::{HttpRateLimitLayer, HttpRateLimitService};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
pub const RETRY_AFTER: HeaderName = HeaderName::from_static("retry-after");

/// State shared by every clone of a rate limit layer.
pub(crate) struct LayerState {
    pub admission: Arc<AdmissionController>,
    pub resolver: ClientIpResolver,
    pub skip: SkipRules,
}

impl LayerState {
    pub fn new(
        admission: Arc<AdmissionController>,
        config: &TransportConfig,
        skip: Vec<String>,
    ) -> Result<Self> {
        Ok(Self {
            admission,
            resolver: ClientIpResolver::from_config(config)?,
            skip: SkipRules::new(skip),
        })
    }
}

/// Whole seconds, rounded up, and never zero for a non-zero wait.
pub(crate) fn ceil_secs(d: Duration) -> u64 {
    let secs = d.as_secs();
    if d.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

/// Rate limit headers describing `decision`.
pub(crate) fn quota_headers(decision: &Decision) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Some(quota) = decision.quota {
        headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(quota.limit));
        headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(quota.remaining));
        headers.insert(X_RATELIMIT_RESET, HeaderValue::from(ceil_secs(quota.reset_after)));
    }
    if let Some(retry) = decision.retry_after {
        headers.insert(RETRY_AFTER, HeaderValue::from(ceil_secs(retry).max(1)));
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{DenyReason, Quota, TimeWindow};

    #[test]
    fn test_ceil_secs() {
        assert_eq!(ceil_secs(Duration::ZERO), 0);
        assert_eq!(ceil_secs(Duration::from_millis(200)), 1);
        assert_eq!(ceil_secs(Duration::from_secs(40)), 40);
        assert_eq!(ceil_secs(Duration::from_millis(40_001)), 41);
    }

    #[test]
    fn test_quota_headers() {
        let decision = Decision::deny(
            DenyReason::QuotaExceeded(TimeWindow::Second),
            Some(Quota {
                limit: 10,
                remaining: 0,
                reset_after: Duration::from_millis(900),
            }),
            Some(Duration::from_millis(100)),
        );
        let headers = quota_headers(&decision);

        assert_eq!(headers[&X_RATELIMIT_LIMIT], "10");
        assert_eq!(headers[&X_RATELIMIT_REMAINING], "0");
        assert_eq!(headers[&X_RATELIMIT_RESET], "1");
        assert_eq!(headers[&RETRY_AFTER], "1");

        assert!(quota_headers(&Decision::bypass()).is_empty());
    }
}
