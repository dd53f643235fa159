//! The result of evaluating a request against its limits.

use std::time::Duration;

use serde::Serialize;

use super::window::TimeWindow;

/// Why a request was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    /// A window ceiling was reached
    QuotaExceeded(TimeWindow),
    /// The identifier is banned
    Banned,
    /// Load shedding rejected a non-priority request
    Overloaded,
    /// The counter store could not be reached and the policy is fail-closed
    StoreUnavailable,
}

impl DenyReason {
    /// Metric label for this reason.
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::QuotaExceeded(_) => "quota_exceeded",
            DenyReason::Banned => "banned",
            DenyReason::Overloaded => "overloaded",
            DenyReason::StoreUnavailable => "store_unavailable",
        }
    }

    /// Whether the client should see this as an ordinary rate limit.
    ///
    /// Bans are reported exactly like exhausted quota so ban state is never
    /// observable from outside.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, DenyReason::QuotaExceeded(_) | DenyReason::Banned)
    }

    /// Stable error code exposed to clients.
    pub fn client_code(&self) -> &'static str {
        match self {
            DenyReason::QuotaExceeded(_) | DenyReason::Banned => "rate_limited",
            DenyReason::Overloaded => "overloaded",
            DenyReason::StoreUnavailable => "rate_limiter_unavailable",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Allow,
    Deny(DenyReason),
}

/// Quota information for the most restrictive window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Quota {
    pub limit: u64,
    pub remaining: u64,
    pub reset_after: Duration,
}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub verdict: Verdict,
    pub quota: Option<Quota>,
    pub retry_after: Option<Duration>,
    /// Admitted without evaluating limits (allowlist, disabled, skip rule)
    pub bypassed: bool,
    /// Admitted because the store failed under a fail-open policy
    pub degraded: bool,
}

impl Decision {
    pub fn allow(quota: Option<Quota>) -> Self {
        Self {
            verdict: Verdict::Allow,
            quota,
            retry_after: None,
            bypassed: false,
            degraded: false,
        }
    }

    pub fn bypass() -> Self {
        Self {
            bypassed: true,
            ..Self::allow(None)
        }
    }

    pub fn fail_open() -> Self {
        Self {
            degraded: true,
            ..Self::allow(None)
        }
    }

    pub fn deny(reason: DenyReason, quota: Option<Quota>, retry_after: Option<Duration>) -> Self {
        Self {
            verdict: Verdict::Deny(reason),
            quota,
            retry_after,
            bypassed: false,
            degraded: false,
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.verdict == Verdict::Allow
    }

    pub fn deny_reason(&self) -> Option<DenyReason> {
        match self.verdict {
            Verdict::Allow => None,
            Verdict::Deny(reason) => Some(reason),
        }
    }

    /// Combine two tier decisions into the one reported to the client.
    ///
    /// A denial always wins. Between two allows, the one with less remaining
    /// quota wins so clients back off against the tightest limit.
    pub fn most_restrictive(self, other: Decision) -> Decision {
        match (self.is_allowed(), other.is_allowed()) {
            (false, _) => self,
            (true, false) => other,
            (true, true) => {
                let degraded = self.degraded || other.degraded;
                let mut winner = match (self.quota, other.quota) {
                    (Some(a), Some(b)) if b.remaining < a.remaining => other,
                    (None, Some(_)) => other,
                    _ => self,
                };
                winner.degraded = degraded;
                winner
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quota(remaining: u64) -> Option<Quota> {
        Some(Quota {
            limit: 10,
            remaining,
            reset_after: Duration::from_secs(1),
        })
    }

    #[test]
    fn test_denial_wins() {
        let allowed = Decision::allow(quota(5));
        let denied = Decision::deny(
            DenyReason::QuotaExceeded(TimeWindow::Minute),
            quota(0),
            Some(Duration::from_secs(30)),
        );

        let combined = allowed.clone().most_restrictive(denied.clone());
        assert_eq!(combined, denied);

        let combined = denied.clone().most_restrictive(allowed);
        assert_eq!(combined, denied);
    }

    #[test]
    fn test_smaller_remaining_wins() {
        let a = Decision::allow(quota(5));
        let b = Decision::allow(quota(2));

        assert_eq!(a.clone().most_restrictive(b.clone()).quota, quota(2));
        assert_eq!(b.most_restrictive(a).quota, quota(2));
    }

    #[test]
    fn test_degraded_flag_propagates() {
        let a = Decision::allow(quota(5));
        let b = Decision::fail_open();

        let combined = a.most_restrictive(b);
        assert!(combined.is_allowed());
        assert!(combined.degraded);
        assert_eq!(combined.quota, quota(5));
    }

    #[test]
    fn test_ban_looks_like_quota_to_clients() {
        assert!(DenyReason::Banned.is_rate_limited());
        assert_eq!(
            DenyReason::Banned.client_code(),
            DenyReason::QuotaExceeded(TimeWindow::Second).client_code()
        );
        assert!(!DenyReason::StoreUnavailable.is_rate_limited());
        assert_eq!(DenyReason::StoreUnavailable.client_code(), "rate_limiter_unavailable");
    }
}
