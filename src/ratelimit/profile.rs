//! Limit profiles and endpoint matching.
//!
//! A profile is a named set of per-window ceilings. Requests are evaluated
//! against the anonymous or authenticated default profile unless their path
//! matches an endpoint pattern, in which case the endpoint profile replaces
//! the default. When several patterns match, the most specific one wins.

use serde::{Deserialize, Serialize};

use super::window::TimeWindow;

/// Ceilings for each time window plus a short-term burst allowance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitProfile {
    #[serde(default)]
    pub per_second: Option<u64>,
    #[serde(default)]
    pub per_minute: Option<u64>,
    #[serde(default)]
    pub per_hour: Option<u64>,
    #[serde(default)]
    pub per_day: Option<u64>,
    /// Tokens allowed above the per-second ceiling
    #[serde(default)]
    pub burst: u64,
}

impl LimitProfile {
    pub fn anonymous_default() -> Self {
        Self {
            per_second: Some(10),
            per_minute: Some(100),
            per_hour: Some(1_000),
            per_day: Some(10_000),
            burst: 20,
        }
    }

    pub fn authenticated_default() -> Self {
        Self {
            per_second: Some(50),
            per_minute: Some(1_000),
            per_hour: Some(20_000),
            per_day: Some(200_000),
            burst: 100,
        }
    }

    /// The configured ceiling for a window, `None` when the window is not enforced.
    pub fn limit(&self, window: TimeWindow) -> Option<u64> {
        match window {
            TimeWindow::Second => self.per_second,
            TimeWindow::Minute => self.per_minute,
            TimeWindow::Hour => self.per_hour,
            TimeWindow::Day => self.per_day,
        }
    }

    /// The ceiling after applying a degradation multiplier.
    ///
    /// A configured window never scales below one request.
    pub fn scaled(&self, window: TimeWindow, multiplier: f64) -> Option<u64> {
        // Scale in whole thousandths so exact multipliers like 0.7 do not
        // lose a request to float rounding.
        let permille = (multiplier.clamp(0.0, 1.0) * 1000.0).round() as u64;
        self.limit(window).map(|limit| {
            let scaled = (u128::from(limit) * u128::from(permille) / 1000) as u64;
            scaled.max(1)
        })
    }

    /// Windows with a configured ceiling, narrowest first.
    pub fn windows(&self) -> impl Iterator<Item = TimeWindow> + '_ {
        TimeWindow::ALL
            .into_iter()
            .filter(move |w| self.limit(*w).is_some())
    }

    pub fn is_unlimited(&self) -> bool {
        self.windows().next().is_none()
    }
}

/// A profile that applies to requests whose path matches `pattern`.
///
/// Patterns are either an exact path or a prefix ending in `*`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointProfile {
    pub pattern: String,
    #[serde(flatten)]
    pub profile: LimitProfile,
}

impl EndpointProfile {
    pub fn matches(&self, path: &str) -> bool {
        pattern_matches(&self.pattern, path)
    }

    /// Matching weight: longer literal parts are more specific, and an exact
    /// pattern beats a prefix pattern of the same length.
    fn specificity(&self) -> (usize, bool) {
        match self.pattern.strip_suffix('*') {
            Some(prefix) => (prefix.len(), false),
            None => (self.pattern.len(), true),
        }
    }
}

/// Match a path against an exact or `*`-suffixed prefix pattern.
pub fn pattern_matches(pattern: &str, path: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => path.starts_with(prefix),
        None => pattern == path,
    }
}

/// The complete set of profiles known to the limiter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileSet {
    /// Optional ceiling shared by all callers
    #[serde(default)]
    pub global: Option<LimitProfile>,
    #[serde(default = "LimitProfile::anonymous_default")]
    pub anonymous: LimitProfile,
    #[serde(default = "LimitProfile::authenticated_default")]
    pub authenticated: LimitProfile,
    #[serde(default)]
    pub endpoints: Vec<EndpointProfile>,
}

impl Default for ProfileSet {
    fn default() -> Self {
        Self {
            global: None,
            anonymous: LimitProfile::anonymous_default(),
            authenticated: LimitProfile::authenticated_default(),
            endpoints: Vec::new(),
        }
    }
}

/// The profile chosen for one request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedProfile<'a> {
    pub profile: &'a LimitProfile,
    /// The endpoint pattern that matched, if any
    pub pattern: Option<&'a str>,
}

impl ProfileSet {
    /// Pick the profile for a request path and caller kind.
    pub fn resolve(&self, path: &str, authenticated: bool) -> ResolvedProfile<'_> {
        let endpoint = self
            .endpoints
            .iter()
            .filter(|e| e.matches(path))
            .max_by_key(|e| e.specificity());

        match endpoint {
            Some(endpoint) => ResolvedProfile {
                profile: &endpoint.profile,
                pattern: Some(endpoint.pattern.as_str()),
            },
            None if authenticated => ResolvedProfile {
                profile: &self.authenticated,
                pattern: None,
            },
            None => ResolvedProfile {
                profile: &self.anonymous,
                pattern: None,
            },
        }
    }
}
