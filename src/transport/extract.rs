//! Caller identity extraction.
//!
//! Forwarding headers are only believed when the direct peer is a trusted
//! proxy; otherwise any client could claim any address.

use std::net::{IpAddr, SocketAddr};

use http::header::{HeaderMap, HeaderName};
use http::Extensions;
use ipnet::IpNet;

use crate::config::TransportConfig;
use crate::error::{FloodgateError, Result};
use crate::ratelimit::{parse_network, pattern_matches};

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_REAL_IP: HeaderName = HeaderName::from_static("x-real-ip");

/// Request extension set by an upstream authentication layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser(pub String);

#[derive(Debug, Clone)]
pub struct ClientIpResolver {
    trusted_proxies: Vec<IpNet>,
    user_header: HeaderName,
}

impl ClientIpResolver {
    pub fn new(trusted_proxies: Vec<IpNet>, user_header: HeaderName) -> Self {
        Self {
            trusted_proxies,
            user_header,
        }
    }

    pub fn from_config(config: &TransportConfig) -> Result<Self> {
        let trusted_proxies = config
            .trusted_proxies
            .iter()
            .map(|p| parse_network(p))
            .collect::<Result<Vec<_>>>()?;
        let user_header = HeaderName::from_bytes(config.user_header.to_ascii_lowercase().as_bytes())
            .map_err(|e| {
                FloodgateError::Config(format!("invalid user header {:?}: {}", config.user_header, e))
            })?;
        Ok(Self::new(trusted_proxies, user_header))
    }

    pub fn is_trusted(&self, ip: IpAddr) -> bool {
        self.trusted_proxies.iter().any(|net| net.contains(&ip))
    }

    /// Resolve the client address for a request received from `peer`.
    pub fn client_ip(&self, peer: Option<IpAddr>, headers: &HeaderMap) -> Option<IpAddr> {
        let peer = peer?;
        if !self.is_trusted(peer) {
            return Some(peer);
        }

        let hops: Vec<&str> = headers
            .get_all(&X_FORWARDED_FOR)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|hop| !hop.is_empty())
            .collect();

        // Right to left: the nearest hop was appended by our own proxy
        for hop in hops.iter().rev() {
            match parse_hop(hop) {
                Some(ip) if self.is_trusted(ip) => continue,
                Some(ip) => return Some(ip),
                None => break,
            }
        }

        headers
            .get(&X_REAL_IP)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| parse_hop(v.trim()))
            .or(Some(peer))
    }

    /// The authenticated caller, if any.
    ///
    /// An [`AuthenticatedUser`] extension always wins. The user header is
    /// only honored when set by a trusted proxy.
    pub fn user(
        &self,
        peer: Option<IpAddr>,
        headers: &HeaderMap,
        extensions: &Extensions,
    ) -> Option<String> {
        if let Some(AuthenticatedUser(user)) = extensions.get::<AuthenticatedUser>() {
            return Some(user.clone());
        }
        if !peer.is_some_and(|p| self.is_trusted(p)) {
            return None;
        }
        headers
            .get(&self.user_header)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    }
}

/// Accepts bare addresses, `addr:port`, and bracketed IPv6.
fn parse_hop(hop: &str) -> Option<IpAddr> {
    hop.parse::<IpAddr>()
        .ok()
        .or_else(|| hop.parse::<SocketAddr>().ok().map(|s| s.ip()))
        .or_else(|| {
            hop.strip_prefix('[')
                .and_then(|h| h.strip_suffix(']'))
                .and_then(|h| h.parse().ok())
        })
}

/// Paths or gRPC methods that bypass the limiter.
#[derive(Debug, Clone, Default)]
pub struct SkipRules {
    patterns: Vec<String>,
}

impl SkipRules {
    pub fn new(patterns: Vec<String>) -> Self {
        Self { patterns }
    }

    pub fn matches(&self, path: &str) -> bool {
        self.patterns.iter().any(|p| pattern_matches(p, path))
    }
}
