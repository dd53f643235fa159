//! Identifier key generation and handling.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::FloodgateError;

/// The kind of origin an identifier describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentifierClass {
    Ip,
    User,
    Endpoint,
    Global,
}

impl IdentifierClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentifierClass::Ip => "ip",
            IdentifierClass::User => "user",
            IdentifierClass::Endpoint => "endpoint",
            IdentifierClass::Global => "global",
        }
    }
}

/// A key that a rate limit is tracked against.
///
/// The textual form is `{class}:{key}`, e.g. `ip:10.0.0.1` or
/// `endpoint:/api/v1/verify|user:alice`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identifier {
    class: IdentifierClass,
    key: String,
}

impl Identifier {
    /// Identifier for a client address.
    ///
    /// IPv4-mapped IPv6 addresses are folded back to IPv4 so a dual-stack
    /// listener does not split one client across two counters.
    pub fn ip(addr: IpAddr) -> Self {
        Self {
            class: IdentifierClass::Ip,
            key: fold_mapped(addr).to_string(),
        }
    }

    /// Fallback used when no client address could be determined.
    pub fn unknown_ip() -> Self {
        Self {
            class: IdentifierClass::Ip,
            key: "unknown".to_string(),
        }
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self {
            class: IdentifierClass::User,
            key: id.into(),
        }
    }

    /// Composite of an endpoint pattern and the caller identity.
    pub fn scoped(pattern: &str, identity: &Identifier) -> Self {
        Self {
            class: IdentifierClass::Endpoint,
            key: format!("{}|{}", pattern, identity),
        }
    }

    pub fn global() -> Self {
        Self {
            class: IdentifierClass::Global,
            key: "*".to_string(),
        }
    }

    pub fn class(&self) -> IdentifierClass {
        self.class
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// The caller a ban or violation applies to.
    ///
    /// Endpoint composites resolve to the identity they wrap; the global
    /// identifier has no subject.
    pub fn subject(&self) -> Option<Identifier> {
        match self.class {
            IdentifierClass::Ip | IdentifierClass::User => Some(self.clone()),
            IdentifierClass::Endpoint => self
                .key
                .split_once('|')
                .and_then(|(_, identity)| identity.parse().ok()),
            IdentifierClass::Global => None,
        }
    }

    /// Whether bans on this identifier are enforced. Only caller identities
    /// are checked against the ban list.
    pub fn is_ban_subject(&self) -> bool {
        matches!(self.class, IdentifierClass::Ip | IdentifierClass::User)
    }

    /// The IP address this identifier names, if it is an IP identifier.
    pub fn ip_addr(&self) -> Option<IpAddr> {
        match self.class {
            IdentifierClass::Ip => self.key.parse().ok(),
            _ => None,
        }
    }
}

/// Fold an IPv4-mapped IPv6 address back to IPv4.
pub(crate) fn fold_mapped(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(IpAddr::V6(v6), IpAddr::V4),
        v4 => v4,
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.class.as_str(), self.key)
    }
}

impl FromStr for Identifier {
    type Err = FloodgateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (class, key) = s
            .split_once(':')
            .ok_or_else(|| FloodgateError::InvalidIdentifier(s.to_string()))?;
        if key.is_empty() {
            return Err(FloodgateError::InvalidIdentifier(s.to_string()));
        }

        match class {
            "ip" => match key.parse::<IpAddr>() {
                Ok(addr) => Ok(Identifier::ip(addr)),
                Err(_) if key == "unknown" => Ok(Identifier::unknown_ip()),
                Err(_) => Err(FloodgateError::InvalidIdentifier(s.to_string())),
            },
            "user" => Ok(Identifier::user(key)),
            "endpoint" => Ok(Identifier {
                class: IdentifierClass::Endpoint,
                key: key.to_string(),
            }),
            "global" => Ok(Identifier::global()),
            _ => Err(FloodgateError::InvalidIdentifier(s.to_string())),
        }
    }
}

impl Serialize for Identifier {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Identifier {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_ip_identifier_folds_mapped_v6() {
        let mapped = IpAddr::V6(Ipv4Addr::new(10, 0, 0, 1).to_ipv6_mapped());
        let id = Identifier::ip(mapped);

        assert_eq!(id.to_string(), "ip:10.0.0.1");
        assert_eq!(id.ip_addr(), Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))));
    }

    #[test]
    fn test_plain_v6_is_kept() {
        let id = Identifier::ip(IpAddr::V6(Ipv6Addr::LOCALHOST));
        assert_eq!(id.to_string(), "ip:::1");
    }

    #[test]
    fn test_scoped_identifier() {
        let user = Identifier::user("alice");
        let scoped = Identifier::scoped("/api/v1/verify*", &user);

        assert_eq!(scoped.class(), IdentifierClass::Endpoint);
        assert_eq!(scoped.to_string(), "endpoint:/api/v1/verify*|user:alice");
    }

    #[test]
    fn test_parse_identifiers() {
        let id: Identifier = "user:alice".parse().unwrap();
        assert_eq!(id, Identifier::user("alice"));

        let id: Identifier = "ip:192.168.1.1".parse().unwrap();
        assert_eq!(id.class(), IdentifierClass::Ip);

        let id: Identifier = "ip:unknown".parse().unwrap();
        assert_eq!(id, Identifier::unknown_ip());

        // Endpoint keys contain further colons
        let id: Identifier = "endpoint:/x|user:bob".parse().unwrap();
        assert_eq!(id.key(), "/x|user:bob");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("alice".parse::<Identifier>().is_err());
        assert!("ip:not-an-ip".parse::<Identifier>().is_err());
        assert!("device:abc".parse::<Identifier>().is_err());
        assert!("user:".parse::<Identifier>().is_err());
    }

    #[test]
    fn test_subject() {
        let ip = Identifier::ip("10.0.0.1".parse().unwrap());
        assert_eq!(ip.subject(), Some(ip.clone()));

        let scoped = Identifier::scoped("/login", &ip);
        assert_eq!(scoped.subject(), Some(ip));

        let scoped = Identifier::scoped("/login", &Identifier::user("a:b"));
        assert_eq!(scoped.subject(), Some(Identifier::user("a:b")));

        assert_eq!(Identifier::global().subject(), None);
    }

    #[test]
    fn test_ban_subjects() {
        assert!(Identifier::ip("10.0.0.1".parse().unwrap()).is_ban_subject());
        assert!(Identifier::user("alice").is_ban_subject());
        assert!(!Identifier::global().is_ban_subject());
        assert!(!Identifier::scoped("/login", &Identifier::user("alice")).is_ban_subject());
    }

    #[test]
    fn test_identifier_equality() {
        let a = Identifier::user("x");
        let b: Identifier = a.to_string().parse().unwrap();
        assert_eq!(a, b);
    }
}
