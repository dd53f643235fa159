//! Callers that bypass limits and bans entirely.

use std::collections::HashSet;
use std::net::IpAddr;

use ipnet::IpNet;

use super::identifier::{fold_mapped, Identifier};
use crate::config::AllowlistConfig;
use crate::error::{FloodgateError, Result};

#[derive(Debug, Clone, Default)]
pub struct Allowlist {
    networks: Vec<IpNet>,
    identifiers: HashSet<String>,
}

impl Allowlist {
    pub fn from_config(config: &AllowlistConfig) -> Result<Self> {
        let networks = config
            .networks
            .iter()
            .map(|n| parse_network(n))
            .collect::<Result<Vec<_>>>()?;

        // Round-trip through Identifier so `ip:::ffff:1.2.3.4` and
        // `ip:1.2.3.4` compare equal.
        let identifiers = config
            .identifiers
            .iter()
            .map(|s| s.parse::<Identifier>().map(|id| id.to_string()))
            .collect::<Result<HashSet<_>>>()?;

        Ok(Self {
            networks,
            identifiers,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty() && self.identifiers.is_empty()
    }

    /// Whether a caller at `ip` with identity `identifier` is allowlisted.
    pub fn permits(&self, ip: Option<IpAddr>, identifier: &Identifier) -> bool {
        if self.identifiers.contains(&identifier.to_string()) {
            return true;
        }
        ip.map(fold_mapped)
            .is_some_and(|ip| self.networks.iter().any(|net| net.contains(&ip)))
    }
}

/// Parse a CIDR range or a bare address.
pub(crate) fn parse_network(s: &str) -> Result<IpNet> {
    let s = s.trim();
    s.parse::<IpNet>()
        .or_else(|_| s.parse::<IpAddr>().map(IpNet::from))
        .map_err(|_| FloodgateError::Config(format!("invalid network: {}", s)))
}
