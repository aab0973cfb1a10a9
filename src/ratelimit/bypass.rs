//! Static allowlist evaluated before any policy.

use std::collections::HashSet;
use std::net::IpAddr;
use std::str::FromStr;

use crate::error::ConfigError;

use super::key::{normalize, AdmissionRequest};

/// An IPv4 or IPv6 network in CIDR notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpNetwork {
    addr: IpAddr,
    prefix_len: u8,
}

impl IpNetwork {
    pub fn new(addr: IpAddr, prefix_len: u8) -> Result<Self, ConfigError> {
        let addr = normalize(addr);
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix_len > max {
            return Err(ConfigError::invalid(
                "bypass.trusted_networks",
                format!("prefix length {} exceeds {} for {}", prefix_len, max, addr),
            ));
        }
        Ok(Self { addr, prefix_len })
    }

    /// Whether `ip` lies inside this network.
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, normalize(ip)) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = u32::MAX
                    .checked_shl(32 - self.prefix_len as u32)
                    .unwrap_or(0);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = u128::MAX
                    .checked_shl(128 - self.prefix_len as u32)
                    .unwrap_or(0);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

impl FromStr for IpNetwork {
    type Err = ConfigError;

    /// Parse `10.0.0.0/8`, `::1/128`, or a bare address meaning one host.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = |reason: &str| {
            ConfigError::invalid("bypass.trusted_networks", format!("{:?}: {}", s, reason))
        };
        let (addr, prefix_len) = match s.trim().split_once('/') {
            Some((addr, len)) => {
                let addr: IpAddr = addr.parse().map_err(|_| bad("invalid address"))?;
                let len: u8 = len.parse().map_err(|_| bad("invalid prefix length"))?;
                (addr, len)
            }
            None => {
                let addr: IpAddr = s.trim().parse().map_err(|_| bad("invalid address"))?;
                let len = match normalize(addr) {
                    IpAddr::V4(_) => 32,
                    IpAddr::V6(_) => 128,
                };
                (addr, len)
            }
        };
        Self::new(addr, prefix_len)
    }
}

impl std::fmt::Display for IpNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

/// Paths and client networks that skip rate limiting entirely.
#[derive(Debug, Clone, Default)]
pub struct Bypass {
    skip_paths: HashSet<String>,
    trusted_networks: Vec<IpNetwork>,
}

impl Bypass {
    pub fn new(
        skip_paths: impl IntoIterator<Item = impl Into<String>>,
        trusted_networks: Vec<IpNetwork>,
    ) -> Self {
        Self {
            skip_paths: skip_paths.into_iter().map(Into::into).collect(),
            trusted_networks,
        }
    }

    /// Exact path match on the skip list, ignoring any query or fragment, or
    /// the client address inside a trusted network.
    pub fn should_bypass(&self, request: &AdmissionRequest) -> bool {
        let path = request.route_path.split(['?', '#']).next().unwrap_or_default();
        self.skip_paths.contains(path)
            || self
                .trusted_networks
                .iter()
                .any(|net| net.contains(request.client_address))
    }
}
