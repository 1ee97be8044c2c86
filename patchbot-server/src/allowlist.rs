//! Source-address allow-list for webhook deliveries.
//!
//! GitHub publishes the address ranges its hook deliveries originate from.
//! When the allow-list is enabled, requests from any other address are
//! rejected before signature verification.

use std::net::IpAddr;

use ipnet::IpNet;
use thiserror::Error;

/// GitHub hook delivery ranges (from `GET /meta`, `hooks` key).
const GITHUB_HOOK_RANGES: &[&str] = &[
    "192.30.252.0/22",
    "185.199.108.0/22",
    "140.82.112.0/20",
    "143.55.64.0/20",
    "2a0a:a440::/29",
    "2606:50c0::/32",
];

const LOOPBACK_RANGES: &[&str] = &["127.0.0.0/8", "::1/128"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllowlistError {
    #[error("invalid CIDR '{0}'")]
    InvalidCidr(String),
}

/// Parse a CIDR block. A bare address is a single-host range.
fn parse_range(s: &str) -> Result<IpNet, AllowlistError> {
    let s = s.trim();
    let invalid = || AllowlistError::InvalidCidr(s.to_string());

    if s.contains('/') {
        return s.parse::<IpNet>().map_err(|_| invalid());
    }
    let addr: IpAddr = s.parse().map_err(|_| invalid())?;
    let host_len = if addr.is_ipv4() { 32 } else { 128 };
    IpNet::new(addr, host_len).map_err(|_| invalid())
}

#[derive(Debug, Clone)]
pub struct IpAllowlist {
    ranges: Vec<IpNet>,
}

impl IpAllowlist {
    /// GitHub's published hook ranges plus loopback.
    pub fn github_hooks() -> Self {
        let ranges = GITHUB_HOOK_RANGES
            .iter()
            .chain(LOOPBACK_RANGES)
            .filter_map(|cidr| parse_range(cidr).ok())
            .collect();
        Self { ranges }
    }

    /// Parse a comma-separated list of CIDR blocks.
    pub fn parse(list: &str) -> Result<Self, AllowlistError> {
        let ranges = list
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(parse_range)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { ranges })
    }

    pub fn allows(&self, ip: IpAddr) -> bool {
        // IPv4-mapped IPv6 addresses are compared as IPv4
        let ip = match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
            v4 => v4,
        };
        self.ranges.iter().any(|range| range.contains(&ip))
    }
}
