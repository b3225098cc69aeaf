//! CIDR ranges for `ip_in_range` conditions

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// An IPv4 or IPv6 network in CIDR notation
///
/// A bare address parses as a host route (`/32` or `/128`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpRange {
    network: IpAddr,
    prefix: u8,
}

impl IpRange {
    /// Whether `ip` falls inside this range
    ///
    /// Both sides are compared in IPv6 space with IPv4 widened to its mapped
    /// form, so `::ffff:10.0.0.1` is inside `10.0.0.0/8` while native IPv6
    /// addresses never match an IPv4 range.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        let (network, prefix) = widen(self.network, self.prefix);
        let (addr, _) = widen(*ip, 0);
        let mask = mask_u128(prefix);
        (network & mask) == (addr & mask)
    }
}

fn widen(ip: IpAddr, prefix: u8) -> (u128, u8) {
    match ip {
        IpAddr::V4(v4) => (u128::from(v4.to_ipv6_mapped()), prefix + 96),
        IpAddr::V6(v6) => (u128::from(v6), prefix),
    }
}

fn mask_u128(prefix: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - u32::from(prefix))
    }
}

impl FromStr for IpRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (s, None),
        };

        let network: IpAddr = addr
            .trim()
            .parse()
            .map_err(|_| format!("invalid IP address '{}'", addr))?;

        let max = if network.is_ipv4() { 32 } else { 128 };
        let prefix = match prefix {
            None => max,
            Some(p) => p
                .trim()
                .parse::<u8>()
                .ok()
                .filter(|p| *p <= max)
                .ok_or_else(|| format!("invalid prefix length '{}'", p))?,
        };

        Ok(Self { network, prefix })
    }
}

impl fmt::Display for IpRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}
