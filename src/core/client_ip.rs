//! Client IP resolution behind reverse proxies.
//!
//! The resolver walks `X-Forwarded-For` from the hop nearest to the gateway
//! outwards and stops at the first address that is not part of a trusted
//! proxy network. Loopback, link-local and private ranges are trusted, so an
//! internet client can never forge its address by sending its own header.

use std::{net::IpAddr, str::FromStr};

use axum::http::HeaderMap;
use once_cell::sync::Lazy;
use thiserror::Error;

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Networks whose hops are trusted when resolving the client address.
static TRUSTED_PROXY_NETWORKS: Lazy<Vec<IpNetwork>> = Lazy::new(|| {
    [
        "127.0.0.0/8",
        "::1/128",
        "169.254.0.0/16",
        "fe80::/10",
        "10.0.0.0/8",
        "172.16.0.0/12",
        "192.168.0.0/16",
        "fc00::/7",
    ]
    .iter()
    .filter_map(|cidr| cidr.parse().ok())
    .collect()
});

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetworkParseError {
    #[error("invalid IP address '{0}'")]
    Address(String),
    #[error("invalid prefix length '{0}'")]
    Prefix(String),
    #[error("prefix length {prefix} exceeds {max}")]
    PrefixTooLong { prefix: u8, max: u8 },
}

/// CIDR network, e.g. `10.0.0.0/8`. A bare address is a single-host network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpNetwork {
    base: IpAddr,
    prefix: u8,
}

impl IpNetwork {
    pub fn new(base: IpAddr, prefix: u8) -> Result<Self, NetworkParseError> {
        let max = address_width(base);
        if prefix > max {
            return Err(NetworkParseError::PrefixTooLong { prefix, max });
        }
        Ok(Self { base, prefix })
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        let (net, addr) = match (self.base, ip.to_canonical()) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => (u32::from(net) as u128, u32::from(addr) as u128),
            (IpAddr::V6(net), IpAddr::V6(addr)) => (u128::from(net), u128::from(addr)),
            _ => return false,
        };
        if self.prefix == 0 {
            return true;
        }
        let shift = address_width(self.base) - self.prefix;
        (net ^ addr) >> shift == 0
    }
}

impl FromStr for IpNetwork {
    type Err = NetworkParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (s, None),
        };
        let base = IpAddr::from_str(addr.trim())
            .map_err(|_| NetworkParseError::Address(addr.to_string()))?;
        let prefix = match prefix {
            Some(p) => p
                .trim()
                .parse()
                .map_err(|_| NetworkParseError::Prefix(p.to_string()))?,
            None => address_width(base),
        };
        Self::new(base, prefix)
    }
}

fn address_width(ip: IpAddr) -> u8 {
    match ip {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

/// Whether a hop belongs to a network trusted to report client addresses.
pub fn is_trusted_proxy(ip: IpAddr) -> bool {
    TRUSTED_PROXY_NETWORKS.iter().any(|net| net.contains(ip))
}

fn parse_hop(raw: &str) -> Option<IpAddr> {
    let trimmed = raw.trim().trim_start_matches('[').trim_end_matches(']');
    IpAddr::from_str(trimmed).ok().map(|ip| ip.to_canonical())
}

/// Resolve the real client address from the socket peer and any
/// `X-Forwarded-For` chain.
///
/// Returns `None` only when neither a peer address nor a parseable forwarded
/// hop is available.
pub fn resolve_client_ip(headers: &HeaderMap, peer: Option<IpAddr>) -> Option<IpAddr> {
    let peer = peer.map(|ip| ip.to_canonical());
    let forwarded: Vec<&str> = headers
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .collect();

    if forwarded.is_empty() {
        return peer;
    }

    if let Some(peer) = peer {
        if !is_trusted_proxy(peer) {
            return Some(peer);
        }
    }

    for raw in forwarded.iter().rev() {
        // An unparseable hop poisons everything to its left.
        let Some(hop) = parse_hop(raw) else {
            return peer;
        };
        if !is_trusted_proxy(hop) {
            return Some(hop);
        }
    }

    // Every hop is trusted: the leftmost entry is the furthest from us.
    forwarded.first().and_then(|raw| parse_hop(raw)).or(peer)
}
