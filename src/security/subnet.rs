//! Subnet parsing and matching.
//!
//! # Responsibilities
//! - Parse allow-list entries: single addresses, CIDR blocks, bracketed
//!   IPv6 and host names
//! - Match client addresses against a parsed subnet
//!
//! # Design Decisions
//! - IPv4 and IPv6 share one representation (network + prefix length)
//! - IPv4-mapped IPv6 clients are matched as IPv4
//! - Host names are resolved once, at construction

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use thiserror::Error;

/// Error raised for a single allow-list entry.
#[derive(Debug, Error)]
pub enum SubnetError {
    #[error("empty subnet entry")]
    Empty,

    #[error("invalid address in {0:?}")]
    InvalidAddress(String),

    #[error("invalid prefix length in {entry:?}: {prefix}")]
    InvalidPrefix { entry: String, prefix: String },

    #[error("cannot resolve host {host:?}: {source}")]
    Unresolvable {
        host: String,
        source: std::io::Error,
    },
}

/// A network address and prefix length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subnet {
    network: IpAddr,
    prefix_len: u8,
}

impl Subnet {
    /// Build a subnet, masking off host bits of `addr`.
    pub fn new(addr: IpAddr, prefix_len: u8) -> Option<Self> {
        let addr = addr.to_canonical();
        let max = max_prefix(addr);
        if prefix_len > max {
            return None;
        }
        let network = match addr {
            IpAddr::V4(v4) => IpAddr::V4((u32::from(v4) & mask_v4(prefix_len)).into()),
            IpAddr::V6(v6) => IpAddr::V6((u128::from(v6) & mask_v6(prefix_len)).into()),
        };
        Some(Self {
            network,
            prefix_len,
        })
    }

    /// A subnet matching exactly one address.
    pub fn host(addr: IpAddr) -> Self {
        let addr = addr.to_canonical();
        Self {
            network: addr,
            prefix_len: max_prefix(addr),
        }
    }

    /// Parse an entry that may also be a host name.
    ///
    /// Host names resolve to one subnet per address, without blocking the
    /// runtime.
    pub async fn resolve(entry: &str) -> Result<Vec<Subnet>, SubnetError> {
        let entry = entry.trim();
        match entry.parse::<Subnet>() {
            Ok(subnet) => Ok(vec![subnet]),
            Err(SubnetError::InvalidAddress(_)) if is_host_name(entry) => {
                let addrs = tokio::net::lookup_host((entry, 0))
                    .await
                    .map_err(|source| SubnetError::Unresolvable {
                        host: entry.to_string(),
                        source,
                    })?;
                let mut subnets: Vec<Subnet> = addrs.map(|a| Subnet::host(a.ip())).collect();
                subnets.dedup();
                Ok(subnets)
            }
            Err(e) => Err(e),
        }
    }

    pub fn network(&self) -> IpAddr {
        self.network
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Whether `ip` lies inside this subnet.
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.network, ip.to_canonical()) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                u32::from(ip) & mask_v4(self.prefix_len) == u32::from(net)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                u128::from(ip) & mask_v6(self.prefix_len) == u128::from(net)
            }
            _ => false,
        }
    }
}

impl FromStr for Subnet {
    type Err = SubnetError;

    fn from_str(entry: &str) -> Result<Self, Self::Err> {
        let entry = entry.trim();
        if entry.is_empty() {
            return Err(SubnetError::Empty);
        }

        let (addr, prefix) = match entry.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (entry, None),
        };
        let addr = addr
            .strip_prefix('[')
            .and_then(|a| a.strip_suffix(']'))
            .unwrap_or(addr);
        let ip: IpAddr = addr
            .parse()
            .map_err(|_| SubnetError::InvalidAddress(entry.to_string()))?;

        match prefix {
            None => Ok(Subnet::host(ip)),
            Some(prefix) => {
                let bad_prefix = || SubnetError::InvalidPrefix {
                    entry: entry.to_string(),
                    prefix: prefix.to_string(),
                };
                let len: u8 = prefix.parse().map_err(|_| bad_prefix())?;
                Subnet::new(ip, len).ok_or_else(bad_prefix)
            }
        }
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

fn max_prefix(addr: IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

fn mask_v4(prefix_len: u8) -> u32 {
    match prefix_len {
        0 => 0,
        n => u32::MAX << (32 - u32::from(n)),
    }
}

fn mask_v6(prefix_len: u8) -> u128 {
    match prefix_len {
        0 => 0,
        n => u128::MAX << (128 - u32::from(n)),
    }
}

fn is_host_name(entry: &str) -> bool {
    !entry.is_empty()
        && !entry.contains('/')
        && entry
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
        && entry.chars().any(|c| c.is_ascii_alphabetic())
}
