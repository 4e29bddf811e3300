//! Network prefixes for the DDoS mitigation service.
//!
//! IPv4 and IPv6 prefixes share one tagged type so that resolver and
//! ban-list logic is written once and only the storage layer is split
//! by address family.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while building prefixes
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PrefixError {
    #[error("invalid CIDR notation: {0}")]
    InvalidCidr(String),
    #[error("prefix length {length} is out of range for {family}")]
    InvalidPrefixLength { family: &'static str, length: u8 },
}

/// A network address plus prefix length, tagged by address family.
///
/// Host bits are always cleared, so `10.1.2.3/8` and `10.0.0.0/8` are the
/// same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CidrMask {
    V4 { network: Ipv4Addr, prefix_len: u8 },
    V6 { network: Ipv6Addr, prefix_len: u8 },
}

impl CidrMask {
    pub fn new(address: IpAddr, prefix_len: u8) -> Result<Self, PrefixError> {
        match address {
            IpAddr::V4(v4) => Self::v4(v4, prefix_len),
            IpAddr::V6(v6) => Self::v6(v6, prefix_len),
        }
    }

    pub fn v4(address: Ipv4Addr, prefix_len: u8) -> Result<Self, PrefixError> {
        if prefix_len > 32 {
            return Err(PrefixError::InvalidPrefixLength { family: "IPv4", length: prefix_len });
        }
        let network = u32::from(address) & mask_v4(prefix_len);
        Ok(CidrMask::V4 { network: Ipv4Addr::from(network), prefix_len })
    }

    pub fn v6(address: Ipv6Addr, prefix_len: u8) -> Result<Self, PrefixError> {
        if prefix_len > 128 {
            return Err(PrefixError::InvalidPrefixLength { family: "IPv6", length: prefix_len });
        }
        let network = u128::from(address) & mask_v6(prefix_len);
        Ok(CidrMask::V6 { network: Ipv6Addr::from(network), prefix_len })
    }

    /// Single-host prefix (/32 or /128) for an address
    pub fn host(address: IpAddr) -> Self {
        match address {
            IpAddr::V4(network) => CidrMask::V4 { network, prefix_len: 32 },
            IpAddr::V6(network) => CidrMask::V6 { network, prefix_len: 128 },
        }
    }

    pub fn network(&self) -> IpAddr {
        match self {
            CidrMask::V4 { network, .. } => IpAddr::V4(*network),
            CidrMask::V6 { network, .. } => IpAddr::V6(*network),
        }
    }

    pub fn prefix_len(&self) -> u8 {
        match self {
            CidrMask::V4 { prefix_len, .. } | CidrMask::V6 { prefix_len, .. } => *prefix_len,
        }
    }

    pub fn is_ipv6(&self) -> bool {
        matches!(self, CidrMask::V6 { .. })
    }

    pub fn is_host(&self) -> bool {
        match self {
            CidrMask::V4 { prefix_len, .. } => *prefix_len == 32,
            CidrMask::V6 { prefix_len, .. } => *prefix_len == 128,
        }
    }

    pub fn contains(&self, address: &IpAddr) -> bool {
        match (self, address) {
            (CidrMask::V4 { network, prefix_len }, IpAddr::V4(ip)) => {
                let mask = mask_v4(*prefix_len);
                (u32::from(*network) & mask) == (u32::from(*ip) & mask)
            }
            (CidrMask::V6 { network, prefix_len }, IpAddr::V6(ip)) => {
                let mask = mask_v6(*prefix_len);
                (u128::from(*network) & mask) == (u128::from(*ip) & mask)
            }
            _ => false,
        }
    }
}

impl fmt::Display for CidrMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network(), self.prefix_len())
    }
}

impl FromStr for CidrMask {
    type Err = PrefixError;

    /// Parses `address/length`; a bare address is read as a host prefix.
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let input = input.trim();
        let (address, prefix_len) = match input.split_once('/') {
            Some((address, length)) => {
                let length: u8 = length
                    .parse()
                    .map_err(|_| PrefixError::InvalidCidr(input.to_string()))?;
                (address, Some(length))
            }
            None => (input, None),
        };

        let address: IpAddr = address
            .parse()
            .map_err(|_| PrefixError::InvalidCidr(input.to_string()))?;

        match prefix_len {
            Some(length) => CidrMask::new(address, length),
            None => Ok(CidrMask::host(address)),
        }
    }
}

impl TryFrom<String> for CidrMask {
    type Error = PrefixError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CidrMask> for String {
    fn from(value: CidrMask) -> Self {
        value.to_string()
    }
}

fn mask_v4(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - prefix_len as u32)
    }
}

fn mask_v6(prefix_len: u8) -> u128 {
    if prefix_len == 0 {
        0
    } else {
        u128::MAX << (128 - prefix_len as u32)
    }
}
