//! Addresses, ranges and CIDRs.
//!
//! Addresses are plain integers so IPv4 and IPv6 share one arithmetic; the
//! [`Family`] of the configured universe decides how they are printed.

use ipnetwork::IpNetwork;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::ops::{Add, Sub};
use std::str::FromStr;
use thiserror::Error;

/// Number of addresses.
pub type Count = u128;

/// Smallest subnet the allocator manages.
pub const MIN_SUBNET_SIZE: Count = 4;

/// Address parse failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("invalid CIDR {0:?}")]
    InvalidCidr(String),

    #[error("invalid address {0:?}")]
    InvalidAddress(String),

    #[error("CIDR {cidr} is too small: at least {MIN_SUBNET_SIZE} addresses are needed")]
    TooSmall { cidr: String },

    #[error("CIDR {0} has host bits set")]
    HostBitsSet(String),
}

/// IP family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    /// Address width in bits.
    #[must_use]
    pub fn bits(self) -> u8 {
        match self {
            Family::V4 => 32,
            Family::V6 => 128,
        }
    }

    /// Formats an address of this family.
    #[must_use]
    pub fn ip(self, addr: Address) -> IpAddr {
        match self {
            #[allow(clippy::cast_possible_truncation, reason = "v4 addresses fit in 32 bits")]
            Family::V4 => IpAddr::V4(Ipv4Addr::from(addr.0 as u32)),
            Family::V6 => IpAddr::V6(Ipv6Addr::from(addr.0)),
        }
    }
}

/// An address as an integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(pub u128);

impl Address {
    /// Converts an IP address.
    #[must_use]
    pub fn from_ip(ip: IpAddr) -> (Self, Family) {
        match ip {
            IpAddr::V4(v4) => (Address(u128::from(u32::from(v4))), Family::V4),
            IpAddr::V6(v6) => (Address(u128::from(v6)), Family::V6),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add<Count> for Address {
    type Output = Address;

    fn add(self, n: Count) -> Address {
        Address(self.0 + n)
    }
}

impl Sub for Address {
    type Output = Count;

    fn sub(self, other: Address) -> Count {
        self.0 - other.0
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        u128_string::serialize(&self.0, serializer)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        u128_string::deserialize(deserializer).map(Address)
    }
}

/// Serializes `u128` values as decimal strings so they survive any JSON
/// consumer and serde's buffered content paths.
pub mod u128_string {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    /// Serialize as a decimal string.
    ///
    /// # Errors
    ///
    /// Serializer failures.
    pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    /// Deserialize from a decimal string.
    ///
    /// # Errors
    ///
    /// Non-numeric input.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(D::Error::custom)
    }
}

/// Half-open address range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Range {
    pub start: Address,
    pub end: Address,
}

impl Range {
    /// Creates `[start, end)`.
    #[must_use]
    pub fn new(start: Address, end: Address) -> Self {
        Self { start, end }
    }

    /// Number of addresses.
    #[must_use]
    pub fn size(&self) -> Count {
        self.end.0.saturating_sub(self.start.0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    #[must_use]
    pub fn contains(&self, addr: Address) -> bool {
        self.start <= addr && addr < self.end
    }

    /// True when `other` lies entirely inside `self`.
    #[must_use]
    pub fn contains_range(&self, other: &Range) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    #[must_use]
    pub fn overlaps(&self, other: &Range) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Intersection, if non-empty.
    #[must_use]
    pub fn intersect(&self, other: &Range) -> Option<Range> {
        let r = Range::new(self.start.max(other.start), self.end.min(other.end));
        (!r.is_empty()).then_some(r)
    }
}

/// An address with a prefix length, e.g. `10.0.0.5/22`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cidr {
    pub addr: Address,
    pub prefix_len: u8,
    pub family: Family,
}

impl Cidr {
    /// Builds a CIDR.
    ///
    /// # Errors
    ///
    /// Rejects prefixes wider than the family or covering the whole IPv6 space.
    pub fn new(addr: Address, prefix_len: u8, family: Family) -> Result<Self, AddressError> {
        if prefix_len > family.bits() || (family == Family::V6 && prefix_len == 0) {
            return Err(AddressError::InvalidCidr(format!(
                "{}/{}",
                family.ip(addr),
                prefix_len
            )));
        }
        Ok(Self {
            addr,
            prefix_len,
            family,
        })
    }

    /// Number of addresses covered.
    #[must_use]
    pub fn size(&self) -> Count {
        1u128 << (self.family.bits() - self.prefix_len)
    }

    /// The network address (host bits cleared).
    #[must_use]
    pub fn network(&self) -> Address {
        Address(self.addr.0 & !(self.size() - 1))
    }

    /// The whole block.
    #[must_use]
    pub fn range(&self) -> Range {
        let start = self.network();
        Range::new(start, start + self.size())
    }

    /// The block without its network and broadcast addresses.
    #[must_use]
    pub fn host_range(&self) -> Range {
        let r = self.range();
        if r.size() <= 2 {
            return r;
        }
        Range::new(r.start + 1, Address(r.end.0 - 1))
    }

    /// Same prefix, different address.
    #[must_use]
    pub fn with_addr(&self, addr: Address) -> Self {
        Self { addr, ..*self }
    }

    /// True when the host bits are zero.
    #[must_use]
    pub fn is_network(&self) -> bool {
        self.addr == self.network()
    }

    /// Parses a subnet suitable as a universe or allocation range: host bits
    /// clear and at least [`MIN_SUBNET_SIZE`] addresses.
    ///
    /// # Errors
    ///
    /// `HostBitsSet`, `TooSmall` or parse failures.
    pub fn parse_subnet(text: &str) -> Result<Self, AddressError> {
        let cidr: Cidr = text.parse()?;
        if !cidr.is_network() {
            return Err(AddressError::HostBitsSet(text.to_string()));
        }
        if cidr.size() < MIN_SUBNET_SIZE {
            return Err(AddressError::TooSmall {
                cidr: text.to_string(),
            });
        }
        Ok(cidr)
    }

    /// Formats an address in this CIDR's family.
    #[must_use]
    pub fn ip(&self, addr: Address) -> IpAddr {
        self.family.ip(addr)
    }
}

impl FromStr for Cidr {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let net: IpNetwork = s
            .trim()
            .parse()
            .map_err(|_| AddressError::InvalidCidr(s.to_string()))?;
        let (addr, family) = Address::from_ip(net.ip());
        Cidr::new(addr, net.prefix(), family)
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.family.ip(self.addr), self.prefix_len)
    }
}

impl Serialize for Cidr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Cidr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Parses an IP literal in a given family.
///
/// # Errors
///
/// Bad syntax or a family mismatch.
pub fn parse_address(text: &str, family: Family) -> Result<Address, AddressError> {
    let ip: IpAddr = text
        .parse()
        .map_err(|_| AddressError::InvalidAddress(text.to_string()))?;
    let (addr, parsed) = Address::from_ip(ip);
    if parsed == family {
        Ok(addr)
    } else {
        Err(AddressError::InvalidAddress(text.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cidr_parse_and_ranges() {
        let cidr: Cidr = "10.0.0.5/22".parse().expect("cidr");
        assert_eq!(cidr.to_string(), "10.0.0.5/22");
        assert_eq!(cidr.size(), 1024);
        assert_eq!(cidr.family.ip(cidr.network()).to_string(), "10.0.0.0");
        let host = cidr.host_range();
        assert_eq!(host.size(), 1022);
        assert_eq!(cidr.ip(host.start).to_string(), "10.0.0.1");
        assert_eq!(cidr.ip(Address(host.end.0 - 1)).to_string(), "10.0.3.254");
    }

    #[test]
    fn test_parse_subnet_validation() {
        assert!(matches!(Cidr::parse_subnet("10.0.0.5/22"), Err(AddressError::HostBitsSet(_))));
        assert!(matches!(Cidr::parse_subnet("10.0.0.0/31"), Err(AddressError::TooSmall { .. })));
        assert!(Cidr::parse_subnet("10.0.0.0/30").is_ok());
        assert!(Cidr::parse_subnet("fd00::/64").is_ok());
        assert!(Cidr::parse_subnet("not-a-cidr").is_err());
    }

    #[test]
    fn test_range_ops() {
        let a = Range::new(Address(10), Address(20));
        let b = Range::new(Address(15), Address(30));
        assert!(a.overlaps(&b));
        assert_eq!(a.intersect(&b), Some(Range::new(Address(15), Address(20))));
        assert!(!a.overlaps(&Range::new(Address(20), Address(25))));
        assert!(a.contains(Address(19)) && !a.contains(Address(20)));
    }

    #[test]
    fn test_address_serializes_as_string() {
        let json = serde_json::to_string(&Address(u128::MAX)).expect("json");
        assert_eq!(json, format!("\"{}\"", u128::MAX));
        let back: Address = serde_json::from_str(&json).expect("parse");
        assert_eq!(back, Address(u128::MAX));
    }

    #[test]
    fn test_parse_address_family() {
        assert!(parse_address("10.0.0.1", Family::V4).is_ok());
        assert!(parse_address("10.0.0.1", Family::V6).is_err());
        assert!(parse_address("fd00::1", Family::V6).is_ok());
    }
}
