//! # Unified Address Space
//!
//! Every address handled by Whip lives in a single, totally ordered 128-bit
//! domain. IPv6 addresses map onto their natural integer value; IPv4
//! addresses are embedded with the IPv4-mapped prefix `::ffff:0:0/96`
//! (RFC 4291, section 2.5.5.2).
//!
//! ```text
//!   0x0000_0000_0000_0000_0000_ffff_0000_0000   0.0.0.0
//!   0x0000_0000_0000_0000_0000_ffff_ffff_ffff   255.255.255.255
//!   0x2001_0db8_....                            native IPv6
//! ```
//!
//! Because the mapped block sits far below all globally routed IPv6 space,
//! IPv4 ranges sort before native IPv6 ranges, and a single byte-ordered
//! key space covers both families.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use thiserror::Error;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Prefix OR-ed into an IPv4 address to obtain its unified value.
const IPV4_MAPPED_PREFIX: u128 = 0xffff_0000_0000;

/// Mask selecting the upper 96 bits of a unified address.
const UPPER_96_MASK: u128 = !0xffff_ffff;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors produced while converting textual addresses.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressError {
    /// The input is neither a dotted-quad IPv4 nor a valid IPv6 address.
    #[error("invalid IP address: {0:?}")]
    InvalidAddress(String),
}

// ------------------------------------------------------------------------------------------------
// Address
// ------------------------------------------------------------------------------------------------

/// Address family of a unified [`Address`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    /// An IPv4 address embedded as `::ffff:a.b.c.d`.
    V4,
    /// Any other 128-bit value.
    V6,
}

/// A point in the unified 128-bit address space.
///
/// Ordering, equality and hashing are those of the underlying integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(u128);

impl Address {
    /// The lowest address (`::`).
    pub const MIN: Address = Address(0);

    /// The highest address (`ffff:ffff:ffff:ffff:ffff:ffff:ffff:ffff`).
    pub const MAX: Address = Address(u128::MAX);

    /// Wraps a raw unified value.
    pub const fn new(value: u128) -> Self {
        Self(value)
    }

    /// Returns the raw unified value.
    pub const fn value(self) -> u128 {
        self.0
    }

    /// Parses a textual IPv4 or IPv6 address into the unified space.
    ///
    /// Surrounding whitespace is ignored.
    pub fn parse(text: &str) -> Result<Self, AddressError> {
        text.trim()
            .parse::<IpAddr>()
            .map(Self::from)
            .map_err(|_| AddressError::InvalidAddress(text.to_owned()))
    }

    /// Returns the address family this value belongs to.
    pub fn family(self) -> Family {
        if self.0 & UPPER_96_MASK == IPV4_MAPPED_PREFIX {
            Family::V4
        } else {
            Family::V6
        }
    }

    /// Converts back into a standard library IP address, un-mapping IPv4.
    pub fn to_ip(self) -> IpAddr {
        match self.family() {
            Family::V4 => IpAddr::V4(Ipv4Addr::from(self.0 as u32)),
            Family::V6 => IpAddr::V6(Ipv6Addr::from(self.0)),
        }
    }

    /// The next address, or `None` at [`Address::MAX`].
    pub fn successor(self) -> Option<Self> {
        self.0.checked_add(1).map(Self)
    }

    /// The previous address, or `None` at [`Address::MIN`].
    pub fn predecessor(self) -> Option<Self> {
        self.0.checked_sub(1).map(Self)
    }
}

impl From<Ipv4Addr> for Address {
    fn from(ip: Ipv4Addr) -> Self {
        Self(IPV4_MAPPED_PREFIX | u128::from(u32::from(ip)))
    }
}

impl From<Ipv6Addr> for Address {
    fn from(ip: Ipv6Addr) -> Self {
        Self(u128::from(ip))
    }
}

impl From<IpAddr> for Address {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => v4.into(),
            IpAddr::V6(v6) => v6.into(),
        }
    }
}

impl From<u128> for Address {
    fn from(value: u128) -> Self {
        Self(value)
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.to_ip().fmt(f)
    }
}

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------
