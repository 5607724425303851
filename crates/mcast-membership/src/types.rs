//! Address types shared by the registry, the binding and the wire codec.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{AddrParseError, Ipv4Addr};
use std::str::FromStr;

/// Interface index sentinel meaning "resolve the interface by its local address".
pub const ANY_INTERFACE: u32 = 0xFFFF_FFFF;

/// An IPv4 multicast group address.
///
/// Held in network byte order and compared only for equality; the registry
/// never orders groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupAddress(Ipv4Addr);

impl GroupAddress {
    /// Builds a group from its four network-order bytes, as carried on the wire.
    pub const fn from_octets(octets: [u8; 4]) -> Self {
        GroupAddress(Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]))
    }

    pub const fn octets(&self) -> [u8; 4] {
        self.0.octets()
    }

    pub const fn inner(&self) -> Ipv4Addr {
        self.0
    }

    /// Returns true for 224.0.0.0/4.
    pub const fn is_multicast(&self) -> bool {
        self.0.is_multicast()
    }
}

impl fmt::Display for GroupAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for GroupAddress {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<Ipv4Addr>().map(GroupAddress)
    }
}

impl From<Ipv4Addr> for GroupAddress {
    fn from(addr: Ipv4Addr) -> Self {
        GroupAddress(addr)
    }
}

impl From<GroupAddress> for Ipv4Addr {
    fn from(group: GroupAddress) -> Self {
        group.0
    }
}
