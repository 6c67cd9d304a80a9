//! `wasi:sockets/network`: addresses and the network capability.
//!
//! A [`Network`] is an opaque authorization token. Sockets record the
//! first network they are bound or connected through and refuse to be
//! used with any other one afterwards.

use core::fmt;
use core::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use core::sync::atomic::{AtomicU32, Ordering};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Network types
// ---------------------------------------------------------------------------

/// IP address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum IpAddressFamily {
    Ipv4,
    Ipv6,
}

/// An IP address (v4 or v6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum IpAddress {
    Ipv4(u8, u8, u8, u8),
    Ipv6([u16; 8]),
}

impl IpAddress {
    pub const fn localhost_v4() -> Self {
        IpAddress::Ipv4(127, 0, 0, 1)
    }

    pub const fn localhost_v6() -> Self {
        IpAddress::Ipv6([0, 0, 0, 0, 0, 0, 0, 1])
    }

    /// `0.0.0.0` or `::`.
    pub const fn unspecified(family: IpAddressFamily) -> Self {
        match family {
            IpAddressFamily::Ipv4 => IpAddress::Ipv4(0, 0, 0, 0),
            IpAddressFamily::Ipv6 => IpAddress::Ipv6([0; 8]),
        }
    }

    pub fn family(&self) -> IpAddressFamily {
        match self {
            IpAddress::Ipv4(..) => IpAddressFamily::Ipv4,
            IpAddress::Ipv6(..) => IpAddressFamily::Ipv6,
        }
    }

    pub fn is_unspecified(&self) -> bool {
        IpAddr::from(*self).is_unspecified()
    }

    pub fn is_loopback(&self) -> bool {
        IpAddr::from(*self).is_loopback()
    }

    /// Multicast and the IPv4 limited broadcast address can never be the
    /// endpoint of a TCP connection.
    pub fn is_unicast(&self) -> bool {
        match IpAddr::from(*self) {
            IpAddr::V4(v4) => !v4.is_multicast() && !v4.is_broadcast(),
            IpAddr::V6(v6) => !v6.is_multicast(),
        }
    }

    /// `::ffff:a.b.c.d`.
    pub fn is_ipv4_mapped(&self) -> bool {
        match self {
            IpAddress::Ipv6(segments) => Ipv6Addr::from(*segments).to_ipv4_mapped().is_some(),
            IpAddress::Ipv4(..) => false,
        }
    }
}

impl From<IpAddress> for IpAddr {
    fn from(address: IpAddress) -> Self {
        match address {
            IpAddress::Ipv4(a, b, c, d) => IpAddr::V4(Ipv4Addr::new(a, b, c, d)),
            IpAddress::Ipv6(segments) => IpAddr::V6(Ipv6Addr::from(segments)),
        }
    }
}

impl From<IpAddr> for IpAddress {
    fn from(address: IpAddr) -> Self {
        match address {
            IpAddr::V4(v4) => {
                let [a, b, c, d] = v4.octets();
                IpAddress::Ipv4(a, b, c, d)
            }
            IpAddr::V6(v6) => IpAddress::Ipv6(v6.segments()),
        }
    }
}

impl fmt::Display for IpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&IpAddr::from(*self), f)
    }
}

/// A socket address = IP + port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct IpSocketAddress {
    pub address: IpAddress,
    pub port: u16,
}

impl IpSocketAddress {
    pub const fn new(address: IpAddress, port: u16) -> Self {
        Self { address, port }
    }

    /// The "any interface, ephemeral port" address for `family`.
    pub const fn unspecified(family: IpAddressFamily) -> Self {
        Self::new(IpAddress::unspecified(family), 0)
    }

    pub fn family(&self) -> IpAddressFamily {
        self.address.family()
    }

    /// Whether this can be the target of `connect`: a concrete unicast
    /// address and a non-zero port.
    pub fn is_valid_remote(&self) -> bool {
        self.port != 0 && !self.address.is_unspecified() && self.address.is_unicast()
    }
}

impl From<IpSocketAddress> for SocketAddr {
    fn from(addr: IpSocketAddress) -> Self {
        match addr.address {
            IpAddress::Ipv4(a, b, c, d) => {
                SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(a, b, c, d), addr.port))
            }
            IpAddress::Ipv6(segments) => {
                SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::from(segments), addr.port, 0, 0))
            }
        }
    }
}

impl From<SocketAddr> for IpSocketAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().into(), addr.port())
    }
}

impl fmt::Display for IpSocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&SocketAddr::from(*self), f)
    }
}

// ---------------------------------------------------------------------------
// Network capability
// ---------------------------------------------------------------------------

static NEXT_NETWORK: AtomicU32 = AtomicU32::new(1);

/// Opaque network capability handle.
///
/// Two handles are equal only if they were produced by the same call to
/// [`Network::new`] (copies compare equal).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Network(u32);

impl Network {
    pub fn new() -> Self {
        Network(NEXT_NETWORK.fetch_add(1, Ordering::Relaxed))
    }

    pub fn id(&self) -> u32 {
        self.0
    }
}

impl Default for Network {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_address_family() {
        assert_eq!(IpAddress::localhost_v4().family(), IpAddressFamily::Ipv4);
        assert_eq!(IpAddress::localhost_v6().family(), IpAddressFamily::Ipv6);
    }

    #[test]
    fn unspecified_addresses() {
        assert!(IpAddress::unspecified(IpAddressFamily::Ipv4).is_unspecified());
        assert!(IpAddress::unspecified(IpAddressFamily::Ipv6).is_unspecified());
        assert!(!IpAddress::localhost_v4().is_unspecified());
    }

    #[test]
    fn remote_address_validity() {
        let ok = IpSocketAddress::new(IpAddress::localhost_v4(), 80);
        assert!(ok.is_valid_remote());
        let zero_port = IpSocketAddress::new(IpAddress::localhost_v4(), 0);
        assert!(!zero_port.is_valid_remote());
        let wildcard = IpSocketAddress::new(IpAddress::unspecified(IpAddressFamily::Ipv6), 80);
        assert!(!wildcard.is_valid_remote());
        let multicast = IpSocketAddress::new(IpAddress::Ipv4(224, 0, 0, 1), 80);
        assert!(!multicast.is_valid_remote());
        let broadcast = IpSocketAddress::new(IpAddress::Ipv4(255, 255, 255, 255), 80);
        assert!(!broadcast.is_valid_remote());
    }

    #[test]
    fn ipv4_mapped_detection() {
        let mapped = IpAddress::Ipv6([0, 0, 0, 0, 0, 0xffff, 0x7f00, 0x0001]);
        assert!(mapped.is_ipv4_mapped());
        assert!(!IpAddress::localhost_v6().is_ipv4_mapped());
    }

    #[test]
    fn socket_addr_conversion() {
        let addr = IpSocketAddress::new(IpAddress::Ipv4(10, 1, 2, 3), 8080);
        let std_addr = SocketAddr::from(addr);
        assert_eq!(std_addr.port(), 8080);
        assert_eq!(IpSocketAddress::from(std_addr), addr);
        assert_eq!(alloc::format!("{}", addr), "10.1.2.3:8080");
    }

    #[test]
    fn networks_are_distinct() {
        let a = Network::new();
        let b = Network::new();
        assert_ne!(a, b);
        let copy = a;
        assert_eq!(a, copy);
    }
}
