//! Loopback host configuration.

use alloc::vec;
use alloc::vec::Vec;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::network::{IpAddress, IpAddressFamily};

/// Start of the IANA dynamic port range.
pub const DEFAULT_EPHEMERAL_PORT_START: u16 = 49152;
/// End of the IANA dynamic port range.
pub const DEFAULT_EPHEMERAL_PORT_END: u16 = 65535;
/// Kernel buffer size a fresh socket starts with.
pub const DEFAULT_BUFFER_SIZE: u64 = 64 * 1024;
/// Buffer sizes are rounded up to a multiple of this.
pub const BUFFER_GRANULARITY: u64 = 1024;

/// Behaviour of the in-memory loopback network.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct LoopbackConfig {
    /// Local interface addresses. Binding the unspecified address picks
    /// the first one of the socket's family.
    pub interfaces: Vec<IpAddress>,
    /// Local addresses that silently drop connection attempts.
    pub filtered: Vec<IpAddress>,
    pub ephemeral_port_start: u16,
    pub ephemeral_port_end: u16,
    /// Maximum number of simultaneously open sockets.
    pub max_sockets: u32,
    /// Whether TCP sockets can be created at all.
    pub tcp: bool,
    pub ipv6: bool,
    /// Whether IPv6 sockets may accept IPv4 traffic.
    pub dual_stack: bool,
    /// Ticks between `start_bind` and a successful `finish_bind`.
    pub bind_latency_ticks: u32,
    /// Ticks between `start_connect` and the connect outcome.
    pub connect_latency_ticks: u32,
    pub default_buffer_size: u64,
    pub min_buffer_size: u64,
    pub max_buffer_size: u64,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        LoopbackConfig {
            interfaces: vec![IpAddress::localhost_v4(), IpAddress::localhost_v6()],
            filtered: Vec::new(),
            ephemeral_port_start: DEFAULT_EPHEMERAL_PORT_START,
            ephemeral_port_end: DEFAULT_EPHEMERAL_PORT_END,
            max_sockets: 1024,
            tcp: true,
            ipv6: true,
            dual_stack: true,
            bind_latency_ticks: 0,
            connect_latency_ticks: 0,
            default_buffer_size: DEFAULT_BUFFER_SIZE,
            min_buffer_size: 4 * 1024,
            max_buffer_size: 4 * 1024 * 1024,
        }
    }
}

impl LoopbackConfig {
    /// First interface address of `family`.
    pub fn interface_for(&self, family: IpAddressFamily) -> Option<IpAddress> {
        self.interfaces.iter().copied().find(|a| a.family() == family)
    }

    /// Whether `address` is one of this host's own addresses.
    ///
    /// Any address in a loopback range counts as local as long as a
    /// loopback interface of that family is configured.
    pub fn is_local(&self, address: &IpAddress) -> bool {
        if self.interfaces.contains(address) {
            return true;
        }
        address.is_loopback()
            && self
                .interfaces
                .iter()
                .any(|i| i.is_loopback() && i.family() == address.family())
    }

    /// The buffer size the host actually uses when `requested` is asked for.
    pub fn round_buffer_size(&self, requested: u64) -> u64 {
        let rounded = requested
            .checked_next_multiple_of(BUFFER_GRANULARITY)
            .unwrap_or(u64::MAX);
        rounded.clamp(self.min_buffer_size, self.max_buffer_size)
    }

    /// Number of ports in the ephemeral range.
    pub fn ephemeral_port_count(&self) -> u32 {
        if self.ephemeral_port_end < self.ephemeral_port_start {
            return 0;
        }
        (self.ephemeral_port_end - self.ephemeral_port_start) as u32 + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_interfaces() {
        let config = LoopbackConfig::default();
        assert_eq!(
            config.interface_for(IpAddressFamily::Ipv4),
            Some(IpAddress::localhost_v4())
        );
        assert_eq!(
            config.interface_for(IpAddressFamily::Ipv6),
            Some(IpAddress::localhost_v6())
        );
    }

    #[test]
    fn loopback_range_is_local() {
        let config = LoopbackConfig::default();
        assert!(config.is_local(&IpAddress::Ipv4(127, 0, 0, 53)));
        assert!(!config.is_local(&IpAddress::Ipv4(10, 0, 0, 1)));
    }

    #[test]
    fn buffer_rounding_is_deterministic() {
        let config = LoopbackConfig::default();
        assert_eq!(config.round_buffer_size(1), config.min_buffer_size);
        assert_eq!(config.round_buffer_size(10_000), 10_240);
        assert_eq!(config.round_buffer_size(10_000), config.round_buffer_size(10_000));
        assert_eq!(config.round_buffer_size(u64::MAX), config.max_buffer_size);
    }

    #[test]
    fn ephemeral_range_size() {
        let mut config = LoopbackConfig::default();
        assert_eq!(config.ephemeral_port_count(), 16384);
        config.ephemeral_port_start = 5000;
        config.ephemeral_port_end = 5001;
        assert_eq!(config.ephemeral_port_count(), 2);
    }
}
