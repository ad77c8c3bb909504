//! Local address enumeration.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr};

/// Source of the host's current IPv4 addresses.
#[cfg_attr(test, mockall::automock)]
pub trait AddressSource: Send + Sync {
    /// Returns every local IPv4 address, loopback included.
    fn local_addresses(&self) -> std::io::Result<BTreeSet<Ipv4Addr>>;
}

/// Reads addresses from the operating system via `if-addrs`.
///
/// Loopback is kept so that domains on the same host find each other.
/// IPv6 addresses are skipped; the heartbeat group is IPv4.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAddressSource;

impl AddressSource for SystemAddressSource {
    fn local_addresses(&self) -> std::io::Result<BTreeSet<Ipv4Addr>> {
        Ok(if_addrs::get_if_addrs()?
            .into_iter()
            .filter_map(|iface| match iface.ip() {
                IpAddr::V4(v4) => Some(v4),
                IpAddr::V6(_) => None,
            })
            .collect())
    }
}
