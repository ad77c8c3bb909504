//! Network infrastructure for multicast discovery.
//!
//! # Sub-modules
//!
//! - **`interfaces`** – Enumerates the host's IPv4 addresses behind the
//!   [`interfaces::AddressSource`] trait.
//!
//! - **`interface_monitor`** – Polls an address source periodically and
//!   reports addresses that were not present in the previous poll.
//!
//! - **`announcer`** – Sends one heartbeat per local address every period,
//!   each one leaving through the interface it advertises.
//!
//! - **`listener`** – Joins the multicast group on every interface the
//!   monitor reports, decodes heartbeats and raises one discovery event per
//!   new domain.

pub mod announcer;
pub mod interface_monitor;
pub mod interfaces;
pub mod listener;

use std::net::SocketAddr;

use thiserror::Error;

/// Error type for setting up the discovery sockets.
///
/// Only startup can fail; once running, socket errors are logged and the
/// affected heartbeat or datagram is skipped.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The UDP socket could not be bound.
    #[error("failed to bind discovery socket on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    /// A socket option could not be applied.
    #[error("failed to set {option} on discovery socket: {source}")]
    SocketOption {
        option: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl DiscoveryError {
    fn option(option: &'static str) -> impl FnOnce(std::io::Error) -> Self {
        move |source| DiscoveryError::SocketOption { option, source }
    }
}
