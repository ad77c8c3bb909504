//! DiscoveryListener: receives heartbeats and raises discovery events.
//!
//! The socket is bound to the group port with address reuse so that several
//! domains on one host can listen at once.  Group membership is not taken
//! at bind time: every address the [`InterfaceMonitor`] reports triggers a
//! join on that interface, so adapters that come up later are covered too.
//!
//! Per datagram: an oversized, foreign-version or malformed heartbeat is
//! dropped and logged; a heartbeat for an unseen domain raises exactly one
//! [`DomainInfo`] event; a heartbeat for a known domain only refreshes the
//! stored copy.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use backplane_core::{decode_heartbeat, DomainInfo, DomainKey, ProtocolError, MAX_HEARTBEAT_SIZE};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::interface_monitor::InterfaceMonitor;
use super::interfaces::AddressSource;
use super::DiscoveryError;
use crate::application::session_registry::DiscoveryCache;

/// Queue depth for discovery events.
const EVENT_QUEUE: usize = 64;

/// First delay after a failed receive; doubles per consecutive failure.
const RECV_RETRY_BASE: Duration = Duration::from_millis(50);
const RECV_RETRY_MAX: Duration = Duration::from_secs(2);

/// Listener settings.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub group: SocketAddrV4,
    /// Receive buffer size.  Datagrams longer than
    /// [`ListenerConfig::datagram_limit`] are dropped.
    pub receive_buffer_size: usize,
    pub interface_poll_period: Duration,
}

impl ListenerConfig {
    /// Largest datagram accepted.  The decoder never accepts more than
    /// [`MAX_HEARTBEAT_SIZE`], so a larger buffer does not raise the limit.
    pub fn datagram_limit(&self) -> usize {
        self.receive_buffer_size.min(MAX_HEARTBEAT_SIZE)
    }
}

/// Spaces out retries while the socket keeps failing.
#[derive(Debug, Default)]
struct RecvBackoff {
    failures: u32,
}

impl RecvBackoff {
    /// Records one failure and returns how long to wait before the next receive.
    fn failed(&mut self) -> Duration {
        let delay = RECV_RETRY_BASE
            .saturating_mul(1 << self.failures.min(6))
            .min(RECV_RETRY_MAX);
        self.failures = self.failures.saturating_add(1);
        delay
    }

    fn succeeded(&mut self) {
        self.failures = 0;
    }
}

/// Deduplicates decoded heartbeats by [`DomainKey`].
#[derive(Debug, Default)]
pub struct DomainTracker {
    known: HashMap<DomainKey, DomainInfo>,
}

impl DomainTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `info` and returns it if its domain was not known yet.
    ///
    /// A known domain has its stored copy replaced with `info`.
    pub fn observe(&mut self, info: DomainInfo) -> Option<DomainInfo> {
        match self.known.entry(info.dedup_key()) {
            Entry::Occupied(mut known) => {
                known.insert(info);
                None
            }
            Entry::Vacant(slot) => {
                slot.insert(info.clone());
                Some(info)
            }
        }
    }

    /// Decodes one datagram of at most `max_size` bytes and observes it.
    ///
    /// # Errors
    ///
    /// Returns the [`ProtocolError`] for a datagram that is not a valid
    /// heartbeat; the tracker is unchanged in that case.
    pub fn process_datagram(
        &mut self,
        datagram: &[u8],
        max_size: usize,
    ) -> Result<Option<DomainInfo>, ProtocolError> {
        if datagram.len() > max_size {
            return Err(ProtocolError::Oversized {
                size: datagram.len(),
                max: max_size,
            });
        }
        let info = decode_heartbeat(datagram)?;
        Ok(self.observe(info))
    }

    /// Removes `key`; its next heartbeat is treated as new.
    pub fn forget(&mut self, key: &DomainKey) -> bool {
        self.known.remove(key).is_some()
    }

    pub fn get(&self, key: &DomainKey) -> Option<&DomainInfo> {
        self.known.get(key)
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }
}

/// Handle to a running listener.
///
/// Implements [`DiscoveryCache`] so the session registry can make the
/// listener forget a domain.  Forget requests are never dropped while the
/// listener runs; there is at most one outstanding per known domain.
#[derive(Clone)]
pub struct ListenerHandle {
    forget_tx: mpsc::UnboundedSender<DomainKey>,
}

impl DiscoveryCache for ListenerHandle {
    fn forget(&self, key: &DomainKey) {
        if self.forget_tx.send(key.clone()).is_err() {
            debug!(domain = %key, "discovery listener stopped; nothing to forget");
        }
    }
}

pub struct DiscoveryListener {
    socket: UdpSocket,
    config: ListenerConfig,
    monitor: InterfaceMonitor,
    tracker: DomainTracker,
}

impl DiscoveryListener {
    /// Binds the multicast port with `SO_REUSEADDR` (and `SO_REUSEPORT` on
    /// unix).  Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError`] if the socket cannot be set up.
    pub fn bind(
        config: ListenerConfig,
        addresses: Arc<dyn AddressSource>,
    ) -> Result<Self, DiscoveryError> {
        let socket = bind_reusable(config.group)?;
        info!(group = %config.group, "discovery listener bound");
        Ok(Self {
            socket,
            monitor: InterfaceMonitor::new(addresses),
            tracker: DomainTracker::new(),
            config,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Starts the interface monitor and the receive loop.
    ///
    /// The loop ends when the returned event receiver is dropped.
    pub fn launch(self) -> (ListenerHandle, mpsc::Receiver<DomainInfo>, JoinHandle<()>) {
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);
        let (forget_tx, forget_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(self.run(event_tx, forget_rx));
        (ListenerHandle { forget_tx }, event_rx, task)
    }

    async fn run(
        self,
        events: mpsc::Sender<DomainInfo>,
        mut forget_rx: mpsc::UnboundedReceiver<DomainKey>,
    ) {
        let Self {
            socket,
            config,
            monitor,
            mut tracker,
        } = self;
        let group = *config.group.ip();
        let mut new_interfaces = monitor.spawn(config.interface_poll_period);
        // One spare byte tells a datagram that exactly fits from one that was truncated.
        let limit = config.datagram_limit();
        let mut buf = vec![0u8; limit + 1];
        let mut backoff = RecvBackoff::default();

        loop {
            tokio::select! {
                Some(interface) = new_interfaces.recv() => {
                    match socket.join_multicast_v4(group, interface) {
                        Ok(()) => info!(%group, %interface, "joined multicast group"),
                        Err(e) => warn!(%group, %interface, error = %e, "failed to join multicast group"),
                    }
                }
                Some(key) = forget_rx.recv() => {
                    if tracker.forget(&key) {
                        debug!(domain = %key, "domain forgotten");
                    }
                }
                received = socket.recv_from(&mut buf) => {
                    let (len, src) = match received {
                        Ok(pair) => {
                            backoff.succeeded();
                            pair
                        }
                        Err(e) => {
                            let delay = backoff.failed();
                            warn!(error = %e, retry_in = ?delay, "discovery recv error");
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                    };
                    match tracker.process_datagram(&buf[..len], limit) {
                        Ok(Some(info)) => {
                            info!(%src, domain = %info, "new domain heard");
                            if events.send(info).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => debug!(%src, error = %e, "dropping heartbeat"),
                    }
                }
                _ = events.closed() => break,
            }
        }
        info!("discovery listener stopped");
    }
}

fn bind_reusable(group: SocketAddrV4) -> Result<UdpSocket, DiscoveryError> {
    // Windows refuses to bind a multicast address; elsewhere binding the group
    // keeps unrelated unicast traffic on the port out.
    let bind_ip = if cfg!(windows) {
        Ipv4Addr::UNSPECIFIED
    } else {
        *group.ip()
    };
    let addr = SocketAddr::from((bind_ip, group.port()));

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|source| DiscoveryError::Bind { addr, source })?;
    socket
        .set_reuse_address(true)
        .map_err(DiscoveryError::option("SO_REUSEADDR"))?;
    #[cfg(unix)]
    socket
        .set_reuse_port(true)
        .map_err(DiscoveryError::option("SO_REUSEPORT"))?;
    socket
        .set_nonblocking(true)
        .map_err(DiscoveryError::option("O_NONBLOCK"))?;
    socket
        .bind(&addr.into())
        .map_err(|source| DiscoveryError::Bind { addr, source })?;
    UdpSocket::from_std(socket.into()).map_err(|source| DiscoveryError::Bind { addr, source })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
