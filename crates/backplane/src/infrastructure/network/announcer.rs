//! DiscoveryAnnouncer: periodic multicast heartbeats.
//!
//! One cycle enumerates the local addresses, queues one heartbeat per
//! address and sends them back-to-back.  Each heartbeat advertises the
//! address it leaves from, so a host with several adapters is announced once
//! per adapter.  When the queue is empty the announcer sleeps one period and
//! starts over.  A failed send drops that heartbeat only.

use std::collections::{BTreeSet, VecDeque};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backplane_core::{encode_heartbeat, DomainInfo};
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::interfaces::AddressSource;
use super::DiscoveryError;

/// Sends one heartbeat datagram out of a given interface.
#[async_trait]
pub trait HeartbeatTransport: Send + Sync {
    async fn send_from(&self, interface: Ipv4Addr, payload: &[u8]) -> std::io::Result<()>;
}

/// Multicast UDP sender with loopback enabled.
///
/// The outbound interface is switched before every send; only the announcer
/// task uses the socket, so the switch and the send never interleave.
pub struct MulticastSender {
    socket: UdpSocket,
    group: SocketAddrV4,
}

impl MulticastSender {
    /// Binds an ephemeral IPv4 UDP socket for sending to `group`.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError`] if the socket cannot be created, configured
    /// or bound.
    pub fn bind(group: SocketAddrV4) -> Result<Self, DiscoveryError> {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|source| DiscoveryError::Bind { addr, source })?;
        socket
            .set_multicast_loop_v4(true)
            .map_err(DiscoveryError::option("IP_MULTICAST_LOOP"))?;
        socket
            .set_nonblocking(true)
            .map_err(DiscoveryError::option("O_NONBLOCK"))?;
        socket
            .bind(&addr.into())
            .map_err(|source| DiscoveryError::Bind { addr, source })?;
        let socket = UdpSocket::from_std(socket.into())
            .map_err(|source| DiscoveryError::Bind { addr, source })?;
        Ok(Self { socket, group })
    }
}

#[async_trait]
impl HeartbeatTransport for MulticastSender {
    async fn send_from(&self, interface: Ipv4Addr, payload: &[u8]) -> std::io::Result<()> {
        SockRef::from(&self.socket).set_multicast_if_v4(&interface)?;
        self.socket.send_to(payload, self.group).await?;
        Ok(())
    }
}

pub struct DiscoveryAnnouncer {
    template: DomainInfo,
    addresses: Arc<dyn AddressSource>,
    transport: Arc<dyn HeartbeatTransport>,
    period: Duration,
    heartbeats_sent: u64,
}

impl DiscoveryAnnouncer {
    /// `template` carries domain, realm and advertised port; the address is
    /// filled in per interface.
    pub fn new(
        template: DomainInfo,
        addresses: Arc<dyn AddressSource>,
        transport: Arc<dyn HeartbeatTransport>,
        period: Duration,
    ) -> Self {
        Self {
            template,
            addresses,
            transport,
            period,
            heartbeats_sent: 0,
        }
    }

    pub fn heartbeats_sent(&self) -> u64 {
        self.heartbeats_sent
    }

    /// Sends one heartbeat per current local address.
    ///
    /// Returns how many were sent successfully.
    pub async fn run_cycle(&mut self) -> usize {
        let addresses = self.addresses.local_addresses().unwrap_or_else(|e| {
            warn!(error = %e, "failed to enumerate local interfaces");
            BTreeSet::new()
        });
        let mut queue: VecDeque<Ipv4Addr> = addresses.into_iter().collect();

        let mut sent = 0;
        while let Some(interface) = queue.pop_front() {
            let info = self.template.with_address(interface.to_string());
            let payload = match encode_heartbeat(&info) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(%interface, error = %e, "cannot encode heartbeat");
                    continue;
                }
            };
            match self.transport.send_from(interface, &payload).await {
                Ok(()) => sent += 1,
                Err(e) => warn!(%interface, error = %e, "heartbeat send failed"),
            }
        }

        self.heartbeats_sent += sent as u64;
        debug!(sent, total = self.heartbeats_sent, "heartbeat cycle complete");
        sent
    }

    /// Starts cycling in a background task; the first cycle runs immediately.
    pub fn launch(mut self) -> JoinHandle<()> {
        info!(
            domain = %self.template.fully_qualified_name(),
            port = self.template.rpc_port,
            period_ms = self.period.as_millis() as u64,
            "announcer started"
        );
        tokio::spawn(async move {
            loop {
                self.run_cycle().await;
                tokio::time::sleep(self.period).await;
            }
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::network::interfaces::MockAddressSource;
    use backplane_core::decode_heartbeat;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(Ipv4Addr, Vec<u8>)>>,
        failing: Option<Ipv4Addr>,
    }

    #[async_trait]
    impl HeartbeatTransport for RecordingTransport {
        async fn send_from(&self, interface: Ipv4Addr, payload: &[u8]) -> std::io::Result<()> {
            if self.failing == Some(interface) {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::AddrNotAvailable,
                    "interface went away",
                ));
            }
            self.sent.lock().unwrap().push((interface, payload.to_vec()));
            Ok(())
        }
    }

    fn source_with(addresses: &'static [[u8; 4]]) -> Arc<MockAddressSource> {
        let mut source = MockAddressSource::new();
        source
            .expect_local_addresses()
            .returning(move || Ok(addresses.iter().map(|a| Ipv4Addr::from(*a)).collect()));
        Arc::new(source)
    }

    fn template() -> DomainInfo {
        DomainInfo::new("alpha", "r1", 8080)
    }

    #[tokio::test]
    async fn test_cycle_sends_one_heartbeat_per_interface_with_its_address() {
        // Arrange
        let transport = Arc::new(RecordingTransport::default());
        let mut announcer = DiscoveryAnnouncer::new(
            template(),
            source_with(&[[10, 0, 0, 5], [192, 168, 1, 20]]),
            transport.clone(),
            Duration::from_millis(2000),
        );

        // Act
        let sent = announcer.run_cycle().await;

        // Assert
        assert_eq!(sent, 2);
        let records = transport.sent.lock().unwrap();
        for (interface, payload) in records.iter() {
            let info = decode_heartbeat(payload).unwrap();
            assert_eq!(info.rpc_address, interface.to_string());
            assert_eq!(info.rpc_port, 8080);
            assert_eq!(info.domain_name, "alpha");
            assert_eq!(info.realm_name, "r1");
        }
    }

    #[tokio::test]
    async fn test_cycle_continues_after_failed_interface() {
        // Arrange
        let transport = Arc::new(RecordingTransport {
            failing: Some(Ipv4Addr::new(10, 0, 0, 5)),
            ..Default::default()
        });
        let mut announcer = DiscoveryAnnouncer::new(
            template(),
            source_with(&[[10, 0, 0, 5], [127, 0, 0, 1], [192, 168, 1, 20]]),
            transport.clone(),
            Duration::from_millis(2000),
        );

        // Act
        let sent = announcer.run_cycle().await;

        // Assert
        assert_eq!(sent, 2);
        assert_eq!(announcer.heartbeats_sent(), 2);
        let interfaces: Vec<Ipv4Addr> =
            transport.sent.lock().unwrap().iter().map(|(i, _)| *i).collect();
        assert!(interfaces.contains(&Ipv4Addr::LOCALHOST));
        assert!(interfaces.contains(&Ipv4Addr::new(192, 168, 1, 20)));
    }

    #[tokio::test]
    async fn test_cycle_with_failed_enumeration_sends_nothing() {
        let mut source = MockAddressSource::new();
        source.expect_local_addresses().returning(|| {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "no netlink"))
        });
        let transport = Arc::new(RecordingTransport::default());
        let mut announcer = DiscoveryAnnouncer::new(
            template(),
            Arc::new(source),
            transport.clone(),
            Duration::from_millis(2000),
        );

        assert_eq!(announcer.run_cycle().await, 0);
        assert!(transport.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_oversized_heartbeat_is_skipped() {
        let transport = Arc::new(RecordingTransport::default());
        let mut announcer = DiscoveryAnnouncer::new(
            DomainInfo::new("d".repeat(600), "r1", 1),
            source_with(&[[10, 0, 0, 5]]),
            transport.clone(),
            Duration::from_millis(2000),
        );

        assert_eq!(announcer.run_cycle().await, 0);
        assert!(transport.sent.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_launch_repeats_every_period() {
        // Arrange
        let transport = Arc::new(RecordingTransport::default());
        let announcer = DiscoveryAnnouncer::new(
            template(),
            source_with(&[[10, 0, 0, 5], [192, 168, 1, 20]]),
            transport.clone(),
            Duration::from_millis(2000),
        );

        // Act: cycles at t = 0, 2000 and 4000 ms
        let task = announcer.launch();
        tokio::time::sleep(Duration::from_millis(4500)).await;
        task.abort();

        // Assert
        assert_eq!(transport.sent.lock().unwrap().len(), 6);
    }
}
