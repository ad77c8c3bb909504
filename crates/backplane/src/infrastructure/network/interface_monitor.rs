//! Periodic interface polling.
//!
//! Each tick enumerates the local addresses, reports those missing from the
//! previous tick and remembers the new set.  Removed addresses are never
//! reported.  A failed enumeration counts as an empty set, so addresses seen
//! again after a failure are reported again.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::interfaces::AddressSource;

/// Queue depth for newly appeared addresses.
const NEW_ADDRESS_QUEUE: usize = 32;

pub struct InterfaceMonitor {
    source: Arc<dyn AddressSource>,
    previous: BTreeSet<Ipv4Addr>,
}

impl InterfaceMonitor {
    pub fn new(source: Arc<dyn AddressSource>) -> Self {
        Self {
            source,
            previous: BTreeSet::new(),
        }
    }

    /// Current local addresses; empty if enumeration fails.
    pub fn poll(&self) -> BTreeSet<Ipv4Addr> {
        match self.source.local_addresses() {
            Ok(addresses) => addresses,
            Err(e) => {
                warn!(error = %e, "failed to enumerate local interfaces");
                BTreeSet::new()
            }
        }
    }

    /// Polls once and returns the addresses that were not present last time.
    pub fn tick(&mut self) -> Vec<Ipv4Addr> {
        let current = self.poll();
        let appeared: Vec<Ipv4Addr> = current.difference(&self.previous).copied().collect();
        self.previous = current;
        appeared
    }

    /// Runs [`InterfaceMonitor::tick`] every `period`, first tick immediately.
    ///
    /// All of a tick's additions are queued before the next poll.  The task
    /// ends when the receiver is dropped.
    pub fn spawn(mut self, period: Duration) -> mpsc::Receiver<Ipv4Addr> {
        let (tx, rx) = mpsc::channel(NEW_ADDRESS_QUEUE);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = tx.closed() => break,
                }
                for address in self.tick() {
                    debug!(%address, "new local interface");
                    if tx.send(address).await.is_err() {
                        return;
                    }
                }
            }
            debug!("interface monitor stopped");
        });
        rx
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
