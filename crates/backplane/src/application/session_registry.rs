//! SessionRegistry: the domain → session table and the proxy router.
//!
//! One tokio task owns the table.  Discovery events, connect completions,
//! disconnect signals and proxied invocations all arrive as [`Command`]s on
//! one channel, so the table is never shared and never locked.  Slow work
//! (connecting, registering a prefix, forwarding a call) runs in spawned
//! tasks that report back through the same channel.
//!
//! # Session lifecycle
//!
//! ```text
//! heartbeat ──► Discovered ──► Connecting ──► Connected ──► removed
//!                                  │                           ▲
//!                                  └──── connect failed ───────┘
//! ```
//!
//! A removed domain is forgotten by the discovery cache, so its next
//! heartbeat starts a fresh session.  Rediscovery is the only retry.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use backplane_core::domain::domain_info::validate_domain_name;
use backplane_core::{DomainInfo, DomainKey, ProtocolError};
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::application::route_call::{forward_call, parse_target, RouteError};
use crate::application::rpc::{
    DisconnectSignal, Invocation, MatchMode, ProcedureHandler, Registration, RpcConnection,
    RpcConnector, RpcError,
};

/// Identifies one connection attempt for a domain.
///
/// A domain that is lost and rediscovered gets a new id, so completions and
/// disconnect signals belonging to the older attempt are recognised and
/// ignored.
pub type SessionId = Uuid;

/// Capacity of the registry command queue.  Proxied invocations that find
/// it full are rejected as busy.
const COMMAND_QUEUE_CAPACITY: usize = 256;

/// Lifecycle state of a session entry.  Removal is the terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Discovered,
    Connecting,
    Connected,
}

/// Lets the registry tell the discovery side that a domain is gone.
///
/// Implemented by the multicast listener; forgetting a key makes the next
/// heartbeat for it raise a new discovery event.
pub trait DiscoveryCache: Send + Sync {
    fn forget(&self, key: &DomainKey);
}

/// Registry settings.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Name the local session is registered under.
    pub local_domain: String,
    /// Upper bound on concurrently forwarded calls.
    pub max_in_flight_calls: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            local_domain: "default".to_string(),
            max_in_flight_calls: 64,
        }
    }
}

/// Error type for the session registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid local domain: {0}")]
    InvalidDomain(#[from] ProtocolError),
    #[error("failed to provide local prefix: {0}")]
    Provide(#[source] RpcError),
    #[error("max_in_flight_calls must be at least 1")]
    NoForwardingCapacity,
    #[error("session registry is no longer running")]
    Closed,
}

/// Point-in-time view of one session entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub domain: DomainKey,
    pub session_id: SessionId,
    pub state: SessionState,
    /// Remote RPC endpoint; `None` for the local session.
    pub address: Option<SocketAddr>,
    pub is_local: bool,
}

type ConnectOutcome = Result<(Arc<dyn RpcConnection>, Registration), RpcError>;

enum Command {
    DomainDiscovered(DomainInfo),
    ConnectFinished {
        key: DomainKey,
        session_id: SessionId,
        outcome: ConnectOutcome,
    },
    Disconnected {
        key: DomainKey,
        session_id: SessionId,
    },
    Proxy(Invocation),
    Sessions(oneshot::Sender<Vec<SessionSummary>>),
    Shutdown,
}

struct SessionEntry {
    session_id: SessionId,
    state: SessionState,
    address: Option<SocketAddr>,
    connection: Option<Arc<dyn RpcConnection>>,
    registration: Option<Registration>,
    connect_task: Option<JoinHandle<()>>,
    is_local: bool,
}

impl SessionEntry {
    fn discovered(address: SocketAddr) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            state: SessionState::Discovered,
            address: Some(address),
            connection: None,
            registration: None,
            connect_task: None,
            is_local: false,
        }
    }

    /// The connection to forward to, if the session is usable.
    fn connected(&self) -> Option<Arc<dyn RpcConnection>> {
        match self.state {
            SessionState::Connected => self.connection.clone(),
            SessionState::Discovered | SessionState::Connecting => None,
        }
    }
}

/// Cloneable front door to the registry task.
///
/// The registry runs until [`BackplaneHandle::shutdown`] or until every
/// handle is dropped.
#[derive(Clone)]
pub struct BackplaneHandle {
    tx: mpsc::Sender<Command>,
}

impl BackplaneHandle {
    /// Reports a discovered domain.  Already known domains are ignored.
    pub async fn domain_discovered(&self, info: DomainInfo) -> Result<(), RegistryError> {
        self.tx
            .send(Command::DomainDiscovered(info))
            .await
            .map_err(|_| RegistryError::Closed)
    }

    /// Feeds every event from `events` into the registry until either side
    /// goes away.
    pub fn follow(&self, mut events: mpsc::Receiver<DomainInfo>) -> JoinHandle<()> {
        let handle = self.clone();
        tokio::spawn(async move {
            while let Some(info) = events.recv().await {
                if handle.domain_discovered(info).await.is_err() {
                    break;
                }
            }
            debug!("discovery event stream ended");
        })
    }

    /// Routes one proxied invocation.
    ///
    /// Never waits: when the registry queue is full the invocation fails as
    /// busy right away.
    pub fn proxy(&self, invocation: Invocation) {
        if let Err(e) = self.tx.try_send(Command::Proxy(invocation)) {
            let reason = match e {
                TrySendError::Full(_) => RouteError::Busy.to_string(),
                TrySendError::Closed(_) => RegistryError::Closed.to_string(),
            };
            if let Command::Proxy(invocation) = e.into_inner() {
                invocation.error(reason);
            }
        }
    }

    /// The handler provided under every domain prefix.
    pub fn proxy_handler(&self) -> ProcedureHandler {
        let handle = self.clone();
        Arc::new(move |invocation| handle.proxy(invocation))
    }

    /// Snapshot of all entries, sorted by domain.
    pub async fn sessions(&self) -> Result<Vec<SessionSummary>, RegistryError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Sessions(reply))
            .await
            .map_err(|_| RegistryError::Closed)?;
        rx.await.map_err(|_| RegistryError::Closed)
    }

    /// Stops the registry, aborting pending connects.
    pub async fn shutdown(&self) -> Result<(), RegistryError> {
        self.tx
            .send(Command::Shutdown)
            .await
            .map_err(|_| RegistryError::Closed)
    }
}

/// State owned by the registry task.
pub struct SessionRegistry {
    local: Arc<dyn RpcConnection>,
    connector: Arc<dyn RpcConnector>,
    discovery: Option<Arc<dyn DiscoveryCache>>,
    sessions: HashMap<DomainKey, SessionEntry>,
    in_flight: Arc<Semaphore>,
    proxy_handler: ProcedureHandler,
    /// Weak, so the registry's own tasks never keep its queue open.
    tx: mpsc::WeakSender<Command>,
}

impl SessionRegistry {
    /// Registers the local domain and spawns the registry task.
    ///
    /// The local session provides `"<local_domain>/"` right away and is
    /// entered as `Connected`, so heartbeats from this process are no-ops
    /// and calls to `"<local_domain>/x"` reach the local session as `x`.
    ///
    /// # Errors
    ///
    /// Fails when the local domain name cannot be routed, when
    /// `max_in_flight_calls` is zero or when the local prefix cannot be
    /// provided.
    pub async fn start(
        config: RegistryConfig,
        local: Arc<dyn RpcConnection>,
        connector: Arc<dyn RpcConnector>,
        discovery: Option<Arc<dyn DiscoveryCache>>,
    ) -> Result<BackplaneHandle, RegistryError> {
        validate_domain_name(&config.local_domain)?;
        if config.max_in_flight_calls == 0 {
            return Err(RegistryError::NoForwardingCapacity);
        }

        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let weak_tx = tx.downgrade();
        let handle = BackplaneHandle { tx };
        let proxy_handler = detached_proxy_handler(weak_tx.clone());

        let key = DomainKey::new(config.local_domain.clone());
        let prefix = format!("{key}/");
        let registration = local
            .provide(&prefix, MatchMode::Prefix, Arc::clone(&proxy_handler))
            .await
            .map_err(RegistryError::Provide)?;

        let mut sessions = HashMap::new();
        sessions.insert(
            key.clone(),
            SessionEntry {
                session_id: Uuid::new_v4(),
                state: SessionState::Connected,
                address: None,
                connection: Some(Arc::clone(&local)),
                registration: Some(registration),
                connect_task: None,
                is_local: true,
            },
        );
        info!(domain = %key, %prefix, "local domain registered");

        let registry = Self {
            local,
            connector,
            discovery,
            sessions,
            in_flight: Arc::new(Semaphore::new(config.max_in_flight_calls)),
            proxy_handler,
            tx: weak_tx,
        };
        tokio::spawn(registry.run(rx));
        Ok(handle)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::DomainDiscovered(info) => self.on_domain_discovered(info),
                Command::ConnectFinished {
                    key,
                    session_id,
                    outcome,
                } => self.on_connect_finished(key, session_id, outcome),
                Command::Disconnected { key, session_id } => self.on_disconnected(&key, session_id),
                Command::Proxy(invocation) => self.on_proxy(invocation),
                Command::Sessions(reply) => {
                    let _ = reply.send(self.snapshot());
                }
                Command::Shutdown => break,
            }
        }

        for entry in self.sessions.values_mut() {
            if let Some(task) = entry.connect_task.take() {
                task.abort();
            }
        }
        info!("session registry stopped");
    }

    fn on_domain_discovered(&mut self, info: DomainInfo) {
        let key = info.dedup_key();
        if self.sessions.contains_key(&key) {
            debug!(domain = %key, "domain already known");
            return;
        }

        let address = match info.rpc_socket_addr() {
            Ok(address) => address,
            Err(e) => {
                warn!(domain = %key, error = %e, "discovered domain has no usable address");
                self.forget(&key);
                return;
            }
        };

        let mut entry = SessionEntry::discovered(address);
        info!(domain = %key, realm = %info.realm_name, %address, "domain discovered");

        entry.connect_task = Some(self.spawn_connect(
            key.clone(),
            entry.session_id,
            address,
            info.route_prefix(),
        ));
        entry.state = SessionState::Connecting;
        self.sessions.insert(key, entry);
    }

    fn on_connect_finished(&mut self, key: DomainKey, session_id: SessionId, outcome: ConnectOutcome) {
        let is_current = matches!(
            self.sessions.get(&key),
            Some(entry) if entry.session_id == session_id && entry.state == SessionState::Connecting
        );
        if !is_current {
            debug!(domain = %key, "discarding stale connect completion");
            if let Ok((_, registration)) = outcome {
                self.spawn_unprovide(key, registration);
            }
            return;
        }

        match outcome {
            Ok((connection, registration)) => {
                self.spawn_disconnect_watch(key.clone(), session_id, connection.on_disconnect());
                if let Some(entry) = self.sessions.get_mut(&key) {
                    entry.state = SessionState::Connected;
                    entry.connection = Some(connection);
                    entry.registration = Some(registration);
                    entry.connect_task = None;
                }
                info!(domain = %key, "domain connected");
            }
            Err(e) => {
                warn!(domain = %key, error = %e, "connecting to domain failed");
                self.remove_session(&key);
            }
        }
    }

    fn on_disconnected(&mut self, key: &DomainKey, session_id: SessionId) {
        match self.sessions.get(key) {
            Some(entry) if entry.session_id == session_id => {
                info!(domain = %key, "domain disconnected");
                self.remove_session(key);
            }
            _ => debug!(domain = %key, "ignoring disconnect of a stale session"),
        }
    }

    fn on_proxy(&self, invocation: Invocation) {
        let parsed = parse_target(invocation.procedure())
            .map(|(domain, procedure)| (domain.to_string(), procedure.to_string()));
        let (domain, procedure) = match parsed {
            Ok(route) => route,
            Err(e) => {
                debug!(procedure = ?invocation.procedure(), error = %e, "rejecting proxied call");
                invocation.error(e.to_string());
                return;
            }
        };

        let Some(target) = self.sessions.get(domain.as_str()).and_then(SessionEntry::connected) else {
            debug!(%domain, "proxied call to unknown domain");
            invocation.error(RouteError::UnknownDomain.to_string());
            return;
        };

        let permit = match Arc::clone(&self.in_flight).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(%domain, "forwarding limit reached");
                invocation.error(RouteError::Busy.to_string());
                return;
            }
        };

        debug!(%domain, %procedure, "forwarding call");
        tokio::spawn(forward_call(permit, target, procedure, invocation));
    }

    fn snapshot(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self
            .sessions
            .iter()
            .map(|(key, entry)| SessionSummary {
                domain: key.clone(),
                session_id: entry.session_id,
                state: entry.state,
                address: entry.address,
                is_local: entry.is_local,
            })
            .collect();
        summaries.sort_by(|a, b| a.domain.cmp(&b.domain));
        summaries
    }

    fn remove_session(&mut self, key: &DomainKey) {
        let Some(entry) = self.sessions.remove(key) else {
            return;
        };
        if let Some(task) = entry.connect_task {
            task.abort();
        }
        if let Some(registration) = entry.registration {
            self.spawn_unprovide(key.clone(), registration);
        }
        self.forget(key);
    }

    fn forget(&self, key: &DomainKey) {
        if let Some(discovery) = &self.discovery {
            discovery.forget(key);
        }
    }

    fn spawn_connect(
        &self,
        key: DomainKey,
        session_id: SessionId,
        address: SocketAddr,
        prefix: String,
    ) -> JoinHandle<()> {
        let connector = Arc::clone(&self.connector);
        let local = Arc::clone(&self.local);
        let handler = Arc::clone(&self.proxy_handler);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let outcome = connect_and_provide(connector, local, address, prefix, handler).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx
                    .send(Command::ConnectFinished {
                        key,
                        session_id,
                        outcome,
                    })
                    .await;
            }
        })
    }

    fn spawn_disconnect_watch(&self, key: DomainKey, session_id: SessionId, signal: DisconnectSignal) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            signal.fired().await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(Command::Disconnected { key, session_id }).await;
            }
        });
    }

    fn spawn_unprovide(&self, key: DomainKey, registration: Registration) {
        let local = Arc::clone(&self.local);
        tokio::spawn(async move {
            if let Err(e) = local.unprovide(registration).await {
                warn!(domain = %key, error = %e, "failed to withdraw proxy prefix");
            }
        });
    }
}

/// Proxy handler for the registry's own registrations.
///
/// Holds the queue weakly: the local session keeps this handler, and the
/// registry keeps the local session.
fn detached_proxy_handler(tx: mpsc::WeakSender<Command>) -> ProcedureHandler {
    Arc::new(move |invocation| match tx.upgrade() {
        Some(tx) => BackplaneHandle { tx }.proxy(invocation),
        None => invocation.error(RegistryError::Closed.to_string()),
    })
}

/// Opens the outbound session and provides its prefix on the local session.
async fn connect_and_provide(
    connector: Arc<dyn RpcConnector>,
    local: Arc<dyn RpcConnection>,
    address: SocketAddr,
    prefix: String,
    handler: ProcedureHandler,
) -> ConnectOutcome {
    let connection = connector.connect(address).await?;
    let registration = local.provide(&prefix, MatchMode::Prefix, handler).await?;
    Ok((connection, registration))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
