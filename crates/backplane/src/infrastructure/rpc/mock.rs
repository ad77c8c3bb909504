//! In-memory RPC sessions for unit and integration testing.
//!
//! [`MockConnection`] records every call and registration and behaves like a
//! router-side session: [`MockConnection::invoke`] dispatches to whichever
//! provided handler matches, the way a router delivers an invocation.
//! [`MockConnector`] hands out registered `MockConnection`s by address and
//! refuses every other address.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{oneshot, Semaphore};

use crate::application::rpc::{
    Args, CallResult, DisconnectNotifier, DisconnectSignal, Invocation, InvocationReply, KwArgs,
    MatchMode, ProcedureHandler, Registration, RpcConnection, RpcConnector, RpcError,
};

/// One call observed by a [`MockConnection`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub procedure: String,
    pub args: Args,
    pub kwargs: KwArgs,
}

struct Provided {
    pattern: String,
    mode: MatchMode,
    handler: ProcedureHandler,
}

/// A recording [`RpcConnection`].
///
/// Calls without a configured response echo their arguments back.
pub struct MockConnection {
    name: String,
    calls: Mutex<Vec<RecordedCall>>,
    responses: Mutex<HashMap<String, InvocationReply>>,
    provided: Mutex<BTreeMap<Registration, Provided>>,
    unprovided: Mutex<Vec<Registration>>,
    next_registration: AtomicU64,
    fail_provide: AtomicBool,
    call_gate: Mutex<Option<Arc<Semaphore>>>,
    notifier: DisconnectNotifier,
}

impl MockConnection {
    pub fn new(name: impl Into<String>) -> Self {
        let (notifier, _) = DisconnectSignal::channel();
        Self {
            name: name.into(),
            calls: Mutex::new(Vec::new()),
            responses: Mutex::new(HashMap::new()),
            provided: Mutex::new(BTreeMap::new()),
            unprovided: Mutex::new(Vec::new()),
            next_registration: AtomicU64::new(1),
            fail_provide: AtomicBool::new(false),
            call_gate: Mutex::new(None),
            notifier,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fixes the reply for every later call of `procedure`.
    pub fn respond_with(&self, procedure: &str, reply: InvocationReply) {
        self.responses
            .lock()
            .expect("lock poisoned")
            .insert(procedure.to_string(), reply);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().expect("lock poisoned").clone()
    }

    /// Patterns currently provided, in registration order.
    pub fn provided_patterns(&self) -> Vec<String> {
        self.provided
            .lock()
            .expect("lock poisoned")
            .values()
            .map(|p| p.pattern.clone())
            .collect()
    }

    pub fn registration_for(&self, pattern: &str) -> Option<Registration> {
        self.provided
            .lock()
            .expect("lock poisoned")
            .iter()
            .find(|(_, p)| p.pattern == pattern)
            .map(|(r, _)| *r)
    }

    pub fn unprovided(&self) -> Vec<Registration> {
        self.unprovided.lock().expect("lock poisoned").clone()
    }

    /// Makes every later `provide` fail.
    pub fn fail_provide(&self, fail: bool) {
        self.fail_provide.store(fail, Ordering::SeqCst);
    }

    /// Blocks later calls until [`MockConnection::release_calls`] lets them
    /// through.
    pub fn hold_calls(&self) {
        *self.call_gate.lock().expect("lock poisoned") = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_calls(&self, n: usize) {
        if let Some(gate) = self.call_gate.lock().expect("lock poisoned").as_ref() {
            gate.add_permits(n);
        }
    }

    /// Delivers an invocation for `procedure` to the matching provided
    /// handler.  Exact registrations win over prefix ones.
    ///
    /// Returns `None` when nothing matches.
    pub fn invoke(
        &self,
        procedure: &str,
        args: Args,
        kwargs: KwArgs,
    ) -> Option<oneshot::Receiver<InvocationReply>> {
        let handler = {
            let provided = self.provided.lock().expect("lock poisoned");
            let exact = provided
                .values()
                .find(|p| p.mode == MatchMode::Exact && p.mode.matches(&p.pattern, procedure));
            let prefix = provided
                .values()
                .filter(|p| p.mode == MatchMode::Prefix && p.mode.matches(&p.pattern, procedure))
                .max_by_key(|p| p.pattern.len());
            exact.or(prefix).map(|p| Arc::clone(&p.handler))?
        };
        let (invocation, rx) = Invocation::new(Some(procedure.to_string()), args, kwargs);
        handler(invocation);
        Some(rx)
    }

    /// Simulates losing the session.
    pub fn disconnect(&self) {
        self.notifier.notify();
    }

    pub fn is_disconnected(&self) -> bool {
        self.notifier.subscribe().is_fired()
    }
}

#[async_trait]
impl RpcConnection for MockConnection {
    async fn call(
        &self,
        procedure: &str,
        args: Args,
        kwargs: KwArgs,
    ) -> Result<CallResult, RpcError> {
        if self.is_disconnected() {
            return Err(RpcError::Disconnected);
        }
        self.calls.lock().expect("lock poisoned").push(RecordedCall {
            procedure: procedure.to_string(),
            args: args.clone(),
            kwargs: kwargs.clone(),
        });

        let gate = self.call_gate.lock().expect("lock poisoned").clone();
        if let Some(gate) = gate {
            gate.acquire()
                .await
                .map_err(|_| RpcError::Disconnected)?
                .forget();
        }

        let configured = self
            .responses
            .lock()
            .expect("lock poisoned")
            .get(procedure)
            .cloned();
        match configured {
            Some(Ok(result)) => Ok(result),
            Some(Err(message)) => Err(RpcError::Remote(message)),
            None => Ok(CallResult { args, kwargs }),
        }
    }

    async fn provide(
        &self,
        pattern: &str,
        mode: MatchMode,
        handler: ProcedureHandler,
    ) -> Result<Registration, RpcError> {
        if self.fail_provide.load(Ordering::SeqCst) {
            return Err(RpcError::Remote(format!("cannot register {pattern}")));
        }
        let registration = Registration(self.next_registration.fetch_add(1, Ordering::SeqCst));
        self.provided.lock().expect("lock poisoned").insert(
            registration,
            Provided {
                pattern: pattern.to_string(),
                mode,
                handler,
            },
        );
        Ok(registration)
    }

    async fn unprovide(&self, registration: Registration) -> Result<(), RpcError> {
        self.provided
            .lock()
            .expect("lock poisoned")
            .remove(&registration);
        self.unprovided
            .lock()
            .expect("lock poisoned")
            .push(registration);
        Ok(())
    }

    fn on_disconnect(&self) -> DisconnectSignal {
        self.notifier.subscribe()
    }
}

/// A [`RpcConnector`] that only reaches registered targets.
#[derive(Default)]
pub struct MockConnector {
    targets: Mutex<HashMap<SocketAddr, Arc<MockConnection>>>,
    attempts: Mutex<Vec<SocketAddr>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `addr` reachable, replacing any earlier target there.
    pub fn add_target(&self, addr: SocketAddr, connection: Arc<MockConnection>) {
        self.targets
            .lock()
            .expect("lock poisoned")
            .insert(addr, connection);
    }

    pub fn remove_target(&self, addr: SocketAddr) {
        self.targets.lock().expect("lock poisoned").remove(&addr);
    }

    /// Every address `connect` was called with, in order.
    pub fn attempts(&self) -> Vec<SocketAddr> {
        self.attempts.lock().expect("lock poisoned").clone()
    }

    /// Blocks later connects until [`MockConnector::release_connects`].
    pub fn hold_connects(&self) {
        *self.gate.lock().expect("lock poisoned") = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_connects(&self, n: usize) {
        if let Some(gate) = self.gate.lock().expect("lock poisoned").as_ref() {
            gate.add_permits(n);
        }
    }
}

#[async_trait]
impl RpcConnector for MockConnector {
    async fn connect(&self, addr: SocketAddr) -> Result<Arc<dyn RpcConnection>, RpcError> {
        self.attempts.lock().expect("lock poisoned").push(addr);

        let gate = self.gate.lock().expect("lock poisoned").clone();
        if let Some(gate) = gate {
            gate.acquire()
                .await
                .map_err(|_| RpcError::Disconnected)?
                .forget();
        }

        let target = self.targets.lock().expect("lock poisoned").get(&addr).cloned();
        match target {
            Some(connection) => Ok(connection as Arc<dyn RpcConnection>),
            None => Err(RpcError::ConnectFailed {
                addr,
                source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "no mock target"),
            }),
        }
    }
}
