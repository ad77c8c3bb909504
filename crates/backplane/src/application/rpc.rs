//! The RPC session interface consumed by the backplane.
//!
//! The backplane never speaks an RPC wire protocol itself.  It only needs to
//! open a session to a remote domain, issue calls on it, register a
//! prefix-matched handler on the local session, and learn when a session is
//! lost.  Those four capabilities are the [`RpcConnector`] and
//! [`RpcConnection`] traits below.  The infrastructure layer provides the
//! JSON-lines TCP implementation; tests use the in-memory doubles from
//! `infrastructure::rpc::mock`.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{oneshot, watch};

/// Positional call arguments, passed through untouched.
pub type Args = Vec<serde_json::Value>;

/// Keyword call arguments, passed through untouched.
pub type KwArgs = serde_json::Map<String, serde_json::Value>;

/// What an [`Invocation`] is completed with: a result or an error message.
pub type InvocationReply = Result<CallResult, String>;

/// Handler invoked for every call routed to a provided pattern.
///
/// Handlers run on the transport's reader task and must not block; the
/// backplane's handler only enqueues the invocation.
pub type ProcedureHandler = Arc<dyn Fn(Invocation) + Send + Sync>;

/// Errors reported by an RPC session.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The outbound connection could not be established.
    #[error("failed to connect to {addr}: {source}")]
    ConnectFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    /// The session was lost before the operation completed.
    #[error("session disconnected")]
    Disconnected,
    /// The remote side failed the call; the message is passed on verbatim.
    #[error("{0}")]
    Remote(String),
    /// The peer sent something the session could not interpret.
    #[error("rpc protocol error: {0}")]
    Protocol(String),
    /// An I/O error on an established session.
    #[error("rpc I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of a completed call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallResult {
    #[serde(default)]
    pub args: Args,
    #[serde(default)]
    pub kwargs: KwArgs,
}

/// How a provided pattern is matched against call targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    Exact,
    Prefix,
}

impl MatchMode {
    pub fn matches(self, pattern: &str, procedure: &str) -> bool {
        match self {
            MatchMode::Exact => pattern == procedure,
            MatchMode::Prefix => procedure.starts_with(pattern),
        }
    }
}

/// Handle for a provided pattern, used to withdraw it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Registration(pub u64);

/// A call delivered to a provided handler.
///
/// Completing the invocation consumes it, so a call is answered at most
/// once.  Dropping it unanswered lets the transport report the call as
/// failed.
#[derive(Debug)]
pub struct Invocation {
    procedure: Option<String>,
    args: Args,
    kwargs: KwArgs,
    reply: oneshot::Sender<InvocationReply>,
}

impl Invocation {
    /// Creates an invocation together with the receiver its reply arrives on.
    ///
    /// `procedure` is the originally addressed procedure name; routers that
    /// do not disclose it pass `None`.
    pub fn new(
        procedure: Option<String>,
        args: Args,
        kwargs: KwArgs,
    ) -> (Self, oneshot::Receiver<InvocationReply>) {
        let (reply, rx) = oneshot::channel();
        (
            Self {
                procedure,
                args,
                kwargs,
                reply,
            },
            rx,
        )
    }

    pub fn procedure(&self) -> Option<&str> {
        self.procedure.as_deref()
    }

    pub fn args(&self) -> &Args {
        &self.args
    }

    pub fn kwargs(&self) -> &KwArgs {
        &self.kwargs
    }

    /// Moves the arguments out, leaving empty ones behind.
    pub fn take_arguments(&mut self) -> (Args, KwArgs) {
        (
            std::mem::take(&mut self.args),
            std::mem::take(&mut self.kwargs),
        )
    }

    pub fn result(self, result: CallResult) {
        // The caller may have gone away; nothing to do then.
        let _ = self.reply.send(Ok(result));
    }

    pub fn error(self, message: impl Into<String>) {
        let _ = self.reply.send(Err(message.into()));
    }
}

/// Fires once when a session is lost.
#[derive(Debug, Clone)]
pub struct DisconnectSignal(watch::Receiver<bool>);

/// Sending half of a [`DisconnectSignal`], owned by the transport.
#[derive(Debug)]
pub struct DisconnectNotifier(watch::Sender<bool>);

impl DisconnectSignal {
    pub fn channel() -> (DisconnectNotifier, DisconnectSignal) {
        let (tx, rx) = watch::channel(false);
        (DisconnectNotifier(tx), DisconnectSignal(rx))
    }

    pub fn is_fired(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once the session is lost.  A dropped notifier counts as a
    /// lost session.
    pub async fn fired(mut self) {
        let _ = self.0.wait_for(|lost| *lost).await;
    }
}

impl DisconnectNotifier {
    pub fn notify(&self) {
        self.0.send_replace(true);
    }

    pub fn subscribe(&self) -> DisconnectSignal {
        DisconnectSignal(self.0.subscribe())
    }
}

/// An established RPC session.
#[async_trait]
pub trait RpcConnection: Send + Sync {
    /// Calls `procedure` on the peer.
    async fn call(&self, procedure: &str, args: Args, kwargs: KwArgs)
        -> Result<CallResult, RpcError>;

    /// Registers `handler` for every call whose target matches `pattern`.
    async fn provide(
        &self,
        pattern: &str,
        mode: MatchMode,
        handler: ProcedureHandler,
    ) -> Result<Registration, RpcError>;

    /// Withdraws a registration made with [`RpcConnection::provide`].
    async fn unprovide(&self, registration: Registration) -> Result<(), RpcError>;

    /// Returns a signal that fires once when this session is lost.
    fn on_disconnect(&self) -> DisconnectSignal;
}

/// Opens outbound RPC sessions.
#[async_trait]
pub trait RpcConnector: Send + Sync {
    async fn connect(&self, addr: SocketAddr) -> Result<Arc<dyn RpcConnection>, RpcError>;
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_match_mode_prefix_matches_leading_segment() {
        assert!(MatchMode::Prefix.matches("alpha/", "alpha/add"));
        assert!(!MatchMode::Prefix.matches("alpha/", "alphabet/add"));
        assert!(!MatchMode::Exact.matches("alpha/", "alpha/add"));
        assert!(MatchMode::Exact.matches("alpha/add", "alpha/add"));
    }

    #[test]
    fn test_match_mode_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&MatchMode::Prefix).unwrap(), "\"prefix\"");
    }

    #[tokio::test]
    async fn test_invocation_result_reaches_receiver() {
        // Arrange
        let (inv, rx) = Invocation::new(Some("alpha/add".to_string()), vec![json!(1)], KwArgs::new());
        let expected = CallResult {
            args: vec![json!(3)],
            kwargs: KwArgs::new(),
        };

        // Act
        inv.result(expected.clone());

        // Assert
        assert_eq!(rx.await.unwrap(), Ok(expected));
    }

    #[tokio::test]
    async fn test_invocation_error_reaches_receiver() {
        let (inv, rx) = Invocation::new(None, Args::new(), KwArgs::new());
        inv.error("boom");
        assert_eq!(rx.await.unwrap(), Err("boom".to_string()));
    }

    #[test]
    fn test_take_arguments_leaves_empty_arguments() {
        // Arrange
        let mut kwargs = KwArgs::new();
        kwargs.insert("k".to_string(), json!("v"));
        let (mut inv, _rx) = Invocation::new(None, vec![json!(23), json!(777)], kwargs);

        // Act
        let (args, kwargs) = inv.take_arguments();

        // Assert
        assert_eq!(args, vec![json!(23), json!(777)]);
        assert_eq!(kwargs.get("k"), Some(&json!("v")));
        assert!(inv.args().is_empty());
        assert!(inv.kwargs().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_signal_fires_after_notify() {
        // Arrange
        let (notifier, signal) = DisconnectSignal::channel();
        let late = notifier.subscribe();
        assert!(!signal.is_fired());

        // Act
        notifier.notify();

        // Assert
        assert!(late.is_fired());
        signal.fired().await;
    }

    #[test]
    fn test_disconnect_signal_pending_until_notified() {
        use tokio_test::{assert_pending, assert_ready, task};

        let (notifier, signal) = DisconnectSignal::channel();
        let mut fired = task::spawn(signal.fired());
        assert_pending!(fired.poll());

        notifier.notify();

        assert!(fired.is_woken());
        assert_ready!(fired.poll());
    }

    #[tokio::test]
    async fn test_disconnect_signal_fires_when_notifier_dropped() {
        let (notifier, signal) = DisconnectSignal::channel();
        drop(notifier);
        signal.fired().await;
    }

    #[test]
    fn test_remote_error_displays_message_verbatim() {
        assert_eq!(RpcError::Remote("division by zero".to_string()).to_string(), "division by zero");
    }
}
