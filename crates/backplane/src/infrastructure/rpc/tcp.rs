//! TCP client for a JSON-lines RPC router.
//!
//! A session is one TCP connection.  After the `hello`/`welcome` handshake a
//! reader task dispatches inbound frames and a writer task serializes
//! outbound ones:
//!
//! - replies are matched to waiting requests by request id;
//! - invocations go to the handler registered for their registration, and
//!   the handler's reply is written back as `yield` or `error`;
//! - end of stream or an I/O error fails every waiting request and fires
//!   the disconnect signal.
//!
//! The client implements no routing, retries or timeouts.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use super::wire::{decode_frame, encode_frame, WireMessage};
use crate::application::rpc::{
    Args, CallResult, DisconnectNotifier, DisconnectSignal, Invocation, KwArgs, MatchMode,
    ProcedureHandler, Registration, RpcConnection, RpcConnector, RpcError,
};

/// Outbound frames queued ahead of the writer task.
const OUTBOUND_QUEUE: usize = 256;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Opens [`TcpRpcConnection`]s joined to one realm.
#[derive(Debug, Clone)]
pub struct TcpRpcConnector {
    realm: String,
}

impl TcpRpcConnector {
    pub fn new(realm: impl Into<String>) -> Self {
        Self {
            realm: realm.into(),
        }
    }
}

#[async_trait]
impl RpcConnector for TcpRpcConnector {
    async fn connect(&self, addr: SocketAddr) -> Result<Arc<dyn RpcConnection>, RpcError> {
        let connection = TcpRpcConnection::connect(addr, &self.realm).await?;
        Ok(Arc::new(connection))
    }
}

/// A request waiting for its reply.
struct Pending {
    reply: oneshot::Sender<WireMessage>,
    /// Installed by the reader as soon as `registered` arrives, before any
    /// invocation for it can be read.
    handler: Option<ProcedureHandler>,
}

struct Shared {
    peer: SocketAddr,
    outbound: mpsc::Sender<WireMessage>,
    next_request: AtomicU64,
    pending: Mutex<HashMap<u64, Pending>>,
    handlers: Mutex<HashMap<Registration, ProcedureHandler>>,
    notifier: DisconnectNotifier,
}

impl Shared {
    fn is_lost(&self) -> bool {
        self.notifier.subscribe().is_fired()
    }

    /// Fires the disconnect signal, then fails every waiting request.
    fn mark_lost(&self) {
        if !self.is_lost() {
            info!(peer = %self.peer, "rpc session lost");
        }
        self.notifier.notify();
        lock(&self.pending).clear();
    }

    async fn request(
        &self,
        handler: Option<ProcedureHandler>,
        build: impl FnOnce(u64) -> WireMessage,
    ) -> Result<WireMessage, RpcError> {
        let request = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel();
        lock(&self.pending).insert(request, Pending { reply, handler });

        // A request registered after the pending map was cleared would wait forever.
        if self.is_lost() || self.outbound.send(build(request)).await.is_err() {
            lock(&self.pending).remove(&request);
            return Err(RpcError::Disconnected);
        }
        rx.await.map_err(|_| RpcError::Disconnected)
    }
}

/// One established session with the router.
///
/// Dropping the last handle closes the TCP connection.
pub struct TcpRpcConnection {
    shared: Arc<Shared>,
    session: u64,
    tasks: [AbortHandle; 2],
}

impl TcpRpcConnection {
    /// Connects to `addr` and joins `realm`.
    ///
    /// # Errors
    ///
    /// - [`RpcError::ConnectFailed`] if the TCP connection cannot be opened.
    /// - [`RpcError::Remote`] if the router aborts the handshake.
    /// - [`RpcError::Protocol`] / [`RpcError::Disconnected`] for anything
    ///   other than a `welcome` reply.
    pub async fn connect(addr: SocketAddr, realm: &str) -> Result<Self, RpcError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| RpcError::ConnectFailed { addr, source })?;
        stream.set_nodelay(true)?;
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        write_half
            .write_all(&encode_frame(&WireMessage::Hello {
                realm: realm.to_string(),
            })?)
            .await?;
        let session = match lines.next_line().await? {
            Some(line) => match decode_frame(&line)? {
                WireMessage::Welcome { session } => session,
                WireMessage::Abort { message } => return Err(RpcError::Remote(message)),
                other => {
                    return Err(RpcError::Protocol(format!(
                        "expected welcome, got {other:?}"
                    )))
                }
            },
            None => return Err(RpcError::Disconnected),
        };
        info!(peer = %addr, %realm, session, "rpc session established");

        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (notifier, _) = DisconnectSignal::channel();
        let shared = Arc::new(Shared {
            peer: addr,
            outbound,
            next_request: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            handlers: Mutex::new(HashMap::new()),
            notifier,
        });

        let writer = tokio::spawn(write_loop(write_half, outbound_rx, Arc::clone(&shared)));
        let reader = tokio::spawn(read_loop(lines, Arc::clone(&shared)));

        Ok(Self {
            shared,
            session,
            tasks: [reader.abort_handle(), writer.abort_handle()],
        })
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    pub fn peer(&self) -> SocketAddr {
        self.shared.peer
    }
}

impl Drop for TcpRpcConnection {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[async_trait]
impl RpcConnection for TcpRpcConnection {
    async fn call(
        &self,
        procedure: &str,
        args: Args,
        kwargs: KwArgs,
    ) -> Result<CallResult, RpcError> {
        let procedure = procedure.to_string();
        let reply = self
            .shared
            .request(None, |request| WireMessage::Call {
                request,
                procedure,
                args,
                kwargs,
            })
            .await?;
        match reply {
            WireMessage::Result { args, kwargs, .. } => Ok(CallResult { args, kwargs }),
            WireMessage::Error { message, .. } => Err(RpcError::Remote(message)),
            other => Err(RpcError::Protocol(format!("unexpected reply to call: {other:?}"))),
        }
    }

    async fn provide(
        &self,
        pattern: &str,
        mode: MatchMode,
        handler: ProcedureHandler,
    ) -> Result<Registration, RpcError> {
        let pattern = pattern.to_string();
        let reply = self
            .shared
            .request(Some(handler), |request| WireMessage::Register {
                request,
                pattern,
                mode,
            })
            .await?;
        match reply {
            WireMessage::Registered { registration, .. } => Ok(registration),
            WireMessage::Error { message, .. } => Err(RpcError::Remote(message)),
            other => Err(RpcError::Protocol(format!("unexpected reply to register: {other:?}"))),
        }
    }

    async fn unprovide(&self, registration: Registration) -> Result<(), RpcError> {
        lock(&self.shared.handlers).remove(&registration);
        let reply = self
            .shared
            .request(None, |request| WireMessage::Unregister {
                request,
                registration,
            })
            .await?;
        match reply {
            WireMessage::Unregistered { .. } => Ok(()),
            WireMessage::Error { message, .. } => Err(RpcError::Remote(message)),
            other => Err(RpcError::Protocol(format!(
                "unexpected reply to unregister: {other:?}"
            ))),
        }
    }

    fn on_disconnect(&self) -> DisconnectSignal {
        self.shared.notifier.subscribe()
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<WireMessage>,
    shared: Arc<Shared>,
) {
    while let Some(message) = outbound.recv().await {
        let frame = match encode_frame(&message) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "dropping unencodable frame");
                continue;
            }
        };
        if let Err(e) = writer.write_all(&frame).await {
            warn!(peer = %shared.peer, error = %e, "rpc write failed");
            break;
        }
    }
    shared.mark_lost();
}

async fn read_loop(mut lines: Lines<BufReader<OwnedReadHalf>>, shared: Arc<Shared>) {
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(peer = %shared.peer, error = %e, "rpc read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match decode_frame(&line) {
            Ok(message) => dispatch(&shared, message),
            Err(e) => warn!(peer = %shared.peer, error = %e, "ignoring undecodable frame"),
        }
    }
    shared.mark_lost();
}

fn dispatch(shared: &Arc<Shared>, message: WireMessage) {
    if let Some(request) = message.reply_to() {
        let waiter = lock(&shared.pending).remove(&request);
        match waiter {
            Some(Pending { reply, handler }) => {
                if let (WireMessage::Registered { registration, .. }, Some(handler)) =
                    (&message, handler)
                {
                    lock(&shared.handlers).insert(*registration, handler);
                }
                let _ = reply.send(message);
            }
            None => debug!(request, "reply for unknown request"),
        }
        return;
    }

    match message {
        WireMessage::Invocation {
            request,
            registration,
            procedure,
            args,
            kwargs,
        } => {
            let handler = lock(&shared.handlers).get(&registration).cloned();
            let Some(handler) = handler else {
                let _ = shared.outbound.try_send(WireMessage::Error {
                    request,
                    message: format!("no handler for registration {}", registration.0),
                });
                return;
            };
            let (invocation, reply) = Invocation::new(procedure, args, kwargs);
            handler(invocation);
            let outbound = shared.outbound.clone();
            tokio::spawn(async move {
                let frame = match reply.await {
                    Ok(Ok(CallResult { args, kwargs })) => WireMessage::Yield {
                        request,
                        args,
                        kwargs,
                    },
                    Ok(Err(message)) => WireMessage::Error { request, message },
                    Err(_) => WireMessage::Error {
                        request,
                        message: "invocation was dropped".to_string(),
                    },
                };
                let _ = outbound.send(frame).await;
            });
        }
        WireMessage::Abort { message } => {
            warn!(peer = %shared.peer, %message, "router aborted the session");
        }
        other => debug!(?other, "ignoring unexpected frame"),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
