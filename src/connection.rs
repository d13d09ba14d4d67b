//! Connection - receive loop, lifecycle state machine, and call entry.
//!
//! A connection owns its socket, its sender and receiver tasks, its
//! pending-request table, and its outbound queue. The lifecycle is
//! Open → Draining → Closed, driven by one atomic in-flight counter:
//!
//! - Enqueuing an outbound request, or accepting an inbound one,
//!   increments the counter. A pre-increment value of −1 means the
//!   connection is already shutting down with no work left, so the
//!   increment is undone and the message rejected.
//! - Completing a response (sent or received) decrements it. The
//!   transition to −1 means no outstanding work remains; on a draining
//!   connection that initiates the close handshake.
//! - `shutdown` marks the connection draining and decrements once,
//!   turning the idle floor into −1.
//!
//! Whatever path a connection dies through (graceful close, protocol
//! error, socket loss, dispose), exactly one `atomic_dispose` run
//! closes the queue, poisons the pending table, publishes the
//! [`CloseReason`] and fires the disconnect subscribers. Subscribing
//! after death observes the event synchronously.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace, warn};

use crate::auth::{self, Principal, TokenVault};
use crate::codec::{JsonCodec, PayloadEncoding};
use crate::controller::{ArgsTuple, ControllerRegistry};
use crate::error::{Result, SockwireError};
use crate::outbound::{sender_loop, FrameKind, Outbound};
use crate::pending::{PendingTable, ResponsePayload};
use crate::protocol::{self, Header, MessageAssembler, Status, DEFAULT_MAX_PAYLOAD_SIZE};
use crate::scope::ScopeFactory;

/// Close-handshake wait after a generic protocol error.
const PROTOCOL_ERROR_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Close-handshake wait after a malformed header.
const MALFORMED_HEADER_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Which side of the socket this peer is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    /// Dialed the socket; performs no permission checks.
    Dialer,
    /// Accepted the socket; gates inbound requests on the principal.
    Listener,
}

/// Why a connection closed, published exactly once per connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// True when the close completed an orderly drain.
    pub graceful: bool,
    /// Free-form text: the shutdown reason or the failure description.
    pub description: String,
    /// Close category, used to shape the error pending awaiters see.
    pub kind: CloseKind,
}

/// Category of a connection close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    /// Orderly close handshake completed.
    Graceful,
    /// A shutdown was requested; drain may have been cut short.
    Shutdown,
    /// The transport failed underneath the connection.
    Transport,
    /// The peer violated the protocol.
    Protocol,
    /// The instance was disposed abruptly.
    Disposed,
}

impl CloseReason {
    pub(crate) fn transport(description: impl Into<String>) -> Self {
        Self {
            graceful: false,
            description: description.into(),
            kind: CloseKind::Transport,
        }
    }

    /// The error pending awaiters (and late callers) receive.
    pub(crate) fn to_error(&self) -> SockwireError {
        match self.kind {
            CloseKind::Graceful | CloseKind::Shutdown => SockwireError::WasShutdown {
                reason: self.description.clone(),
            },
            CloseKind::Transport => SockwireError::ConnectionLost(self.description.clone()),
            CloseKind::Protocol => SockwireError::Protocol(self.description.clone()),
            CloseKind::Disposed => SockwireError::Disposed,
        }
    }
}

/// Tunables shared by dialer and listener connections.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Closes the connection when nothing arrives for this long.
    pub receive_timeout: Duration,
    /// Ping cadence; `None` disables keep-alive pings.
    pub keep_alive_interval: Option<Duration>,
    /// Largest accepted payload.
    pub max_payload: u32,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            receive_timeout: Duration::from_secs(60),
            keep_alive_interval: Some(Duration::from_secs(20)),
            max_payload: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }
}

#[derive(Default)]
struct LifeState {
    /// Reason supplied to the first `shutdown` call.
    shutdown_reason: Option<String>,
    /// Timeout supplied to the first `shutdown` call.
    shutdown_timeout: Option<Duration>,
    /// Reason the in-progress close will publish at dispose.
    pending_close: Option<CloseReason>,
}

#[derive(Default)]
struct CloseSlot {
    /// Published close reason; set exactly once.
    reason: Option<CloseReason>,
    /// Subscribers waiting for the disconnect event.
    subscribers: Vec<Box<dyn FnOnce(&CloseReason) + Send>>,
}

/// State shared between the connection handle and its tasks.
pub(crate) struct Shared {
    /// Outbound queue writer; taken at dispose to close the queue.
    queue: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
    /// Pending-request correlation table.
    pub(crate) pending: PendingTable,
    /// In-flight counter driving the lifecycle (see module docs).
    inflight: AtomicI64,
    /// Set by `shutdown`/dispose; rejects new calls early.
    shutdown_flag: AtomicBool,
    /// Guards the close handshake so it starts at most once.
    close_started: AtomicBool,
    /// Guards `atomic_dispose` so it runs at most once.
    disposed: AtomicBool,
    state: Mutex<LifeState>,
    close: Mutex<CloseSlot>,
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
    /// Listener-side identity; only the reserved actions mutate it.
    pub(crate) principal: RwLock<Principal>,
    /// Serializes dialer-side SignIn/SignOut.
    auth_gate: tokio::sync::Mutex<()>,
    /// Dialer-side observable authentication flag.
    pub(crate) authenticated: AtomicBool,
    pub(crate) registry: Arc<ControllerRegistry>,
    pub(crate) scopes: Arc<dyn ScopeFactory>,
    pub(crate) vault: Option<Arc<dyn TokenVault>>,
    pub(crate) side: Side,
    pub(crate) options: ConnectionOptions,
    pub(crate) on_authenticated: Mutex<Vec<Arc<dyn Fn(&Principal) + Send + Sync>>>,
}

impl Shared {
    /// Enqueue an outbound message, failing with the close reason once
    /// the queue is gone.
    pub(crate) fn enqueue(&self, out: Outbound) -> Result<()> {
        let tx = self.queue.lock().clone();
        match tx {
            Some(tx) => tx.send(out).map_err(|_| self.close_error()),
            None => Err(self.close_error()),
        }
    }

    /// Count and enqueue an outbound request frame.
    pub(crate) fn enqueue_request(&self, fragments: Vec<Bytes>) -> Result<()> {
        if self.shutdown_flag.load(Ordering::Acquire) {
            return Err(self.close_error());
        }
        let prev = self.inflight.fetch_add(1, Ordering::AcqRel);
        if prev == -1 {
            // Shutdown finished draining concurrently; undo and reject.
            self.inflight.fetch_sub(1, Ordering::AcqRel);
            return Err(self.close_error());
        }
        if let Err(e) = self.enqueue(Outbound::Frame {
            fragments,
            kind: FrameKind::Request,
        }) {
            self.inflight.fetch_sub(1, Ordering::AcqRel);
            return Err(e);
        }
        Ok(())
    }

    /// Count an accepted inbound request. Returns false when the
    /// connection is shutting down and the request must be dropped.
    pub(crate) fn accept_inbound_request(&self) -> bool {
        if self.shutdown_flag.load(Ordering::Acquire) {
            return false;
        }
        let prev = self.inflight.fetch_add(1, Ordering::AcqRel);
        if prev == -1 {
            self.inflight.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    /// Count one completed response. True when no work remains and the
    /// shutdown decrement already happened (counter reached −1).
    pub(crate) fn complete_one(&self) -> bool {
        self.inflight.fetch_sub(1, Ordering::AcqRel) == 0
    }

    /// All in-flight work has drained on a draining connection.
    pub(crate) fn on_work_drained(self: &Arc<Self>) {
        let (reason, timeout) = {
            let st = self.state.lock();
            let description = st.shutdown_reason.clone().unwrap_or_default();
            (
                CloseReason {
                    graceful: true,
                    description,
                    kind: CloseKind::Graceful,
                },
                st.shutdown_timeout.unwrap_or(PROTOCOL_ERROR_CLOSE_TIMEOUT),
            )
        };
        self.begin_close(CloseCode::Normal, reason, timeout);
    }

    /// Start the close handshake at most once: queue the close frame
    /// and arm a watchdog that disposes if the peer never reciprocates.
    pub(crate) fn begin_close(
        self: &Arc<Self>,
        code: CloseCode,
        reason: CloseReason,
        timeout: Duration,
    ) {
        if self.close_started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state.lock().pending_close = Some(reason.clone());

        let _ = self.enqueue(Outbound::Close {
            code,
            reason: reason.description.clone(),
        });

        let shared = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            shared.atomic_dispose(reason);
        });
    }

    /// Final transition to Closed. Runs exactly once across all paths:
    /// closes the queue writer, poisons the pending table, publishes
    /// the close reason, and fires the disconnect subscribers.
    pub(crate) fn atomic_dispose(&self, reason: CloseReason) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(graceful = reason.graceful, reason = %reason.description, "connection closed");

        self.shutdown_flag.store(true, Ordering::Release);
        *self.queue.lock() = None;
        self.pending.fail_all(reason.clone());

        let subscribers = {
            let mut slot = self.close.lock();
            slot.reason = Some(reason.clone());
            std::mem::take(&mut slot.subscribers)
        };
        for subscriber in subscribers {
            subscriber(&reason);
        }

        let _ = self.closed_tx.send(true);
    }

    /// The error a caller sees once the connection refuses new work.
    pub(crate) fn close_error(&self) -> SockwireError {
        if let Some(reason) = &self.close.lock().reason {
            return reason.to_error();
        }
        if let Some(reason) = &self.state.lock().shutdown_reason {
            return SockwireError::WasShutdown {
                reason: reason.clone(),
            };
        }
        SockwireError::Disposed
    }

    fn pending_close(&self) -> Option<CloseReason> {
        self.state.lock().pending_close.clone()
    }
}

/// One end of a sockwire connection; cheap to clone.
#[derive(Clone)]
pub struct Connection {
    pub(crate) shared: Arc<Shared>,
}

impl Connection {
    /// Wrap an accepted or dialed WebSocket stream and start its
    /// sender, receiver, and keep-alive tasks.
    pub(crate) fn spawn<S>(
        ws: WebSocketStream<S>,
        side: Side,
        registry: Arc<ControllerRegistry>,
        scopes: Arc<dyn ScopeFactory>,
        vault: Option<Arc<dyn TokenVault>>,
        options: ConnectionOptions,
    ) -> Connection
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = ws.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            queue: Mutex::new(Some(tx)),
            pending: PendingTable::new(),
            inflight: AtomicI64::new(0),
            shutdown_flag: AtomicBool::new(false),
            close_started: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            state: Mutex::new(LifeState::default()),
            close: Mutex::new(CloseSlot::default()),
            closed_tx,
            closed_rx,
            principal: RwLock::new(Principal::anonymous()),
            auth_gate: tokio::sync::Mutex::new(()),
            authenticated: AtomicBool::new(false),
            registry,
            scopes,
            vault,
            side,
            options,
            on_authenticated: Mutex::new(Vec::new()),
        });

        tokio::spawn(sender_loop(sink, rx, shared.clone()));
        tokio::spawn(receive_loop(stream, shared.clone()));
        if let Some(interval) = shared.options.keep_alive_interval {
            tokio::spawn(keep_alive_loop(shared.clone(), interval));
        }

        Connection { shared }
    }

    /// Call a remote action and await its typed result.
    ///
    /// Arguments travel as a positional JSON array; the result is
    /// decoded with the codec named in the response header.
    pub async fn call<A, R>(&self, action: &str, args: A) -> Result<R>
    where
        A: ArgsTuple,
        R: DeserializeOwned,
    {
        let values = args.into_values()?;
        let body = JsonCodec::encode_args(&values)?;
        let payload = self.call_raw(action, Bytes::from(body)).await?;
        payload.decode()
    }

    /// Call a remote action with a pre-encoded JSON body.
    ///
    /// The uid is allocated and the awaiter registered *before* the
    /// request enters the queue, so the response can never race its
    /// own registration.
    pub async fn call_raw(&self, action: &str, body: Bytes) -> Result<ResponsePayload> {
        let (uid, rx) = self.shared.pending.register()?;
        let header = Header::request(action, Some(uid), body.len() as u32, None);
        let fragments = protocol::encode_fragments(&header, &body)?;

        if let Err(e) = self.shared.enqueue_request(fragments) {
            self.shared.pending.take(uid);
            return Err(e);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(self.shared.close_error()),
        }
    }

    /// Send a fire-and-forget notification: no uid, no pending entry,
    /// no response. Returns as soon as the message is queued.
    pub fn notify<A: ArgsTuple>(&self, action: &str, args: A) -> Result<()> {
        let values = args.into_values()?;
        let body = JsonCodec::encode_args(&values)?;
        self.notify_raw(action, Bytes::from(body))
    }

    /// Send a notification with a pre-encoded JSON body.
    pub fn notify_raw(&self, action: &str, body: Bytes) -> Result<()> {
        if self.shared.shutdown_flag.load(Ordering::Acquire) {
            return Err(self.shared.close_error());
        }
        let header = Header::request(action, None, body.len() as u32, None);
        let fragments = protocol::encode_fragments(&header, &body)?;
        self.shared.enqueue(Outbound::Frame {
            fragments,
            kind: FrameKind::Notification,
        })
    }

    /// Authenticate this connection with an opaque token.
    ///
    /// Serialized against `sign_out` by a per-connection gate so the
    /// observable flag tracks completed operations.
    pub async fn sign_in(&self, token: &[u8]) -> Result<()> {
        let _gate = self.shared.auth_gate.lock().await;
        let token = std::str::from_utf8(token)
            .map_err(|_| SockwireError::Protocol("token must be UTF-8".to_string()))?
            .to_string();
        let () = self.call("/SignIn", (token,)).await?;
        auth::record_auth_state(&self.shared, true);
        Ok(())
    }

    /// Reset this connection to the unauthenticated principal.
    pub async fn sign_out(&self) -> Result<()> {
        let _gate = self.shared.auth_gate.lock().await;
        let () = self.call("/SignOut", ()).await?;
        auth::record_auth_state(&self.shared, false);
        Ok(())
    }

    /// Dialer-side view of the completed auth operations.
    pub fn is_authenticated(&self) -> bool {
        self.shared.authenticated.load(Ordering::Acquire)
    }

    /// Listener-side principal snapshot.
    pub fn principal(&self) -> Principal {
        self.shared.principal.read().clone()
    }

    /// Subscribe to a successful listener-side sign-in.
    pub fn on_authenticated<F>(&self, f: F)
    where
        F: Fn(&Principal) + Send + Sync + 'static,
    {
        self.shared.on_authenticated.lock().push(Arc::new(f));
    }

    /// Gracefully shut down: reject new calls, drain in-flight work up
    /// to `timeout`, run the close handshake, then dispose. Requests
    /// still in flight past the timeout fail with a *was-shutdown*
    /// error carrying `reason`.
    ///
    /// Repeat calls await the first shutdown's completion.
    pub async fn shutdown(&self, timeout: Duration, reason: &str) -> Result<CloseReason> {
        let first = {
            let mut st = self.shared.state.lock();
            if st.shutdown_reason.is_some() {
                false
            } else {
                st.shutdown_reason = Some(reason.to_string());
                st.shutdown_timeout = Some(timeout);
                true
            }
        };

        if first {
            self.shared.shutdown_flag.store(true, Ordering::Release);
            let prev = self.shared.inflight.fetch_sub(1, Ordering::AcqRel);
            if prev == 0 {
                // Nothing in flight: close immediately.
                self.shared.on_work_drained();
            }
        }

        let mut closed = self.shared.closed_rx.clone();
        let wait = async {
            while !*closed.borrow() {
                if closed.changed().await.is_err() {
                    break;
                }
            }
        };
        if tokio::time::timeout(timeout, wait).await.is_err() {
            let description = self
                .shared
                .state
                .lock()
                .shutdown_reason
                .clone()
                .unwrap_or_else(|| reason.to_string());
            self.shared.atomic_dispose(CloseReason {
                graceful: false,
                description,
                kind: CloseKind::Shutdown,
            });
        }

        Ok(self
            .close_reason()
            .expect("connection disposed without a close reason"))
    }

    /// Abrupt teardown: poison the table and drop the socket without a
    /// close handshake.
    pub fn dispose(&self) {
        self.shared.atomic_dispose(CloseReason {
            graceful: false,
            description: "instance disposed".to_string(),
            kind: CloseKind::Disposed,
        });
    }

    /// Subscribe to the disconnect event.
    ///
    /// Fires exactly once. Subscribing after the connection closed
    /// fires synchronously with the recorded reason.
    pub fn on_disconnected<F>(&self, f: F)
    where
        F: FnOnce(&CloseReason) + Send + 'static,
    {
        let fired = {
            let mut slot = self.shared.close.lock();
            match slot.reason.clone() {
                Some(reason) => Some(reason),
                None => {
                    slot.subscribers.push(Box::new(f));
                    return;
                }
            }
        };
        if let Some(reason) = fired {
            f(&reason);
        }
    }

    /// Await connection closure.
    pub async fn closed(&self) -> CloseReason {
        let mut rx = self.shared.closed_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
        self.close_reason().unwrap_or(CloseReason {
            graceful: false,
            description: "connection tasks vanished".to_string(),
            kind: CloseKind::Disposed,
        })
    }

    /// The published close reason, once closed.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.close.lock().reason.clone()
    }

    /// Check if the connection has fully closed.
    pub fn is_closed(&self) -> bool {
        self.shared.disposed.load(Ordering::Acquire)
    }

    /// Outstanding pending-request count (diagnostics).
    pub fn pending_count(&self) -> usize {
        self.shared.pending.len()
    }

    pub(crate) fn same_as(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("side", &self.shared.side)
            .field("closed", &self.is_closed())
            .field("pending", &self.shared.pending.len())
            .finish()
    }
}

/// Main receive loop - reads frames, assembles logical messages, and
/// routes them.
///
/// Dispatch always happens on a separate task; the receiver is never
/// blocked by user code.
async fn receive_loop<S>(mut stream: SplitStream<WebSocketStream<S>>, shared: Arc<Shared>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut assembler = MessageAssembler::new(shared.options.max_payload);
    let mut closed = shared.closed_rx.clone();

    loop {
        if *closed.borrow() {
            break;
        }
        let next = tokio::select! {
            _ = closed.changed() => break,
            next = tokio::time::timeout(shared.options.receive_timeout, stream.next()) => next,
        };

        let message = match next {
            Err(_elapsed) => {
                shared.atomic_dispose(
                    shared
                        .pending_close()
                        .unwrap_or_else(|| CloseReason::transport("receive timeout")),
                );
                break;
            }
            Ok(None) => {
                shared.atomic_dispose(shared.pending_close().unwrap_or_else(|| {
                    CloseReason::transport("connection closed without close frame")
                }));
                break;
            }
            Ok(Some(Err(e))) => {
                shared.atomic_dispose(
                    shared
                        .pending_close()
                        .unwrap_or_else(|| CloseReason::transport(e.to_string())),
                );
                break;
            }
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Binary(data) => match assembler.push(&data, true) {
                Ok(Some((header, payload))) => route(&shared, header, payload),
                Ok(None) => {}
                Err(e) => {
                    // Undecodable trailer or length mismatch: close with
                    // protocol-error status and abort pending requests.
                    let reason = CloseReason {
                        graceful: false,
                        description: e.to_string(),
                        kind: CloseKind::Protocol,
                    };
                    shared.pending.fail_all(reason.clone());
                    shared.begin_close(
                        CloseCode::Protocol,
                        reason,
                        MALFORMED_HEADER_CLOSE_TIMEOUT,
                    );
                }
            },
            Message::Close(frame) => {
                let reason = shared.pending_close().unwrap_or_else(|| CloseReason {
                    graceful: true,
                    description: frame
                        .map(|f| f.reason.to_string())
                        .unwrap_or_default(),
                    kind: CloseKind::Graceful,
                });
                shared.atomic_dispose(reason);
                break;
            }
            Message::Ping(data) => {
                let _ = shared.enqueue(Outbound::Pong(data));
            }
            Message::Text(_) => {
                let reason = CloseReason {
                    graceful: false,
                    description: "text frames are not allowed".to_string(),
                    kind: CloseKind::Protocol,
                };
                shared.pending.fail_all(reason.clone());
                shared.begin_close(CloseCode::Protocol, reason, PROTOCOL_ERROR_CLOSE_TIMEOUT);
            }
            Message::Pong(_) | Message::Frame(_) => {}
        }
    }
    trace!("receive loop finished");
}

/// Route one assembled logical message.
fn route(shared: &Arc<Shared>, header: Header, payload: Bytes) {
    if header.is_request() {
        if header.uid.is_some() && !shared.accept_inbound_request() {
            debug!(action = ?header.action_name, "request rejected: shutting down");
            return;
        }
        let shared = shared.clone();
        tokio::spawn(crate::dispatch::handle_request(shared, header, payload));
        return;
    }

    // Response: find the awaiter; the uid is present (validated on
    // assembly).
    let uid = header.uid.expect("validated response header");
    match shared.pending.take(uid) {
        Some(completion) => {
            let result = if header.status == Status::Ok {
                PayloadEncoding::from_header(header.payload_encoding.as_deref()).map(|encoding| {
                    ResponsePayload {
                        encoding,
                        body: payload,
                    }
                })
            } else {
                Err(SockwireError::Remote {
                    status: header.status,
                    message: decode_error_message(&header, &payload),
                })
            };
            let _ = completion.send(result);

            if shared.complete_one() {
                shared.on_work_drained();
            }
        }
        None => {
            warn!(uid, "response for unknown or already completed request");
        }
    }
}

/// Error-response payloads carry a message string in the response
/// encoding; fall back to lossy UTF-8 when it does not decode.
fn decode_error_message(header: &Header, payload: &Bytes) -> String {
    PayloadEncoding::from_header(header.payload_encoding.as_deref())
        .ok()
        .and_then(|encoding| encoding.decode::<String>(payload).ok())
        .unwrap_or_else(|| String::from_utf8_lossy(payload).into_owned())
}

/// Periodic keep-alive pings until the connection closes.
async fn keep_alive_loop(shared: Arc<Shared>, interval: Duration) {
    let mut timer = tokio::time::interval(interval);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut closed = shared.closed_rx.clone();

    loop {
        tokio::select! {
            _ = closed.changed() => break,
            _ = timer.tick() => {
                if shared.enqueue(Outbound::Ping).is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::ControllerRegistry;
    use crate::scope::NoopScopeFactory;
    use std::sync::atomic::AtomicUsize;

    async fn ws_pair() -> (
        WebSocketStream<tokio::io::DuplexStream>,
        WebSocketStream<tokio::io::DuplexStream>,
    ) {
        let (client, server) = tokio::io::duplex(256 * 1024);
        let (dialer, listener) = tokio::join!(
            async {
                tokio_tungstenite::client_async("ws://localhost/", client)
                    .await
                    .expect("client handshake failed")
                    .0
            },
            async {
                tokio_tungstenite::accept_async(server)
                    .await
                    .expect("server handshake failed")
            }
        );
        (dialer, listener)
    }

    fn listener_registry() -> ControllerRegistry {
        let mut registry = ControllerRegistry::new();
        registry
            .controller("Math")
            .allow_anonymous()
            .action("Sum", |_ctx, (a, b): (i32, i32)| async move { Ok(a + b) });
        registry
            .controller("Slow")
            .allow_anonymous()
            .action("Wait", |_ctx, (ms,): (u64,)| async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(ms)
            });
        registry
    }

    async fn connected_pair(registry: ControllerRegistry) -> (Connection, Connection) {
        let (dialer_ws, listener_ws) = ws_pair().await;
        let dialer = Connection::spawn(
            dialer_ws,
            Side::Dialer,
            Arc::new(ControllerRegistry::new()),
            Arc::new(NoopScopeFactory),
            None,
            ConnectionOptions::default(),
        );
        let listener = Connection::spawn(
            listener_ws,
            Side::Listener,
            Arc::new(registry),
            Arc::new(NoopScopeFactory),
            None,
            ConnectionOptions::default(),
        );
        (dialer, listener)
    }

    #[tokio::test]
    async fn test_call_roundtrip() {
        let (dialer, _listener) = connected_pair(listener_registry()).await;

        let sum: i32 = dialer.call("Math/Sum", (2, 3)).await.unwrap();
        assert_eq!(sum, 5);
        assert_eq!(dialer.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_not_found() {
        let (dialer, _listener) = connected_pair(listener_registry()).await;

        let err = dialer
            .call::<_, i32>("Nope/Nope", ())
            .await
            .unwrap_err();
        match err {
            SockwireError::Remote { status, message } => {
                assert_eq!(status, Status::NotFound);
                assert!(message.contains("Nope"));
            }
            other => panic!("expected remote NotFound, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_concurrent_calls_correlate() {
        let (dialer, _listener) = connected_pair(listener_registry()).await;

        let mut handles = Vec::new();
        for i in 0..32i32 {
            let conn = dialer.clone();
            handles.push(tokio::spawn(async move {
                let sum: i32 = conn.call("Math/Sum", (i, i)).await.unwrap();
                assert_eq!(sum, i * 2);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_notification_registers_no_pending() {
        let (dialer, _listener) = connected_pair(listener_registry()).await;

        dialer.notify("Math/Sum", (1, 2)).unwrap();
        assert_eq!(dialer.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_graceful_shutdown_idle() {
        let (dialer, listener) = connected_pair(listener_registry()).await;

        let reason = dialer
            .shutdown(Duration::from_secs(5), "bye")
            .await
            .unwrap();
        assert!(reason.graceful);
        assert_eq!(reason.description, "bye");
        assert!(dialer.is_closed());

        // The peer observes the close too.
        listener.closed().await;
        assert!(listener.is_closed());
    }

    #[tokio::test]
    async fn test_calls_after_shutdown_fail_with_reason() {
        let (dialer, _listener) = connected_pair(listener_registry()).await;

        dialer
            .shutdown(Duration::from_secs(5), "bye")
            .await
            .unwrap();

        let err = dialer.call::<_, i32>("Math/Sum", (1, 2)).await.unwrap_err();
        match err {
            SockwireError::WasShutdown { reason } => assert_eq!(reason, "bye"),
            other => panic!("expected WasShutdown, got {:?}", other),
        }

        let err = dialer.notify("Math/Sum", (1, 2)).unwrap_err();
        assert!(matches!(err, SockwireError::WasShutdown { .. }));
    }

    #[tokio::test]
    async fn test_graceful_shutdown_drains_in_flight() {
        let (dialer, _listener) = connected_pair(listener_registry()).await;

        let conn = dialer.clone();
        let call = tokio::spawn(async move {
            conn.call::<_, u64>("Slow/Wait", (100u64,)).await
        });
        // Give the request time to get on the wire.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let reason = dialer
            .shutdown(Duration::from_secs(5), "drain me")
            .await
            .unwrap();

        // The in-flight call resolved normally before the close.
        assert_eq!(call.await.unwrap().unwrap(), 100);
        assert!(reason.graceful);
    }

    #[tokio::test]
    async fn test_forced_shutdown_fails_stragglers() {
        let (dialer, _listener) = connected_pair(listener_registry()).await;

        let conn = dialer.clone();
        let call = tokio::spawn(async move {
            conn.call::<_, u64>("Slow/Wait", (60_000u64,)).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let reason = dialer
            .shutdown(Duration::from_millis(100), "cut short")
            .await
            .unwrap();
        assert!(!reason.graceful);

        let err = call.await.unwrap().unwrap_err();
        match err {
            SockwireError::WasShutdown { reason } => assert_eq!(reason, "cut short"),
            other => panic!("expected WasShutdown, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_repeat_shutdown_awaits_first() {
        let (dialer, _listener) = connected_pair(listener_registry()).await;

        let first = dialer.shutdown(Duration::from_secs(5), "bye").await.unwrap();
        let second = dialer
            .shutdown(Duration::from_secs(5), "ignored")
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(second.description, "bye");
    }

    #[tokio::test]
    async fn test_on_disconnected_fires_exactly_once() {
        let (dialer, _listener) = connected_pair(listener_registry()).await;

        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        dialer.on_disconnected(move |reason| {
            assert!(reason.graceful);
            fired2.fetch_add(1, Ordering::SeqCst);
        });

        dialer.shutdown(Duration::from_secs(5), "bye").await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_late_subscribe_fires_synchronously() {
        let (dialer, _listener) = connected_pair(listener_registry()).await;
        dialer.shutdown(Duration::from_secs(5), "bye").await.unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        dialer.on_disconnected(move |reason| {
            assert_eq!(reason.description, "bye");
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        // Fired during the subscription call itself.
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dispose_fails_pending_with_disposed() {
        let (dialer, _listener) = connected_pair(listener_registry()).await;

        let conn = dialer.clone();
        let call = tokio::spawn(async move {
            conn.call::<_, u64>("Slow/Wait", (60_000u64,)).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        dialer.dispose();

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, SockwireError::Disposed));
        assert!(!dialer.close_reason().unwrap().graceful);
    }

    #[tokio::test]
    async fn test_peer_loss_fails_pending_with_transport_error() {
        let (dialer, listener) = connected_pair(listener_registry()).await;

        let conn = dialer.clone();
        let call = tokio::spawn(async move {
            conn.call::<_, u64>("Slow/Wait", (60_000u64,)).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The peer vanishes without a close handshake.
        listener.dispose();

        let err = call.await.unwrap().unwrap_err();
        assert!(
            matches!(err, SockwireError::ConnectionLost(_)),
            "got {:?}",
            err
        );
        let reason = dialer.closed().await;
        assert!(!reason.graceful);
        assert_eq!(reason.kind, CloseKind::Transport);
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let (dialer, _listener) = connected_pair(listener_registry()).await;

        dialer.dispose();
        let first = dialer.close_reason().unwrap();
        dialer.dispose();
        dialer.shared.atomic_dispose(CloseReason::transport("late"));
        assert_eq!(dialer.close_reason().unwrap(), first);
    }

    #[tokio::test]
    async fn test_large_payload_fragments_and_reassembles() {
        let mut registry = ControllerRegistry::new();
        registry
            .controller("Echo")
            .allow_anonymous()
            .action("Blob", |_ctx, (data,): (String,)| async move { Ok(data) });

        let (dialer, _listener) = connected_pair(registry).await;

        // Well past one fragment in both directions: the request and
        // the response each travel as several data frames.
        let big = "y".repeat(8 * crate::protocol::MAX_FRAGMENT);
        let echoed: String = dialer.call("Echo/Blob", (big.clone(),)).await.unwrap();
        assert_eq!(echoed, big);
    }

    #[tokio::test]
    async fn test_bidirectional_calls() {
        let mut dialer_side = ControllerRegistry::new();
        dialer_side
            .controller("Client")
            .action("Double", |_ctx, (n,): (i32,)| async move { Ok(n * 2) });

        let (dialer_ws, listener_ws) = ws_pair().await;
        let dialer = Connection::spawn(
            dialer_ws,
            Side::Dialer,
            Arc::new(dialer_side),
            Arc::new(NoopScopeFactory),
            None,
            ConnectionOptions::default(),
        );
        let listener = Connection::spawn(
            listener_ws,
            Side::Listener,
            Arc::new(listener_registry()),
            Arc::new(NoopScopeFactory),
            None,
            ConnectionOptions::default(),
        );

        // Listener calls back into the dialer; no permission check on
        // the dialer side.
        let doubled: i32 = listener.call("Client/Double", (21,)).await.unwrap();
        assert_eq!(doubled, 42);

        let sum: i32 = dialer.call("Math/Sum", (40, 2)).await.unwrap();
        assert_eq!(sum, 42);
    }
}
