//! Peer: one protocol endpoint on top of a transport channel.
//!
//! A [`Peer`] correlates outgoing requests with their responses, enforces
//! per-request deadlines, and hands inbound requests and notifications to the
//! registered handlers. It owns two tasks:
//!
//! - the receive loop, which reads [`TransportEvent`]s in arrival order,
//!   resolves responses inline and queues everything else;
//! - the dispatch worker, which runs handlers one at a time, each on its own
//!   task so a failing or panicking handler is contained.
//!
//! Every pending call resolves exactly once: removal from the pending table
//! under its lock decides whether the response, the deadline or the close
//! path wins.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::errors::PeerError;
use crate::message::{Message, Notification, Request, Response, generate_request_id};
use crate::transport::{Transport, TransportChannel, TransportEvent, TransportEvents};

/// Base request deadline.
const BASE_TIMEOUT_MS: u64 = 2000 * 15;
/// Deadline added per request already pending.
const TIMEOUT_STEP_MS: u64 = 200;

/// Deadline for a request issued while `pending` others are outstanding.
pub fn request_timeout(pending: usize) -> Duration {
    let pending = u64::try_from(pending).unwrap_or(u64::MAX);
    Duration::from_millis(BASE_TIMEOUT_MS.saturating_add(TIMEOUT_STEP_MS.saturating_mul(pending)))
}

/// Handles inbound requests.
///
/// Returning an error (or panicking) answers the request with a `500` error
/// response whose reason is the error's alternate display.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Handle one request. Reply through `responder`.
    async fn handle(&self, request: Request, responder: Responder) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> RequestHandler for F
where
    F: Fn(Request, Responder) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, request: Request, responder: Responder) -> anyhow::Result<()> {
        self(request, responder).await
    }
}

/// Handles inbound notifications.
#[async_trait]
pub trait NotificationHandler: Send + Sync + 'static {
    /// Handle one notification. Errors are logged.
    async fn handle(&self, notification: Notification) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> NotificationHandler for F
where
    F: Fn(Notification) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, notification: Notification) -> anyhow::Result<()> {
        self(notification).await
    }
}

/// Replies to one inbound request.
///
/// Each call sends a response; calling twice sends two.
#[derive(Clone)]
pub struct Responder {
    peer_id: Arc<str>,
    request_id: u32,
    transport: Arc<dyn Transport>,
}

impl Responder {
    /// Id of the request being answered.
    pub fn request_id(&self) -> u32 {
        self.request_id
    }

    /// Send a success response.
    pub async fn accept(&self, data: Value) -> Result<(), PeerError> {
        self.send(Response::Success {
            id: self.request_id,
            data,
        })
        .await
    }

    /// Send an error response.
    pub async fn reject(&self, code: i32, reason: impl Into<String>) -> Result<(), PeerError> {
        self.send(Response::Error {
            id: self.request_id,
            error_code: code,
            error_reason: reason.into(),
        })
        .await
    }

    async fn send(&self, response: Response) -> Result<(), PeerError> {
        self.transport
            .send(&Message::Response(response))
            .await
            .map_err(|e| {
                warn!(peer_id = %self.peer_id, id = self.request_id, error = %e, "failed to send response");
                PeerError::from(e)
            })
    }
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder")
            .field("peer_id", &self.peer_id)
            .field("request_id", &self.request_id)
            .finish_non_exhaustive()
    }
}

/// How a peer picks wire ids for its outgoing requests.
#[derive(Clone, Default)]
pub enum RequestIdSource {
    /// Uniform random ids in `[0, 10_000_000)`.
    #[default]
    Random,
    /// A per-peer counter starting at 1.
    Sequential,
    /// A caller supplied generator.
    Custom(Arc<dyn Fn() -> u32 + Send + Sync>),
}

impl fmt::Debug for RequestIdSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Random => f.write_str("Random"),
            Self::Sequential => f.write_str("Sequential"),
            Self::Custom(_) => f.write_str("Custom"),
        }
    }
}

/// Per-peer settings.
#[derive(Debug, Clone, Default)]
pub struct PeerOptions {
    /// Wire id source for outgoing requests.
    pub request_ids: RequestIdSource,
}

enum IdGenerator {
    Random,
    Sequential(AtomicU32),
    Custom(Arc<dyn Fn() -> u32 + Send + Sync>),
}

impl IdGenerator {
    fn next(&self) -> u32 {
        match self {
            Self::Random => generate_request_id(),
            Self::Sequential(counter) => counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1),
            Self::Custom(f) => f(),
        }
    }
}

impl From<RequestIdSource> for IdGenerator {
    fn from(source: RequestIdSource) -> Self {
        match source {
            RequestIdSource::Random => Self::Random,
            RequestIdSource::Sequential => Self::Sequential(AtomicU32::new(0)),
            RequestIdSource::Custom(f) => Self::Custom(f),
        }
    }
}

struct PendingCall {
    method: String,
    seq: u64,
    tx: oneshot::Sender<Result<Value, PeerError>>,
}

enum Inbound {
    Request(Request),
    Notification(Notification),
}

type CloseListener = Box<dyn FnOnce() + Send>;

struct PeerInner {
    id: Arc<str>,
    transport: Arc<dyn Transport>,
    closed: AtomicBool,
    pending: Mutex<HashMap<u32, PendingCall>>,
    next_seq: AtomicU64,
    ids: IdGenerator,
    request_handler: RwLock<Option<Arc<dyn RequestHandler>>>,
    notification_handler: RwLock<Option<Arc<dyn NotificationHandler>>>,
    close_listeners: Mutex<Option<Vec<CloseListener>>>,
    close_token: CancellationToken,
    data: Mutex<HashMap<String, Value>>,
}

/// A protoo endpoint. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

/// Non-owning handle to a [`Peer`].
#[derive(Clone)]
pub struct WeakPeer {
    inner: Weak<PeerInner>,
}

impl WeakPeer {
    /// The peer, if it is still alive.
    pub fn upgrade(&self) -> Option<Peer> {
        self.inner.upgrade().map(|inner| Peer { inner })
    }

    /// Whether this handle points at `peer`.
    pub fn is(&self, peer: &Peer) -> bool {
        std::ptr::eq(self.inner.as_ptr(), Arc::as_ptr(&peer.inner))
    }
}

impl Peer {
    /// Wrap `channel` in a peer with default options.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn new(id: impl Into<String>, channel: TransportChannel) -> Self {
        Self::with_options(id, channel, PeerOptions::default())
    }

    /// Wrap `channel` in a peer.
    pub fn with_options(id: impl Into<String>, channel: TransportChannel, options: PeerOptions) -> Self {
        let id: String = id.into();
        let (transport, events) = channel.into_parts();
        let peer = Self {
            inner: Arc::new(PeerInner {
                id: id.into(),
                transport,
                closed: AtomicBool::new(false),
                pending: Mutex::new(HashMap::new()),
                next_seq: AtomicU64::new(0),
                ids: options.request_ids.into(),
                request_handler: RwLock::new(None),
                notification_handler: RwLock::new(None),
                close_listeners: Mutex::new(Some(Vec::new())),
                close_token: CancellationToken::new(),
                data: Mutex::new(HashMap::new()),
            }),
        };

        if peer.inner.transport.is_closed() {
            debug!(peer_id = %peer.inner.id, "transport already closed");
            peer.handle_transport_closed();
            return peer;
        }

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        drop(tokio::spawn(run_dispatch_worker(peer.clone(), inbound_rx)));
        drop(tokio::spawn(run_receive_loop(peer.clone(), events, inbound_tx)));
        peer
    }

    /// Peer id.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Whether the peer has closed.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Number of requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Application data attached to this peer.
    pub fn data(&self) -> MutexGuard<'_, HashMap<String, Value>> {
        self.inner.data.lock()
    }

    /// Description of the underlying transport.
    pub fn transport_description(&self) -> String {
        self.inner.transport.describe()
    }

    /// Non-owning handle.
    pub fn downgrade(&self) -> WeakPeer {
        WeakPeer {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Whether both handles refer to the same peer.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Install the request handler, replacing any previous one.
    pub fn set_request_handler(&self, handler: impl RequestHandler) {
        *self.inner.request_handler.write() = Some(Arc::new(handler));
    }

    /// Remove the request handler. Inbound requests are then dropped.
    pub fn clear_request_handler(&self) {
        *self.inner.request_handler.write() = None;
    }

    /// Install the notification handler, replacing any previous one.
    pub fn set_notification_handler(&self, handler: impl NotificationHandler) {
        *self.inner.notification_handler.write() = Some(Arc::new(handler));
    }

    /// Remove the notification handler.
    pub fn clear_notification_handler(&self) {
        *self.inner.notification_handler.write() = None;
    }

    /// Run `listener` once when the peer closes, or now if it already has.
    pub fn on_close(&self, listener: impl FnOnce() + Send + 'static) {
        let mut listeners = self.inner.close_listeners.lock();
        if let Some(listeners) = listeners.as_mut() {
            listeners.push(Box::new(listener));
            return;
        }
        drop(listeners);
        listener();
    }

    /// Resolves once the peer has closed.
    pub async fn closed(&self) {
        self.inner.close_token.cancelled().await;
    }

    /// Send a request with the default deadline and await its response.
    pub async fn request(&self, method: impl Into<String>, data: Value) -> Result<Value, PeerError> {
        self.request_with_timeout(method, data, None).await
    }

    /// Send a request and await its response.
    ///
    /// `timeout` overrides the default deadline from [`request_timeout`].
    pub async fn request_with_timeout(
        &self,
        method: impl Into<String>,
        data: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, PeerError> {
        let request = Request::with_id(self.inner.ids.next(), method, data);
        let id = request.id;
        let method = request.method.clone();
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = oneshot::channel();

        let deadline = {
            let mut pending = self.inner.pending.lock();
            // Checked under the lock so a concurrent close either sees this
            // entry when draining or we see its flag.
            if self.is_closed() {
                return Err(PeerError::Closed);
            }
            let deadline = timeout.unwrap_or_else(|| request_timeout(pending.len()));
            let call = PendingCall {
                method: method.clone(),
                seq,
                tx,
            };
            if let Some(displaced) = pending.insert(id, call) {
                warn!(
                    peer_id = %self.inner.id,
                    id,
                    method = %displaced.method,
                    "request id reused, failing the older call"
                );
                let _ = displaced.tx.send(Err(PeerError::Closed));
            }
            deadline
        };
        let guard = PendingGuard {
            peer: self,
            id,
            seq,
        };

        debug!(peer_id = %self.inner.id, %method, id, "request()");
        if let Err(e) = self.inner.transport.send(&Message::Request(request)).await {
            warn!(peer_id = %self.inner.id, %method, id, error = %e, "request send failed");
            drop(guard.take());
            return Err(PeerError::Closed);
        }

        match tokio::time::timeout(deadline, &mut rx).await {
            Ok(outcome) => outcome.unwrap_or(Err(PeerError::Closed)),
            Err(_elapsed) => {
                if guard.take().is_some() {
                    warn!(peer_id = %self.inner.id, %method, id, "request timeout");
                    return Err(PeerError::Timeout { method, id });
                }
                // Another path removed the entry first and is delivering.
                rx.await.unwrap_or(Err(PeerError::Closed))
            }
        }
    }

    /// Send a notification.
    pub async fn notify(&self, method: impl Into<String>, data: Value) -> Result<(), PeerError> {
        let notification = Notification::new(method, data);
        debug!(peer_id = %self.inner.id, method = %notification.method, "notify()");
        self.inner
            .transport
            .send(&Message::Notification(notification))
            .await
            .map_err(PeerError::from)
    }

    /// Close the peer and its transport. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(peer_id = %self.inner.id, "close()");
        self.inner.transport.close().await;
        self.finish_close();
    }

    fn handle_transport_closed(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(peer_id = %self.inner.id, "transport closed");
        self.finish_close();
    }

    fn finish_close(&self) {
        let drained: Vec<PendingCall> = self
            .inner
            .pending
            .lock()
            .drain()
            .map(|(_, call)| call)
            .collect();
        for call in drained {
            let _ = call.tx.send(Err(PeerError::Closed));
        }
        self.inner.close_token.cancel();

        let listeners = self.inner.close_listeners.lock().take().unwrap_or_default();
        for listener in listeners {
            listener();
        }
    }

    fn take_pending(&self, id: u32, seq: u64) -> Option<PendingCall> {
        let mut pending = self.inner.pending.lock();
        match pending.get(&id) {
            Some(call) if call.seq == seq => pending.remove(&id),
            _ => None,
        }
    }

    fn handle_response(&self, response: Response) {
        let id = response.id();
        let Some(call) = self.inner.pending.lock().remove(&id) else {
            error!(
                peer_id = %self.inner.id,
                id,
                "received response does not match any sent request"
            );
            return;
        };
        let outcome = match response {
            Response::Success { data, .. } => Ok(data),
            Response::Error {
                error_code,
                error_reason,
                ..
            } => Err(PeerError::Protocol {
                code: error_code,
                reason: error_reason,
            }),
        };
        // The caller may have given up on the call; nothing to deliver then.
        let _ = call.tx.send(outcome);
    }

    async fn invoke_request_handler(&self, request: Request) {
        let handler = self.inner.request_handler.read().clone();
        let Some(handler) = handler else {
            warn!(
                peer_id = %self.inner.id,
                method = %request.method,
                id = request.id,
                "no request handler, dropping request"
            );
            return;
        };

        let responder = Responder {
            peer_id: Arc::clone(&self.inner.id),
            request_id: request.id,
            transport: Arc::clone(&self.inner.transport),
        };
        let method = request.method.clone();
        let task = {
            let responder = responder.clone();
            tokio::spawn(async move { handler.handle(request, responder).await })
        };

        let reason = match task.await {
            Ok(Ok(())) => return,
            Ok(Err(e)) => format!("{e:#}"),
            Err(e) => format!("request handler failed: {e}"),
        };
        warn!(peer_id = %self.inner.id, %method, id = responder.request_id, %reason, "request handler error");
        let _ = responder.reject(500, reason).await;
    }

    async fn invoke_notification_handler(&self, notification: Notification) {
        let handler = self.inner.notification_handler.read().clone();
        let Some(handler) = handler else {
            return;
        };
        let method = notification.method.clone();
        match tokio::spawn(async move { handler.handle(notification).await }).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(peer_id = %self.inner.id, %method, error = %format!("{e:#}"), "notification handler error");
            }
            Err(e) => {
                warn!(peer_id = %self.inner.id, %method, error = %e, "notification handler failed");
            }
        }
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.inner.id)
            .field("closed", &self.is_closed())
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

/// Removes a pending call on drop, so abandoned requests do not linger.
struct PendingGuard<'a> {
    peer: &'a Peer,
    id: u32,
    seq: u64,
}

impl PendingGuard<'_> {
    fn take(self) -> Option<PendingCall> {
        self.peer.take_pending(self.id, self.seq)
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        drop(self.peer.take_pending(self.id, self.seq));
    }
}

async fn run_receive_loop(
    peer: Peer,
    mut events: TransportEvents,
    inbound: mpsc::UnboundedSender<Inbound>,
) {
    while let Some(event) = events.recv().await {
        if peer.is_closed() {
            break;
        }
        match event {
            TransportEvent::Message(Message::Response(response)) => peer.handle_response(response),
            TransportEvent::Message(Message::Request(request)) => {
                let _ = inbound.send(Inbound::Request(request));
            }
            TransportEvent::Message(Message::Notification(notification)) => {
                let _ = inbound.send(Inbound::Notification(notification));
            }
            TransportEvent::Closed => break,
        }
    }
    peer.handle_transport_closed();
}

async fn run_dispatch_worker(peer: Peer, mut inbound: mpsc::UnboundedReceiver<Inbound>) {
    while let Some(item) = inbound.recv().await {
        if peer.is_closed() {
            break;
        }
        match item {
            Inbound::Request(request) => peer.invoke_request_handler(request).await,
            Inbound::Notification(notification) => {
                peer.invoke_notification_handler(notification).await;
            }
        }
    }
}
