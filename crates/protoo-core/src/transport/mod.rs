//! Transport channel contract.
//!
//! A transport carries whole protoo messages in both directions. Outbound
//! traffic goes through [`Transport::send`]; inbound traffic arrives as
//! [`TransportEvent`]s on the receiver half of a [`TransportChannel`]. Every
//! transport emits exactly one [`TransportEvent::Closed`], whether the link
//! was closed locally, by the remote side, or failed.

pub mod memory;
pub mod stream;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::warn;

use crate::errors::TransportError;
use crate::message::{Message, parse};

pub use memory::MemoryTransport;
pub use stream::StreamTransport;

/// Default capacity of a transport's inbound event queue.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Something that happened on a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A well-formed message arrived.
    Message(Message),
    /// The transport closed. Emitted exactly once, always last.
    Closed,
}

/// Receiver half of a transport's inbound events.
pub type TransportEvents = mpsc::Receiver<TransportEvent>;

/// Outbound half of a message transport.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send one message. Fails once the transport is closed.
    async fn send(&self, message: &Message) -> Result<(), TransportError>;

    /// Close the link. Idempotent.
    async fn close(&self);

    /// Whether the transport has closed.
    fn is_closed(&self) -> bool;

    /// Short description for log fields, e.g. the remote address.
    fn describe(&self) -> String {
        "transport".into()
    }
}

/// A connected transport together with its inbound event stream.
pub struct TransportChannel {
    transport: Arc<dyn Transport>,
    events: TransportEvents,
}

impl TransportChannel {
    /// Pair a transport with the receiver its events are delivered to.
    pub fn new(transport: Arc<dyn Transport>, events: TransportEvents) -> Self {
        Self { transport, events }
    }

    /// The outbound half.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Split into outbound and inbound halves.
    pub fn into_parts(self) -> (Arc<dyn Transport>, TransportEvents) {
        (self.transport, self.events)
    }

    /// Close the transport and discard the event stream.
    pub async fn close(self) {
        self.transport.close().await;
    }
}

impl fmt::Debug for TransportChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportChannel")
            .field("transport", &self.transport.describe())
            .field("closed", &self.transport.is_closed())
            .finish()
    }
}

/// Producer side of a transport's event stream.
///
/// Shared by a transport's tasks. [`TransportEvent::Closed`] is delivered at
/// most once no matter how many tasks race to close.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<TransportEvent>,
    closed: Arc<AtomicBool>,
    label: Arc<str>,
}

impl EventSink {
    /// Create a sink and the receiver it feeds.
    pub fn channel(label: impl Into<Arc<str>>, capacity: usize) -> (Self, TransportEvents) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                closed: Arc::new(AtomicBool::new(false)),
                label: label.into(),
            },
            rx,
        )
    }

    /// Parse one inbound text message and deliver it.
    ///
    /// Malformed text is logged and dropped; the link stays open.
    pub async fn deliver_text(&self, raw: &str) {
        match parse(raw) {
            Ok(message) => self.deliver(message).await,
            Err(e) => warn!(transport = %self.label, error = %e, "dropping malformed message"),
        }
    }

    /// Deliver an already decoded message.
    pub async fn deliver(&self, message: Message) {
        if self.is_closed() {
            return;
        }
        // The receiver is gone once the consumer stopped; nothing to do then.
        let _ = self.tx.send(TransportEvent::Message(message)).await;
    }

    /// Emit the closing event. Returns `false` if it was already emitted.
    pub async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.tx.send(TransportEvent::Closed).await;
        true
    }

    /// Whether the closing event has been emitted.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
