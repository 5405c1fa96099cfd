//! In-process transport pair.
//!
//! Both ends share one link: closing either side closes both, and each side
//! observes a single `Closed` event. Messages are serialized to wire text and
//! parsed again on the other end so the pair exercises the real codec.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tracing::debug;

use super::{DEFAULT_EVENT_CAPACITY, EventSink, Transport, TransportChannel, TransportEvents};
use crate::errors::TransportError;
use crate::message::Message;

struct Link {
    closed: AtomicBool,
}

/// One end of an in-memory link.
pub struct MemoryTransport {
    name: String,
    link: Arc<Link>,
    local: EventSink,
    remote: EventSink,
}

/// A [`MemoryTransport`] with its inbound events, before being boxed into a
/// [`TransportChannel`].
pub struct MemoryEndpoint {
    /// Outbound half.
    pub transport: Arc<MemoryTransport>,
    /// Inbound events.
    pub events: TransportEvents,
}

impl MemoryEndpoint {
    /// Erase the concrete transport type.
    pub fn into_channel(self) -> TransportChannel {
        TransportChannel::new(self.transport, self.events)
    }
}

impl MemoryTransport {
    /// A connected pair of channels.
    pub fn pair() -> (TransportChannel, TransportChannel) {
        let (a, b) = Self::endpoints();
        (a.into_channel(), b.into_channel())
    }

    /// A connected pair that keeps the concrete transport type.
    pub fn endpoints() -> (MemoryEndpoint, MemoryEndpoint) {
        let link = Arc::new(Link {
            closed: AtomicBool::new(false),
        });
        let (a_sink, a_events) = EventSink::channel("memory:a", DEFAULT_EVENT_CAPACITY);
        let (b_sink, b_events) = EventSink::channel("memory:b", DEFAULT_EVENT_CAPACITY);

        let a = Self {
            name: "memory:a".into(),
            link: Arc::clone(&link),
            local: a_sink.clone(),
            remote: b_sink.clone(),
        };
        let b = Self {
            name: "memory:b".into(),
            link,
            local: b_sink,
            remote: a_sink,
        };

        (
            MemoryEndpoint {
                transport: Arc::new(a),
                events: a_events,
            },
            MemoryEndpoint {
                transport: Arc::new(b),
                events: b_events,
            },
        )
    }

    /// Push raw text to the other end, bypassing serialization.
    pub async fn send_raw(&self, raw: &str) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.remote.deliver_text(raw).await;
        Ok(())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, message: &Message) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let text = message.to_json()?;
        self.remote.deliver_text(&text).await;
        Ok(())
    }

    async fn close(&self) {
        if self.link.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(transport = %self.name, "closing memory link");
        let _ = self.local.close().await;
        let _ = self.remote.close().await;
    }

    fn is_closed(&self) -> bool {
        self.link.closed.load(Ordering::SeqCst)
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}
