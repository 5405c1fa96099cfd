//! Length-delimited transport over any byte stream.
//!
//! Each message is a UTF-8 JSON body preceded by a 4-byte big-endian length.
//! Frames are reassembled from however the stream fragments them.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{DEFAULT_EVENT_CAPACITY, EventSink, Transport, TransportChannel};
use crate::errors::TransportError;
use crate::message::Message;

/// Largest frame accepted or sent.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Outbound frames buffered before `send` waits for the writer.
const SEND_QUEUE_CAPACITY: usize = 256;

struct Shared {
    label: String,
    closed: AtomicBool,
    events: EventSink,
    cancel: CancellationToken,
}

impl Shared {
    async fn shut_down(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.cancel.cancel();
        let _ = self.events.close().await;
    }
}

/// Transport over a length-delimited byte stream.
pub struct StreamTransport {
    outbound: mpsc::Sender<Bytes>,
    shared: Arc<Shared>,
}

impl StreamTransport {
    /// Spawn reader and writer tasks over `io` and return the channel.
    pub fn spawn<S>(io: S, label: impl Into<String>) -> TransportChannel
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let label = label.into();
        let codec = LengthDelimitedCodec::builder()
            .length_field_length(4)
            .big_endian()
            .max_frame_length(MAX_FRAME_LENGTH)
            .new_codec();
        let (mut sink, mut stream) = Framed::new(io, codec).split();

        let (events, rx) = EventSink::channel(label.clone(), DEFAULT_EVENT_CAPACITY);
        let (outbound, mut outbound_rx) = mpsc::channel::<Bytes>(SEND_QUEUE_CAPACITY);
        let shared = Arc::new(Shared {
            label,
            closed: AtomicBool::new(false),
            events,
            cancel: CancellationToken::new(),
        });

        let writer = Arc::clone(&shared);
        drop(tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    frame = outbound_rx.recv() => {
                        let Some(frame) = frame else { break };
                        if let Err(e) = sink.send(frame).await {
                            warn!(transport = %writer.label, error = %e, "stream write failed");
                            break;
                        }
                    }
                    () = writer.cancel.cancelled() => break,
                }
            }
            let _ = sink.close().await;
            writer.shut_down().await;
        }));

        let reader = Arc::clone(&shared);
        drop(tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = stream.next() => match frame {
                        Some(Ok(bytes)) => match std::str::from_utf8(&bytes) {
                            Ok(text) => reader.events.deliver_text(text).await,
                            Err(e) => {
                                warn!(transport = %reader.label, error = %e, "dropping non UTF-8 frame");
                            }
                        },
                        Some(Err(e)) => {
                            warn!(transport = %reader.label, error = %e, "stream read failed");
                            break;
                        }
                        None => {
                            debug!(transport = %reader.label, "stream reached EOF");
                            break;
                        }
                    },
                    () = reader.cancel.cancelled() => break,
                }
            }
            reader.shut_down().await;
        }));

        TransportChannel::new(Arc::new(Self { outbound, shared }), rx)
    }
}

#[async_trait]
impl Transport for StreamTransport {
    async fn send(&self, message: &Message) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let text = message.to_json()?;
        self.outbound
            .send(Bytes::from(text))
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(transport = %self.shared.label, "closing stream transport");
        self.shared.shut_down().await;
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    fn describe(&self) -> String {
        self.shared.label.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::AsyncWriteExt;

    use crate::message::{Notification, Request};
    use crate::transport::TransportEvent;

    #[tokio::test]
    async fn messages_cross_a_duplex_stream() {
        let (left, right) = tokio::io::duplex(64);
        let (a_tx, _a_rx) = StreamTransport::spawn(left, "left").into_parts();
        let (_b_tx, mut b_rx) = StreamTransport::spawn(right, "right").into_parts();

        let msg = Message::Request(Request::with_id(5, "join", json!({"name": "x".repeat(200)})));
        a_tx.send(&msg).await.unwrap();
        assert_eq!(b_rx.recv().await, Some(TransportEvent::Message(msg)));
    }

    #[tokio::test]
    async fn reassembles_fragmented_frames() {
        let (mut raw, io) = tokio::io::duplex(1024);
        let (_tx, mut rx) = StreamTransport::spawn(io, "frag").into_parts();

        let body = br#"{"notification":true,"method":"chunked","data":[1,2,3]}"#;
        let len = u32::try_from(body.len()).unwrap().to_be_bytes();
        let mut frame = len.to_vec();
        frame.extend_from_slice(body);
        for chunk in frame.chunks(3) {
            raw.write_all(chunk).await.unwrap();
            raw.flush().await.unwrap();
        }

        assert_eq!(
            rx.recv().await,
            Some(TransportEvent::Message(Message::Notification(
                Notification::new("chunked", json!([1, 2, 3]))
            )))
        );
    }

    #[tokio::test]
    async fn eof_emits_single_closed() {
        let (raw, io) = tokio::io::duplex(64);
        let (tx, mut rx) = StreamTransport::spawn(io, "eof").into_parts();
        drop(raw);

        assert_eq!(rx.recv().await, Some(TransportEvent::Closed));
        assert!(tx.is_closed());
        tx.close().await;
        assert!(matches!(
            tx.send(&Message::Notification(Notification::new("x", json!(null))))
                .await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn local_close_reaches_remote() {
        let (left, right) = tokio::io::duplex(64);
        let (a_tx, mut a_rx) = StreamTransport::spawn(left, "left").into_parts();
        let (b_tx, mut b_rx) = StreamTransport::spawn(right, "right").into_parts();

        a_tx.close().await;
        assert_eq!(a_rx.recv().await, Some(TransportEvent::Closed));
        assert_eq!(b_rx.recv().await, Some(TransportEvent::Closed));
        assert!(b_tx.is_closed());
    }
}
