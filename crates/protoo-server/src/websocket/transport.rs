//! WebSocket implementation of the protoo transport contract.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{Sink, SinkExt, Stream, StreamExt};
use protoo_core::transport::{DEFAULT_EVENT_CAPACITY, EventSink};
use protoo_core::{Message, Transport, TransportChannel, TransportError};
use tokio::sync::mpsc;
use tokio::time::{self, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{FrameKind, LOCAL_CLOSE_CODE, LOCAL_CLOSE_REASON, WsFrame};

/// Per-connection settings.
#[derive(Debug, Clone)]
pub(crate) struct WsSettings {
    /// Remote address or URL, for logs.
    pub remote: String,
    /// Ping interval; `None` disables pings.
    pub heartbeat: Option<Duration>,
    /// Outbound messages buffered before `send` waits.
    pub send_queue_capacity: usize,
}

struct Shared {
    conn_id: String,
    closed: AtomicBool,
    events: EventSink,
    cancel: CancellationToken,
}

impl Shared {
    async fn shut_down(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.cancel.cancel();
        if self.events.close().await {
            info!(conn_id = %self.conn_id, "websocket transport closed");
        }
    }
}

/// A protoo transport over one WebSocket connection.
pub struct WebSocketTransport {
    remote: String,
    outbound: mpsc::Sender<String>,
    shared: Arc<Shared>,
}

impl WebSocketTransport {
    /// Spawn the reader and writer tasks for `socket`.
    ///
    /// Cancelling `shutdown` closes the transport.
    pub(crate) fn spawn<S, M, E>(
        socket: S,
        settings: WsSettings,
        shutdown: &CancellationToken,
    ) -> TransportChannel
    where
        S: Stream<Item = Result<M, E>> + Sink<M, Error = E> + Send + 'static,
        M: WsFrame,
        E: fmt::Display + Send + 'static,
    {
        let conn_id = format!("conn_{}", Uuid::now_v7().simple());
        let (events, rx) = EventSink::channel(conn_id.clone(), DEFAULT_EVENT_CAPACITY);
        let (outbound, outbound_rx) = mpsc::channel(settings.send_queue_capacity.max(1));
        let shared = Arc::new(Shared {
            conn_id,
            closed: AtomicBool::new(false),
            events,
            cancel: shutdown.child_token(),
        });
        info!(conn_id = %shared.conn_id, remote = %settings.remote, "websocket transport open");

        let (sink, stream) = socket.split();
        drop(tokio::spawn(run_writer(
            sink,
            outbound_rx,
            Arc::clone(&shared),
            settings.heartbeat,
        )));
        drop(tokio::spawn(run_reader(stream, Arc::clone(&shared))));

        TransportChannel::new(
            Arc::new(Self {
                remote: settings.remote,
                outbound,
                shared,
            }),
            rx,
        )
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&self, message: &Message) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let text = message.to_json()?;
        self.outbound
            .send(text)
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(conn_id = %self.shared.conn_id, "close()");
        self.shared.cancel.cancel();
        let _ = self.shared.events.close().await;
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    fn describe(&self) -> String {
        format!("ws:{} [{}]", self.remote, self.shared.conn_id)
    }
}

fn ping_interval(period: Duration) -> Interval {
    let mut interval = time::interval_at(time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn next_ping(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            let _ = interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn run_writer<S, M, E>(
    mut sink: SplitSink<S, M>,
    mut outbound: mpsc::Receiver<String>,
    shared: Arc<Shared>,
    heartbeat: Option<Duration>,
) where
    S: Sink<M, Error = E>,
    M: WsFrame,
    E: fmt::Display,
{
    let mut pings = heartbeat.map(ping_interval);
    loop {
        tokio::select! {
            biased;
            text = outbound.recv() => {
                let Some(text) = text else { break };
                if let Err(e) = sink.send(M::text_frame(text)).await {
                    debug!(conn_id = %shared.conn_id, error = %e, "websocket write failed");
                    break;
                }
            }
            () = shared.cancel.cancelled() => {
                let _ = sink.send(M::close_frame(LOCAL_CLOSE_CODE, LOCAL_CLOSE_REASON)).await;
                break;
            }
            () = next_ping(&mut pings) => {
                if let Err(e) = sink.send(M::ping_frame()).await {
                    debug!(conn_id = %shared.conn_id, error = %e, "websocket ping failed");
                    break;
                }
            }
        }
    }
    let _ = sink.close().await;
    shared.shut_down().await;
}

async fn run_reader<S, M, E>(mut stream: SplitStream<S>, shared: Arc<Shared>)
where
    S: Stream<Item = Result<M, E>>,
    M: WsFrame,
    E: fmt::Display,
{
    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(frame)) => match frame.kind() {
                    FrameKind::Text(text) => shared.events.deliver_text(&text).await,
                    FrameKind::Binary(len) => {
                        warn!(conn_id = %shared.conn_id, len, "ignoring binary message");
                    }
                    FrameKind::Close => {
                        debug!(conn_id = %shared.conn_id, "remote sent close frame");
                        break;
                    }
                    FrameKind::Control => {}
                },
                Some(Err(e)) => {
                    debug!(conn_id = %shared.conn_id, error = %e, "websocket read failed");
                    break;
                }
                None => break,
            },
            () = shared.cancel.cancelled() => break,
        }
    }
    shared.shut_down().await;
}
