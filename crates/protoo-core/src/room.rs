//! Room: a keyed registry of peers.
//!
//! Peers deregister themselves when they close. The listener that does so
//! only holds a weak handle to the registry, so a room and its peers never
//! keep each other alive.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::RoomError;
use crate::peer::{Peer, PeerOptions};
use crate::transport::TransportChannel;

type CloseListener = Box<dyn FnOnce() + Send>;

struct RoomInner {
    peers: Arc<DashMap<String, Peer>>,
    peer_options: PeerOptions,
    closed: AtomicBool,
    close_listeners: Mutex<Option<Vec<CloseListener>>>,
    close_token: CancellationToken,
}

/// A set of peers addressed by id. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Room {
    inner: Arc<RoomInner>,
}

impl Room {
    /// Empty room whose peers use default options.
    pub fn new() -> Self {
        Self::with_peer_options(PeerOptions::default())
    }

    /// Empty room whose peers are created with `options`.
    pub fn with_peer_options(options: PeerOptions) -> Self {
        Self {
            inner: Arc::new(RoomInner {
                peers: Arc::new(DashMap::new()),
                peer_options: options,
                closed: AtomicBool::new(false),
                close_listeners: Mutex::new(Some(Vec::new())),
                close_token: CancellationToken::new(),
            }),
        }
    }

    /// Wrap `channel` in a new peer and register it under `peer_id`.
    ///
    /// On failure the channel's transport is closed.
    pub fn create_peer(
        &self,
        peer_id: impl Into<String>,
        channel: TransportChannel,
    ) -> Result<Peer, RoomError> {
        let peer_id = peer_id.into();
        if self.is_closed() {
            warn!(%peer_id, "room closed, rejecting peer");
            discard(channel);
            return Err(RoomError::Closed);
        }

        let peer = match self.inner.peers.entry(peer_id.clone()) {
            Entry::Occupied(_) => {
                warn!(%peer_id, "there is already a peer with same peer id");
                discard(channel);
                return Err(RoomError::Duplicate(peer_id));
            }
            Entry::Vacant(slot) => {
                let peer =
                    Peer::with_options(peer_id.clone(), channel, self.inner.peer_options.clone());
                let _ = slot.insert(peer.clone());
                peer
            }
        };

        let registry = Arc::downgrade(&self.inner.peers);
        let handle = peer.downgrade();
        let key = peer_id.clone();
        peer.on_close(move || {
            let Some(peers) = registry.upgrade() else {
                return;
            };
            if peers.remove_if(&key, |_, registered| handle.is(registered)).is_some() {
                debug!(peer_id = %key, "peer left room");
            }
        });

        // A concurrent close may have snapshotted the registry before the insert.
        if self.is_closed() {
            let closing = peer.clone();
            drop(tokio::spawn(async move { closing.close().await }));
            return Err(RoomError::Closed);
        }

        debug!(%peer_id, "peer joined room");
        Ok(peer)
    }

    /// Peer registered under `peer_id`.
    pub fn get_peer(&self, peer_id: &str) -> Option<Peer> {
        self.inner.peers.get(peer_id).map(|entry| entry.value().clone())
    }

    /// Whether a peer is registered under `peer_id`.
    pub fn has_peer(&self, peer_id: &str) -> bool {
        self.inner.peers.contains_key(peer_id)
    }

    /// Snapshot of the registered peers.
    pub fn peers(&self) -> Vec<Peer> {
        self.inner
            .peers
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Number of registered peers.
    pub fn len(&self) -> usize {
        self.inner.peers.len()
    }

    /// Whether no peers are registered.
    pub fn is_empty(&self) -> bool {
        self.inner.peers.is_empty()
    }

    /// Whether the room has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Run `listener` once when the room closes, or now if it already has.
    pub fn on_close(&self, listener: impl FnOnce() + Send + 'static) {
        let mut listeners = self.inner.close_listeners.lock();
        if let Some(listeners) = listeners.as_mut() {
            listeners.push(Box::new(listener));
            return;
        }
        drop(listeners);
        listener();
    }

    /// Resolves once the room has closed.
    pub async fn closed(&self) {
        self.inner.close_token.cancelled().await;
    }

    /// Close every peer, then the room. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Snapshot first: peers remove themselves from the map while closing.
        let peers = self.peers();
        debug!(peers = peers.len(), "close()");
        futures::future::join_all(peers.iter().map(Peer::close)).await;
        self.inner.peers.clear();

        self.inner.close_token.cancel();
        let listeners = self.inner.close_listeners.lock().take().unwrap_or_default();
        for listener in listeners {
            listener();
        }
    }
}

impl Default for Room {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Room")
            .field("peers", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn discard(channel: TransportChannel) {
    drop(tokio::spawn(channel.close()));
}
