//! A single shared room: admission by `peerId` query parameter, an echo
//! method, and notification fan-out.

use protoo_core::{Notification, Peer, Request, Responder, Room, RoomError, TransportChannel};
use protoo_server::{Admission, RequestInfo};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

/// Admit a connection into `room`.
///
/// Requests without `peerId` are refused with `403`.
pub async fn admit(room: Room, info: RequestInfo, admission: Admission) -> anyhow::Result<()> {
    let Some(peer_id) = info.query_param("peerId").map(str::to_owned) else {
        admission.reject(403, "missing peerId")?;
        return Ok(());
    };
    if room.has_peer(&peer_id) {
        admission.reject(409, "peerId already in use")?;
        return Ok(());
    }

    let channel = admission.accept().await?;
    let _ = join(&room, peer_id, channel)?;
    Ok(())
}

/// Register a peer in `room` and install its handlers.
pub fn join(room: &Room, peer_id: String, channel: TransportChannel) -> Result<Peer, RoomError> {
    let peer = room.create_peer(peer_id, channel)?;
    info!(peer_id = %peer.id(), transport = %peer.transport_description(), "peer joined");

    let lobby = room.clone();
    peer.set_request_handler(move |request: Request, responder: Responder| {
        let lobby = lobby.clone();
        async move {
            match request.method.as_str() {
                "echo" => responder.accept(request.data).await?,
                "peers" => {
                    let ids: Vec<Value> = lobby.peers().iter().map(|p| json!(p.id())).collect();
                    responder.accept(Value::Array(ids)).await?;
                }
                other => {
                    debug!(method = other, "unknown method");
                    responder.reject(404, format!("unknown method {other}")).await?;
                }
            }
            anyhow::Ok(())
        }
    });

    let lobby = room.clone();
    let sender = peer.id().to_owned();
    peer.set_notification_handler(move |notification: Notification| {
        let lobby = lobby.clone();
        let sender = sender.clone();
        async move {
            broadcast(&lobby, &sender, notification).await;
            anyhow::Ok(())
        }
    });

    let peer_id = peer.id().to_owned();
    peer.on_close(move || info!(%peer_id, "peer left"));
    Ok(peer)
}

/// Forward `notification` to every peer in `room` except `sender`.
async fn broadcast(room: &Room, sender: &str, notification: Notification) {
    for peer in room.peers() {
        if peer.id() == sender {
            continue;
        }
        if let Err(e) = peer
            .notify(notification.method.clone(), notification.data.clone())
            .await
        {
            warn!(peer_id = %peer.id(), error = %e, "broadcast failed");
        }
    }
}
