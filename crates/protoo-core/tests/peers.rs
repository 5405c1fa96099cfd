//! Two real peers talking to each other over the shipped transports.

use std::time::Duration;

use assert_matches::assert_matches;
use protoo_core::transport::{MemoryTransport, StreamTransport};
use protoo_core::{Notification, Peer, PeerError, Request, Responder, Room, TransportChannel};
use serde_json::{Value, json};
use tokio::sync::mpsc;

fn echo_handler(peer: &Peer) {
    peer.set_request_handler(|request: Request, responder: Responder| async move {
        match request.method.as_str() {
            "echo" => responder.accept(request.data).await?,
            "x" => responder.reject(503, "unavailable").await?,
            "fail" => anyhow::bail!("cannot {}", request.method),
            other => responder.reject(404, format!("unknown method {other}")).await?,
        }
        anyhow::Ok(())
    });
}

fn stream_pair() -> (TransportChannel, TransportChannel) {
    let (left, right) = tokio::io::duplex(4096);
    (
        StreamTransport::spawn(left, "left"),
        StreamTransport::spawn(right, "right"),
    )
}

async fn exercise(server_side: TransportChannel, client_side: TransportChannel) {
    let server = Peer::new("p1", server_side);
    echo_handler(&server);
    let client = Peer::new("server", client_side);

    assert_eq!(
        client.request("echo", json!({"v": 1})).await.unwrap(),
        json!({"v": 1})
    );
    assert_matches!(
        client.request("x", Value::Null).await,
        Err(PeerError::Protocol { code: 503, reason }) if reason == "unavailable"
    );
    assert_matches!(
        client.request("fail", Value::Null).await,
        Err(PeerError::Protocol { code: 500, reason }) if reason == "cannot fail"
    );
    assert_matches!(
        client.request("nope", Value::Null).await,
        Err(PeerError::Protocol { code: 404, .. })
    );

    client.close().await;
    server.closed().await;
    assert!(server.is_closed());
}

#[tokio::test]
async fn request_response_over_memory() {
    let (a, b) = MemoryTransport::pair();
    exercise(a, b).await;
}

#[tokio::test]
async fn request_response_over_stream() {
    let (a, b) = stream_pair();
    exercise(a, b).await;
}

#[tokio::test]
async fn both_sides_can_request_each_other() {
    let (a, b) = stream_pair();
    let left = Peer::new("left", a);
    let right = Peer::new("right", b);
    echo_handler(&left);
    echo_handler(&right);

    let (l, r) = tokio::join!(
        left.request("echo", json!("from left")),
        right.request("echo", json!("from right")),
    );
    assert_eq!(l.unwrap(), json!("from left"));
    assert_eq!(r.unwrap(), json!("from right"));
}

#[tokio::test]
async fn many_concurrent_requests_each_resolve_once() {
    let (a, b) = MemoryTransport::pair();
    let server = Peer::new("p1", a);
    echo_handler(&server);
    let client = Peer::new("server", b);

    let calls = (0..50).map(|i| {
        let client = client.clone();
        async move { client.request("echo", json!(i)).await }
    });
    let results = futures::future::join_all(calls).await;
    for (i, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap(), json!(i));
    }
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn notifications_flow_without_replies() {
    let (a, b) = MemoryTransport::pair();
    let server = Peer::new("p1", a);
    let client = Peer::new("server", b);
    let (tx, mut rx) = mpsc::unbounded_channel();
    server.set_notification_handler(move |n: Notification| {
        let tx = tx.clone();
        async move {
            let _ = tx.send((n.method, n.data));
            anyhow::Ok(())
        }
    });

    client.notify("chat", json!("hello")).await.unwrap();
    assert_eq!(rx.recv().await, Some(("chat".into(), json!("hello"))));
}

#[tokio::test]
async fn handler_may_call_back_into_the_requester() {
    let (a, b) = MemoryTransport::pair();
    let server = Peer::new("p1", a);
    let client = Peer::new("server", b);
    echo_handler(&client);

    let back = server.clone();
    server.set_request_handler(move |request: Request, responder: Responder| {
        let back = back.clone();
        async move {
            let answer = back.request("echo", request.data).await?;
            responder.accept(json!({"round_trip": answer})).await?;
            anyhow::Ok(())
        }
    });

    assert_eq!(
        client.request("relay", json!(7)).await.unwrap(),
        json!({"round_trip": 7})
    );
}

#[tokio::test(start_paused = true)]
async fn unanswered_request_times_out_while_peer_stays_open() {
    let (a, b) = MemoryTransport::pair();
    let silent = Peer::new("silent", a);
    silent.set_request_handler(|_: Request, _: Responder| async move {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        anyhow::Ok(())
    });
    let client = Peer::new("client", b);

    assert_matches!(
        client.request("echo", Value::Null).await,
        Err(PeerError::Timeout { id: _, method }) if method == "echo"
    );
    assert!(!client.is_closed());
}

#[tokio::test]
async fn room_close_reaches_both_remotes() {
    let room = Room::new();
    let (a_local, a_remote) = MemoryTransport::pair();
    let (b_local, b_remote) = MemoryTransport::pair();
    let _ = room.create_peer("a", a_local).unwrap();
    let _ = room.create_peer("b", b_local).unwrap();
    let remote_a = Peer::new("room", a_remote);
    let remote_b = Peer::new("room", b_remote);

    room.close().await;
    remote_a.closed().await;
    remote_b.closed().await;
    assert!(room.is_empty());
}
