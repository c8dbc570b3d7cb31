//! End-to-end tests: real node runtimes linked by in-memory duplex streams.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use futures::{SinkExt, StreamExt};
use mesh_protocol::config::{LivenessConfig, MeshConfig};
use mesh_protocol::core::codec::WireCodec;
use mesh_protocol::forwarding::Delivery;
use mesh_protocol::protocol::auth::{NoAuth, TokenAuth};
use mesh_protocol::protocol::handshake::{Connection, Outcome, Role};
use mesh_protocol::{Message, MeshNode, NodeId, PeerEvent, ProtocolError};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{duplex, DuplexStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, timeout};
use tokio_util::codec::Framed;

const WAIT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn")
        .with_test_writer()
        .try_init();
}

fn config(id: &str) -> MeshConfig {
    MeshConfig::default_with_overrides(|c| {
        c.node.id = Some(id.to_string());
        c.gossip.interval = Duration::from_millis(50);
        c.forwarding.delivery_timeout = Duration::from_millis(300);
        c.forwarding.sweep_interval = Duration::from_millis(20);
    })
}

fn start(id: &str) -> (MeshNode, mpsc::Receiver<Delivery>) {
    MeshNode::start(config(id), Arc::new(NoAuth)).unwrap()
}

async fn link(a: &MeshNode, b: &MeshNode) {
    let (x, y) = duplex(64 * 1024);
    let (from_a, from_b) = tokio::join!(a.connect(x), b.accept(y));
    assert_eq!(&from_a.unwrap(), b.id());
    assert_eq!(&from_b.unwrap(), a.id());
}

async fn eventually<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    let result = timeout(WAIT, async {
        while !check() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {what}");
}

async fn next_event(events: &mut broadcast::Receiver<PeerEvent>) -> PeerEvent {
    timeout(WAIT, events.recv()).await.unwrap().unwrap()
}

#[tokio::test]
async fn test_two_nodes_establish_session() {
    init_tracing();
    let (a, _) = start("aa");
    let (b, _) = start("bb");
    let mut events = a.subscribe_peers();

    link(&a, &b).await;

    assert_eq!(next_event(&mut events).await, PeerEvent::Available(b.id().clone()));
    assert_eq!(a.peers(), vec![b.id().clone()]);
    assert!(b.is_connected(a.id()));
    assert_eq!(a.route_to(b.id()), Some(b.id().clone()));

    // each side's table picks up the other's entry through gossip
    eventually("gossip", || {
        a.routing_table()
            .get(b.id())
            .is_some_and(|e| e.neighbors.iter().any(|n| &n.id == a.id()))
    })
    .await;
}

#[tokio::test]
async fn test_send_across_three_node_chain() {
    init_tracing();
    let (a, _) = start("aa");
    let (b, _) = start("bb");
    let (c, mut c_deliveries) = start("cc");

    link(&a, &b).await;
    link(&b, &c).await;

    eventually("route to C", || a.route_to(c.id()).is_some()).await;
    assert_eq!(a.route_to(c.id()), Some(b.id().clone()));

    a.send(c.id().clone(), "chat", b"hello".to_vec()).await.unwrap();

    let delivery = timeout(WAIT, c_deliveries.recv()).await.unwrap().unwrap();
    assert_eq!(
        delivery,
        Delivery {
            source: a.id().clone(),
            message_type: "chat".into(),
            payload: b"hello".to_vec(),
        }
    );
    assert_eq!(a.pending_deliveries(), 0);
    assert_eq!(b.pending_deliveries(), 0);
    assert_eq!(b.metrics().snapshot().data_forwarded, 1);
}

#[tokio::test]
async fn test_send_without_route_fails_fast() {
    init_tracing();
    let (a, _) = start("aa");
    let result = a.send(NodeId::from("nowhere"), "chat", vec![]).await;
    assert!(matches!(result, Err(ProtocolError::NoRoute(_))));

    let result = a.send(a.id().clone(), "chat", vec![]).await;
    assert!(matches!(result, Err(ProtocolError::InvalidTarget(_))));
}

#[tokio::test]
async fn test_disconnect_announces_and_drops_route() {
    init_tracing();
    let (a, _) = start("aa");
    let (b, _) = start("bb");
    let (c, _) = start("cc");
    link(&a, &b).await;
    link(&b, &c).await;
    eventually("route to C", || a.route_to(c.id()).is_some()).await;

    let mut a_events = a.subscribe_peers();
    let mut b_events = b.subscribe_peers();
    a.disconnect(b.id()).await.unwrap();

    assert_eq!(next_event(&mut a_events).await, PeerEvent::Unavailable(b.id().clone()));
    assert_eq!(next_event(&mut b_events).await, PeerEvent::Unavailable(a.id().clone()));
    assert!(a.peers().is_empty());
    assert_eq!(b.peers(), vec![c.id().clone()]);
    assert_eq!(a.route_to(c.id()), None);

    // B's new version reaches C without A in its neighbour list
    eventually("C sees the link drop", || {
        c.routing_table()
            .get(b.id())
            .is_some_and(|e| e.neighbors.iter().all(|n| &n.id != a.id()))
    })
    .await;

    // a fresh session can be established afterwards
    link(&a, &b).await;
    assert_eq!(next_event(&mut a_events).await, PeerEvent::Available(b.id().clone()));
}

#[tokio::test]
async fn test_capability_mismatch() {
    init_tracing();
    let mut left = config("aa");
    left.node.capabilities = vec!["mesh/2".into()];
    let mut right = config("bb");
    right.node.capabilities = vec!["mesh/1".into()];
    let (a, _) = MeshNode::start(left, Arc::new(NoAuth)).unwrap();
    let (b, _) = MeshNode::start(right, Arc::new(NoAuth)).unwrap();

    let (x, y) = duplex(4096);
    let (from_a, from_b) = tokio::join!(a.connect(x), b.accept(y));
    assert!(matches!(from_a, Err(ProtocolError::CapabilityMismatch)));
    assert!(matches!(from_b, Err(ProtocolError::CapabilityMismatch)));
    assert!(a.peers().is_empty());
    assert_eq!(a.metrics().snapshot().handshakes_failed, 1);
}

#[tokio::test]
async fn test_token_auth() {
    init_tracing();
    let (a, _) = MeshNode::start(config("aa"), Arc::new(TokenAuth::new("open sesame"))).unwrap();
    let (b, _) = MeshNode::start(config("bb"), Arc::new(TokenAuth::new("open sesame"))).unwrap();
    let (c, _) = MeshNode::start(config("cc"), Arc::new(TokenAuth::new("wrong"))).unwrap();

    link(&a, &b).await;

    let (x, y) = duplex(4096);
    let (from_c, from_a) = tokio::join!(c.connect(x), a.accept(y));
    assert!(matches!(from_c, Err(ProtocolError::AuthRejected(_))));
    assert!(matches!(from_a, Err(ProtocolError::AuthRejected(_))));
    assert_eq!(a.peers(), vec![b.id().clone()]);
}

#[tokio::test]
async fn test_second_session_refused() {
    init_tracing();
    let (a, _) = start("aa");
    let (b, _) = start("bb");
    link(&a, &b).await;

    let (x, y) = duplex(4096);
    let (from_a, from_b) = tokio::join!(a.connect(x), b.accept(y));
    assert!(matches!(from_a, Err(ProtocolError::DuplicateSession(_))));
    assert!(matches!(from_b, Err(ProtocolError::DuplicateSession(_))));

    // the original session is untouched
    assert_eq!(a.peers(), vec![b.id().clone()]);
    assert_eq!(b.peers(), vec![a.id().clone()]);
}

#[tokio::test]
async fn test_self_connection_refused() {
    init_tracing();
    let (a, _) = start("aa");
    let (twin, _) = start("aa");
    let (x, y) = duplex(4096);
    let (from_twin, from_a) = tokio::join!(twin.connect(x), a.accept(y));
    assert!(from_twin.is_err());
    assert!(matches!(from_a, Err(ProtocolError::InvalidTarget(_))));
}

/// Hand-driven peer: completes the handshake as responder and then lets the
/// test decide what to answer.
async fn scripted_peer(stream: DuplexStream) -> Framed<DuplexStream, WireCodec> {
    let mut framed = Framed::new(stream, WireCodec::default());
    let mut conn = Connection::new(
        Role::Responder,
        "ff".parse().unwrap(),
        vec!["mesh/1".into()],
        Arc::new(NoAuth),
        &LivenessConfig::default(),
    );
    while !conn.is_established() {
        let message = framed.next().await.unwrap().unwrap();
        match conn.handle(message).unwrap() {
            Outcome::Reply(replies) => {
                for reply in replies {
                    framed.send(reply).await.unwrap();
                }
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    framed
}

async fn next_data(framed: &mut Framed<DuplexStream, WireCodec>) -> Message {
    loop {
        let message = timeout(WAIT, framed.next()).await.unwrap().unwrap().unwrap();
        if let Message::Data { .. } = message {
            return message;
        }
    }
}

#[tokio::test]
async fn test_reject_from_next_hop_fails_send() {
    init_tracing();
    let (a, _) = start("aa");
    let (x, y) = duplex(64 * 1024);
    let (peer, mut fake) = tokio::join!(a.connect(x), scripted_peer(y));
    let peer = peer.unwrap();

    let sender = a.clone();
    let target = peer.clone();
    let send = tokio::spawn(async move { sender.send(target, "chat", vec![1, 2, 3]).await });

    let Message::Data { path, payload, .. } = next_data(&mut fake).await else {
        unreachable!()
    };
    assert_eq!(payload, vec![1, 2, 3]);
    assert_eq!(path.len(), 1);
    assert_eq!(&path[0].node, a.id());

    fake.send(Message::DataReject { id: path[0].id }).await.unwrap();
    let result = send.await.unwrap();
    assert!(matches!(result, Err(ProtocolError::DeliveryRejected(t)) if t == peer));
}

#[tokio::test]
async fn test_unanswered_send_times_out() {
    init_tracing();
    let (a, _) = start("aa");
    let (x, y) = duplex(64 * 1024);
    let (peer, mut fake) = tokio::join!(a.connect(x), scripted_peer(y));
    let peer = peer.unwrap();

    let sender = a.clone();
    let send = tokio::spawn(async move { sender.send(peer, "chat", vec![]).await });
    next_data(&mut fake).await;

    let result = timeout(WAIT, send).await.unwrap().unwrap();
    assert!(matches!(result, Err(ProtocolError::DeliveryTimeout(_))));
    assert_eq!(a.metrics().snapshot().delivery_timeouts, 1);
}

#[tokio::test]
async fn test_malformed_frame_drops_only_that_session() {
    init_tracing();
    let (a, _) = start("aa");
    let (b, _) = start("bb");
    link(&a, &b).await;

    let (x, y) = duplex(64 * 1024);
    let (peer, fake) = tokio::join!(a.connect(x), scripted_peer(y));
    let peer = peer.unwrap();
    let mut events = a.subscribe_peers();

    // unknown tag 99
    let mut raw = fake.into_inner();
    tokio::io::AsyncWriteExt::write_all(&mut raw, &[0x18, 0x63])
        .await
        .unwrap();

    assert_eq!(next_event(&mut events).await, PeerEvent::Unavailable(peer));
    assert_eq!(a.peers(), vec![b.id().clone()]);
    assert_eq!(a.metrics().snapshot().protocol_errors, 1);
}

#[tokio::test(start_paused = true)]
async fn test_silent_peer_is_declared_dead() {
    init_tracing();
    let config = MeshConfig::default_with_overrides(|c| {
        c.node.id = Some("aa".into());
        c.liveness.ping_interval = Duration::from_millis(200);
        c.liveness.pong_timeout = Duration::from_millis(400);
    });
    let (a, _) = MeshNode::start(config, Arc::new(NoAuth)).unwrap();
    let mut events = a.subscribe_peers();

    let (x, y) = duplex(64 * 1024);
    let (peer, mut fake) = tokio::join!(a.connect(x), scripted_peer(y));
    let peer = peer.unwrap();
    assert_eq!(next_event(&mut events).await, PeerEvent::Available(peer.clone()));
    assert!(a
        .routing_table()
        .local_entry()
        .neighbors
        .iter()
        .any(|n| n.id == peer));

    // keep reading so the stream stays open, but never answer a Ping
    let silent = tokio::spawn(async move {
        let mut pings = 0;
        while let Some(Ok(message)) = fake.next().await {
            if message == Message::Ping {
                pings += 1;
            }
        }
        pings
    });

    assert_eq!(next_event(&mut events).await, PeerEvent::Unavailable(peer.clone()));
    assert!(!a.is_connected(&peer));
    assert!(a.routing_table().local_entry().neighbors.is_empty());
    assert_eq!(a.metrics().snapshot().connection_errors, 1);

    let pings = timeout(WAIT, silent).await.unwrap().unwrap();
    assert!(pings >= 1);
}

#[tokio::test]
async fn test_full_delivery_queue_rejects_without_stalling_link() {
    init_tracing();
    let (a, _) = start("aa");
    let config = MeshConfig::default_with_overrides(|c| {
        c.node.id = Some("bb".into());
        c.transport.outbound_queue = 1;
    });
    let (b, mut b_deliveries) = MeshNode::start(config, Arc::new(NoAuth)).unwrap();
    link(&a, &b).await;

    a.send(b.id().clone(), "chat", vec![1]).await.unwrap();
    let second = a.send(b.id().clone(), "chat", vec![2]).await;
    assert!(matches!(second, Err(ProtocolError::DeliveryRejected(t)) if &t == b.id()));
    assert!(a.is_connected(b.id()));

    let first = timeout(WAIT, b_deliveries.recv()).await.unwrap().unwrap();
    assert_eq!(first.payload, vec![1]);
    a.send(b.id().clone(), "chat", vec![3]).await.unwrap();
    assert_eq!(b.metrics().snapshot().data_delivered, 2);
}

#[tokio::test]
async fn test_shutdown_closes_every_session() {
    init_tracing();
    let (a, _) = start("aa");
    let (b, _) = start("bb");
    let (c, _) = start("cc");
    link(&a, &b).await;
    link(&a, &c).await;

    a.shutdown().await;
    eventually("peers gone", || {
        a.peers().is_empty()
            && b.peers().is_empty()
            && c.peers().is_empty()
            && a.metrics().snapshot().connections_active == 0
    })
    .await;
}

#[tokio::test]
async fn test_serve_over_tcp() {
    init_tracing();
    let (a, _) = start("aa");
    let (b, _) = start("bb");

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop, stop_rx) = mpsc::channel(1);
    let server = {
        let a = a.clone();
        tokio::spawn(async move { a.serve(listener, stop_rx).await })
    };

    assert_eq!(&b.dial(addr).await.unwrap(), a.id());
    eventually("server side registered", || a.is_connected(b.id())).await;

    stop.send(()).await.unwrap();
    server.await.unwrap().unwrap();
}
