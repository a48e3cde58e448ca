//! Multi-node scenarios over real loopback TCP.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hive_overlay::codec::{FrameCodec, FrameReader};
use hive_overlay::version::VersionVerdict;
use hive_overlay::{
    HiveStore, MemoryHiveStore, NodeIdentity, OverlayConfig, OverlayNode, Packet, PacketBody,
    PathHop, PeerGuid, PeerVersion, SupportCode, VersionPolicy, VersionThreshold,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn test_config() -> OverlayConfig {
    OverlayConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        content_poll_interval: Duration::from_millis(10),
        retry_poll_interval: Duration::from_millis(50),
        connect_timeout: Duration::from_secs(2),
        ..OverlayConfig::default()
    }
}

async fn started(name: &str) -> OverlayNode {
    started_with(NodeIdentity::generate(name), test_config()).await
}

async fn started_with(identity: NodeIdentity, config: OverlayConfig) -> OverlayNode {
    let node = OverlayNode::new(identity, config);
    node.start().await.unwrap();
    node
}

fn port(node: &OverlayNode) -> u16 {
    node.local_addr().unwrap().port()
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn drain(node: &OverlayNode) -> Vec<Packet> {
    std::iter::from_fn(|| node.dequeue()).collect()
}

async fn link(client: &OverlayNode, server: &OverlayNode) {
    let before = client.connected_peers().len();
    client.connect("127.0.0.1", port(server)).unwrap();
    wait_until("handshake", || {
        client.connected_peers().len() > before && client.connected_peers().contains(server.guid())
    })
    .await;
    wait_until("server side activation", || {
        server.connected_peers().contains(client.guid())
    })
    .await;
}

#[tokio::test]
async fn flooded_packet_reaches_subscribed_neighbor() {
    let a = started("a").await;
    let b = started("b").await;
    a.register_hive("chat");
    b.register_hive("chat");
    link(&a, &b).await;

    a.enqueue(Packet::data("chat", "text/plain", "hello")).unwrap();

    let mut got = Vec::new();
    wait_until("delivery", || {
        got.extend(drain(&b));
        !got.is_empty()
    })
    .await;
    assert_eq!(got.len(), 1);
    let p = &got[0];
    assert_eq!(p.origin_path.len(), 1);
    assert_eq!(&p.origin_path[0].guid, a.guid());
    assert_eq!(p.origin_path[0].port, port(&a));
    assert_eq!(p.hops_to_live, 15 + 3);
    assert!(matches!(&p.body, PacketBody::Data { payload, .. } if payload == "hello"));
    assert!(drain(&a).is_empty());

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn old_client_is_refused_without_retry() {
    let policy = VersionPolicy::new(vec![
        VersionThreshold {
            level: SupportCode::Supported,
            min_version: "2.0".parse().unwrap(),
            link: String::new(),
            message: String::new(),
        },
        VersionThreshold {
            level: SupportCode::Deprecated,
            min_version: "1.0".parse().unwrap(),
            link: "https://example.org/upgrade".into(),
            message: "please upgrade".into(),
        },
        VersionThreshold {
            level: SupportCode::Unsupported,
            min_version: "0.5".parse().unwrap(),
            link: "https://example.org/download".into(),
            message: "version no longer supported".into(),
        },
    ]);
    let server = started_with(
        NodeIdentity::generate("server"),
        OverlayConfig {
            version_policy: policy,
            ..test_config()
        },
    )
    .await;
    let old: PeerVersion = "0.75".parse().unwrap();
    let client = started_with(NodeIdentity::with_version("old", old), test_config()).await;

    client.connect("127.0.0.1", port(&server)).unwrap();

    let mut welcome = None;
    wait_until("refusal", || {
        welcome = client.dequeue();
        welcome.is_some()
    })
    .await;
    match welcome.map(|p| p.body) {
        Some(PacketBody::Welcome {
            support,
            link,
            message,
        }) => {
            assert_eq!(support, Some(SupportCode::Unsupported));
            assert!(!link.is_empty());
            assert!(!message.is_empty());
        }
        other => panic!("Expected a Welcome, got {other:?}"),
    }

    wait_until("client session removed", || client.session_count() == 0).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(client.pending_count(), 0, "refused endpoint must not be retried");
    assert!(client.connected_peers().is_empty());
    assert!(server.connected_peers().is_empty());

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn relay_forwards_without_delivering() {
    let a = started("a").await;
    let b = started("b").await;
    let c = started("c").await;
    a.register_hive("X");
    c.register_hive("X");
    link(&a, &b).await;
    link(&c, &b).await;

    a.enqueue(Packet::data("X", "text/plain", "across")).unwrap();

    let mut received = Vec::new();
    wait_until("delivery at c", || {
        received.extend(drain(&c));
        !received.is_empty()
    })
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    received.extend(drain(&c));

    assert_eq!(received.len(), 1);
    let p = &received[0];
    let path: Vec<_> = p.origin_path.iter().map(|h| h.guid.clone()).collect();
    assert_eq!(path, vec![a.guid().clone(), b.guid().clone()]);
    // 15 at a, 14 after b, +3 on match at c
    assert_eq!(p.hops_to_live, 17);
    assert!(drain(&b).is_empty());
    assert!(drain(&a).is_empty());

    for node in [a, b, c] {
        node.close().await;
    }
}

#[tokio::test]
async fn duplicate_arrivals_processed_once() {
    let a = started("a").await;
    let b = started("b").await;
    let c = started("c").await;
    for node in [&a, &b, &c] {
        node.register_hive("X");
    }
    link(&a, &b).await;
    link(&a, &c).await;
    link(&b, &c).await;

    a.enqueue(Packet::data("X", "text/plain", "triangle")).unwrap();

    let (mut at_b, mut at_c) = (Vec::new(), Vec::new());
    wait_until("delivery at b and c", || {
        at_b.extend(drain(&b));
        at_c.extend(drain(&c));
        !at_b.is_empty() && !at_c.is_empty()
    })
    .await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    at_b.extend(drain(&b));
    at_c.extend(drain(&c));

    assert_eq!(at_b.len(), 1);
    assert_eq!(at_c.len(), 1);
    assert!(drain(&a).is_empty(), "a must not process its own packet echoed back");

    for node in [a, b, c] {
        node.close().await;
    }
}

#[tokio::test]
async fn hive_sync_converges_and_is_idempotent() {
    let store_a = Arc::new(MemoryHiveStore::new());
    let store_b = Arc::new(MemoryHiveStore::new());
    store_a.insert("H", "a1", "alpha one");
    store_a.insert("H", "a2", "alpha two");
    store_b.insert("H", "b1", "beta one");

    let a = OverlayNode::new(NodeIdentity::generate("a"), test_config())
        .with_hive_store(Arc::clone(&store_a) as Arc<dyn HiveStore>);
    let b = OverlayNode::new(NodeIdentity::generate("b"), test_config())
        .with_hive_store(Arc::clone(&store_b) as Arc<dyn HiveStore>);
    a.register_hive("H");
    b.register_hive("H");
    a.start().await.unwrap();
    b.start().await.unwrap();

    // Completing the handshake kicks off reconciliation of every hive.
    a.connect("127.0.0.1", port(&b)).unwrap();

    let absorb = |node: &OverlayNode, store: &MemoryHiveStore| {
        drain(node).iter().filter(|p| store.absorb(p)).count()
    };
    wait_until("convergence", || {
        absorb(&a, &store_a);
        absorb(&b, &store_b);
        store_a.len("H") == 3 && store_b.len("H") == 3
    })
    .await;
    let expected = vec!["a1".to_string(), "a2".into(), "b1".into()];
    assert_eq!(store_a.item_guids("H"), expected);
    assert_eq!(store_b.item_guids("H"), expected);
    assert_eq!(store_a.content("H", "b1").as_deref(), Some("beta one"));
    assert_eq!(store_b.content("H", "a1").as_deref(), Some("alpha one"));
    assert_eq!(store_b.record("H", "a1"), store_a.record("H", "a1"));

    a.synchronize_hive("H").unwrap();
    b.synchronize_hive("H").unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(drain(&a).is_empty());
    assert!(drain(&b).is_empty());

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn connection_to_self_is_dropped() {
    let a = started("narcissus").await;
    a.connect("127.0.0.1", port(&a)).unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    wait_until("self sessions closed", || a.session_count() == 0).await;
    assert_eq!(a.pending_count(), 0);
    assert!(a.connected_peers().is_empty());
    assert!(drain(&a).is_empty());

    a.close().await;
}

#[tokio::test]
async fn client_redials_restarted_server() {
    let a = started("client").await;
    let b = started("server").await;
    let addr: SocketAddr = b.local_addr().unwrap();
    link(&a, &b).await;

    b.close().await;
    wait_until("loss noticed", || a.connected_peers().is_empty()).await;

    let b2 = started_with(
        NodeIdentity::generate("server-again"),
        OverlayConfig {
            listen_addr: addr,
            ..test_config()
        },
    )
    .await;
    wait_until("reconnect", || a.connected_peers() == vec![b2.guid().clone()]).await;

    a.close().await;
    b2.close().await;
}

#[tokio::test]
async fn close_completes_while_neighbor_stops_reading() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let silent_port = listener.local_addr().unwrap().port();
    let silent_guid = PeerGuid::from_string("silent");
    let silent_hop = PathHop {
        host: "127.0.0.1".into(),
        port: silent_port,
        guid: silent_guid.clone(),
        version: "1.0".parse().unwrap(),
    };

    // Answers the handshake, then keeps the connection open without reading.
    let silent = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let codec = FrameCodec::default();
        let mut frames = FrameReader::new(codec.clone());
        let mut buf = vec![0u8; 4096];
        loop {
            let n = stream.read(&mut buf).await.unwrap();
            assert_ne!(n, 0, "node hung up before its welcome");
            let packets = frames.push(&buf[..n]).unwrap();
            if packets
                .iter()
                .any(|p| matches!(p.body, PacketBody::Welcome { .. }))
            {
                break;
            }
        }
        let mut reply = Packet::welcome_reply(VersionVerdict {
            code: SupportCode::Supported,
            link: String::new(),
            message: String::new(),
        });
        reply.stamp(silent_hop);
        stream
            .write_all(&codec.encode_frame(&reply).unwrap())
            .await
            .unwrap();
        stream
    });

    let a = started("talker").await;
    a.connect("127.0.0.1", silent_port).unwrap();
    wait_until("handshake", || a.connected_peers() == vec![silent_guid.clone()]).await;

    for i in 0..8 {
        let payload = format!("{i}{}", "x".repeat(2 * 1024 * 1024));
        a.enqueue(Packet::data("X", "application/octet-stream", payload))
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(500)).await;

    let closed = tokio::time::timeout(Duration::from_secs(5), a.close()).await;
    assert!(closed.is_ok(), "close waited on a neighbor that stopped reading");
    assert!(!a.is_running());
    drop(silent);
}
