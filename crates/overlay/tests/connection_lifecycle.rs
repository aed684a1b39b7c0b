//! Connection lifecycle tests over an in-memory network.
//!
//! These cover the outbound attempt state machine, the inbound handoff and
//! registry shutdown end to end:
//! - Two-node handshake and message delivery
//! - Slot release on every exit path
//! - Step deadlines
//! - Redirects, with and without candidates
//! - Self connections
//! - Coordinated shutdown of attempts and peers

mod common;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use common::{http_response, link, wait_until, MemoryNetwork, TestNode};
use ledgermesh_overlay::{AllocatorConfig, AttemptState, Message, MessageKind, OverlayConfig};

fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_two_node_handshake() {
    let net = MemoryNetwork::new();
    let a = TestNode::new(&net, "10.0.0.1:51235");
    let b = TestNode::new(&net, "10.0.0.2:51235");
    let mut b_rx = b.registry.subscribe();

    let handle = a.registry.connect(b.addr).unwrap();
    handle.finished().await;
    wait_until("both sides active", || {
        a.registry.size() == 1 && b.registry.size() == 1
    })
    .await;

    let a_peer = a.registry.active_peers().pop().unwrap();
    assert!(!a_peer.is_inbound());
    assert_eq!(*a_peer.public_key(), b.public_key);
    assert_eq!(a_peer.remote_address(), b.addr);
    assert!(a_peer.version().unwrap().starts_with("ledgermesh-"));

    let b_peer = b.registry.active_peers().pop().unwrap();
    assert!(b_peer.is_inbound());
    assert_eq!(*b_peer.public_key(), a.public_key);
    assert_eq!(b_peer.listening_port(), Some(51235));

    let stats = a.registry.stats();
    assert_eq!(stats.outbound_peers, 1);
    assert_eq!(stats.metrics.attempts_started, 1);
    assert_eq!(stats.metrics.handshake_count, 1);
    assert_eq!(b.registry.stats().inbound_peers, 1);

    let message = Message::new(MessageKind::PROPOSAL, b"proposal".to_vec());
    assert_eq!(a.registry.send(message.clone()), 1);
    let received = tokio::time::timeout(Duration::from_secs(5), b_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.from_peer, b_peer.id());
    assert_eq!(received.message.payload, message.payload);

    a.registry.shutdown().await;
    wait_until("remote side closed", || b.registry.size() == 0).await;
    b.registry.shutdown().await;

    assert!(a.allocator.all_released_once());
    assert!(b.allocator.all_released_once());
    assert_eq!(a.allocator.inner.active_counts(), (0, 0));
}

#[tokio::test]
async fn test_crawl_lists_peers() {
    let net = MemoryNetwork::new();
    let a = TestNode::new(&net, "10.0.0.1:51235");
    let b = TestNode::new(&net, "10.0.0.2:51235");
    link(&a, &b).await;

    let crawl = a.registry.crawl();
    let active = crawl["active"].as_array().unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0]["public_key"], b.public_key.to_base64());
    assert_eq!(active[0]["type"], "out");
    assert_eq!(active[0]["ip"], "10.0.0.2");
    assert_eq!(active[0]["port"], 51235);

    let crawl = b.registry.crawl();
    assert_eq!(crawl["active"][0]["type"], "in");
    assert_eq!(crawl["active"][0]["port"], 51235);

    a.registry.shutdown().await;
    b.registry.shutdown().await;
}

#[tokio::test]
async fn test_private_peer_hidden_from_crawl() {
    let net = MemoryNetwork::new();
    let a = TestNode::with_config(
        &net,
        "10.0.0.1:51235",
        OverlayConfig {
            peer_private: true,
            ..Default::default()
        },
        AllocatorConfig::default(),
    );
    let b = TestNode::new(&net, "10.0.0.2:51235");
    link(&a, &b).await;

    let entry = &b.registry.crawl()["active"][0];
    assert_eq!(entry["public_key"], a.public_key.to_base64());
    assert!(entry.get("ip").is_none());
    assert!(entry.get("port").is_none());

    a.registry.shutdown().await;
    b.registry.shutdown().await;
}

// ---------------------------------------------------------------------------
// Failure paths
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_dial_failure_releases_slot() {
    let net = MemoryNetwork::new();
    let a = TestNode::new(&net, "10.0.0.1:51235");

    let handle = a.registry.connect(addr("10.0.0.9:51235")).unwrap();
    handle.finished().await;

    assert_eq!(a.registry.size(), 0);
    assert_eq!(a.registry.tracked(), 0);
    assert_eq!(a.registry.metrics().attempts_failed.get(), 1);
    assert_eq!(a.allocator.issued(), 1);
    assert!(a.allocator.all_released_once());
}

#[tokio::test(start_paused = true)]
async fn test_silent_remote_times_out() {
    let net = MemoryNetwork::new();
    let a = TestNode::new(&net, "10.0.0.1:51235");
    net.listen_silent(addr("10.0.0.9:51235"));

    let started = tokio::time::Instant::now();
    let handle = a.registry.connect(addr("10.0.0.9:51235")).unwrap();
    handle.finished().await;

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(15), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(30), "elapsed {:?}", elapsed);
    assert_eq!(a.registry.metrics().attempts_timed_out.get(), 1);
    assert!(a.allocator.all_released_once());
    assert_eq!(a.registry.tracked(), 0);
}

#[tokio::test]
async fn test_non_upgrade_response_closes_cleanly() {
    let net = MemoryNetwork::new();
    let a = TestNode::new(&net, "10.0.0.1:51235");
    net.listen_canned(
        addr("10.0.0.9:51235"),
        http_response(403, "Forbidden", "{}"),
    );

    let handle = a.registry.connect(addr("10.0.0.9:51235")).unwrap();
    handle.finished().await;

    let metrics = a.registry.metrics().snapshot();
    assert_eq!(metrics.attempts_failed, 0);
    assert_eq!(metrics.attempts_timed_out, 0);
    assert_eq!(a.registry.size(), 0);
    assert!(a.allocator.all_released_once());
}

#[tokio::test]
async fn test_redirect_feeds_allocator() {
    let net = MemoryNetwork::new();
    let a = TestNode::new(&net, "10.0.0.1:51235");
    net.listen_canned(
        addr("10.0.0.9:51235"),
        http_response(
            503,
            "Service Unavailable",
            r#"{"peer-ips":["198.51.100.1:51235","198.51.100.2:51235"]}"#,
        ),
    );

    let handle = a.registry.connect(addr("10.0.0.9:51235")).unwrap();
    handle.finished().await;

    assert_eq!(
        a.allocator.inner.cached_endpoints(),
        vec![addr("198.51.100.1:51235"), addr("198.51.100.2:51235")]
    );
    assert_eq!(a.registry.metrics().attempts_failed.get(), 0);
    assert!(a.allocator.all_released_once());
}

#[tokio::test]
async fn test_full_inbound_redirects_with_candidates() {
    let net = MemoryNetwork::new();
    let a = TestNode::new(&net, "10.0.0.1:51235");
    let candidates = vec![addr("198.51.100.1:51235"), addr("198.51.100.2:51235")];
    let b = TestNode::with_config(
        &net,
        "10.0.0.2:51235",
        OverlayConfig::default(),
        AllocatorConfig {
            max_peers: 1,
            out_peers: 1,
            bootstrap: candidates.clone(),
            ..Default::default()
        },
    );

    let handle = a.registry.connect(b.addr).unwrap();
    handle.finished().await;

    assert_eq!(a.registry.size(), 0);
    assert_eq!(b.registry.size(), 0);
    assert_eq!(b.registry.metrics().inbound_redirected.get(), 1);
    let learned: HashSet<SocketAddr> = a.allocator.inner.cached_endpoints().into_iter().collect();
    assert_eq!(learned, candidates.into_iter().collect());

    wait_until("inbound slot released", || b.allocator.total_closed() == 1).await;
    assert!(a.allocator.all_released_once());
    assert!(b.allocator.all_released_once());
}

#[tokio::test]
async fn test_full_inbound_redirects_empty() {
    let net = MemoryNetwork::new();
    let a = TestNode::new(&net, "10.0.0.1:51235");
    let b = TestNode::with_config(
        &net,
        "10.0.0.2:51235",
        OverlayConfig::default(),
        AllocatorConfig {
            max_peers: 1,
            out_peers: 1,
            ..Default::default()
        },
    );

    let handle = a.registry.connect(b.addr).unwrap();
    handle.finished().await;

    assert_eq!(b.registry.metrics().inbound_redirected.get(), 1);
    assert!(a.allocator.inner.cached_endpoints().is_empty());
    assert_eq!(a.registry.size(), 0);
    assert!(a.allocator.all_released_once());
}

#[tokio::test]
async fn test_self_connection_rejected() {
    let net = MemoryNetwork::new();
    let a = TestNode::new(&net, "10.0.0.1:51235");

    let handle = a.registry.connect(a.addr).unwrap();
    handle.finished().await;

    assert_eq!(a.registry.size(), 0);
    assert_eq!(a.registry.metrics().peers_activated.get(), 0);
    wait_until("slots released", || a.allocator.total_closed() == a.allocator.issued()).await;
    assert!(a.allocator.all_released_once());
}

#[tokio::test]
async fn test_duplicate_key_not_promoted() {
    let net = MemoryNetwork::new();
    let a = TestNode::new(&net, "10.0.0.1:51235");
    let b = TestNode::new(&net, "10.0.0.2:51235");
    link(&a, &b).await;

    // Same node, reached through its second address.
    let mut second = net.listen(addr("10.0.0.2:2459"));
    let b_registry = b.registry.clone();
    tokio::spawn(async move {
        use tokio::io::AsyncReadExt;
        while let Some((mut stream, remote)) = second.recv().await {
            let mut binding = [0u8; 32];
            stream.read_exact(&mut binding).await.unwrap();
            let secure = ledgermesh_overlay::SecureStream {
                stream: Box::new(stream),
                binding: ledgermesh_overlay::ChannelBinding(binding),
            };
            let _ = b_registry
                .serve_inbound(secure, addr("10.0.0.2:2459"), remote)
                .await;
        }
    });

    let handle = a.registry.connect(addr("10.0.0.2:2459")).unwrap();
    handle.finished().await;

    assert_eq!(a.registry.size(), 1);
    assert_eq!(b.registry.size(), 1);
    a.registry.shutdown().await;
    b.registry.shutdown().await;
    assert!(a.allocator.all_released_once());
    assert!(b.allocator.all_released_once());
}

// ---------------------------------------------------------------------------
// Registry invariants
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_connects_unique_ids_and_slots() {
    let net = MemoryNetwork::new();
    let hub = TestNode::with_config(
        &net,
        "10.0.1.1:51235",
        OverlayConfig::default(),
        AllocatorConfig {
            max_peers: 40,
            out_peers: 10,
            ..Default::default()
        },
    );
    let spokes: Vec<TestNode> = (1..=8u8)
        .map(|i| TestNode::new(&net, &format!("10.0.2.{}:51235", i)))
        .collect();

    // Half dial in, half are dialed, all at once.
    for (i, spoke) in spokes.iter().enumerate() {
        if i % 2 == 0 {
            spoke.registry.connect(hub.addr).unwrap();
        } else {
            hub.registry.connect(spoke.addr).unwrap();
        }
    }
    wait_until("hub has every spoke", || hub.registry.size() == spokes.len()).await;

    let peers = hub.registry.active_peers();
    let ids: HashSet<_> = peers.iter().map(|p| p.id()).collect();
    let slots: HashSet<_> = peers.iter().map(|p| p.slot().id()).collect();
    assert_eq!(ids.len(), spokes.len());
    assert_eq!(slots.len(), spokes.len());
    for peer in &peers {
        assert_eq!(hub.registry.find_peer_by_short_id(peer.id()).unwrap().id(), peer.id());
    }

    hub.registry.shutdown().await;
    for spoke in &spokes {
        spoke.registry.shutdown().await;
    }
    assert!(hub.allocator.all_released_once());
}

#[tokio::test]
async fn test_stop_cancels_attempts_and_peers() {
    let net = MemoryNetwork::new();
    let a = TestNode::new(&net, "10.0.0.1:51235");
    let others: Vec<TestNode> = (2..=4u8)
        .map(|i| TestNode::new(&net, &format!("10.0.0.{}:51235", i)))
        .collect();
    for other in &others {
        link(&a, other).await;
    }

    let attempts: Vec<_> = (1..=5u8)
        .map(|i| {
            let remote = addr(&format!("10.0.9.{}:51235", i));
            net.listen_silent(remote);
            a.registry.connect(remote).unwrap()
        })
        .collect();
    wait_until("attempts awaiting response", || {
        attempts
            .iter()
            .all(|h| h.state() == AttemptState::AwaitingResponse)
    })
    .await;
    assert_eq!(a.registry.tracked(), 8);

    tokio::time::timeout(Duration::from_secs(5), a.registry.shutdown())
        .await
        .expect("shutdown completes");

    assert_eq!(a.registry.tracked(), 0);
    assert_eq!(a.registry.size(), 0);
    for attempt in &attempts {
        assert_eq!(attempt.state(), AttemptState::Closed);
    }
    assert_eq!(a.allocator.issued(), 8);
    assert!(a.allocator.all_released_once());
    assert!(a.registry.connect(others[0].addr).is_none());

    for other in &others {
        wait_until("remote side closed", || other.registry.size() == 0).await;
        other.registry.shutdown().await;
    }
}

#[tokio::test]
async fn test_stopping_registry_refuses_inbound() {
    let net = MemoryNetwork::new();
    let a = TestNode::new(&net, "10.0.0.1:51235");
    let b = TestNode::new(&net, "10.0.0.2:51235");
    b.registry.stop();

    let handle = a.registry.connect(b.addr).unwrap();
    handle.finished().await;

    assert_eq!(a.registry.size(), 0);
    assert_eq!(b.registry.size(), 0);
    assert!(a.allocator.all_released_once());
    assert_eq!(b.allocator.issued(), 0);
}
