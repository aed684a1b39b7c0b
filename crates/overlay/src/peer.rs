//! Active, authenticated peer connections.
//!
//! A [`Peer`] is created once a connection attempt or an inbound handoff has
//! verified the remote hello and the slot allocator has activated its slot.
//! The registry owns the `Arc<Peer>` through its maps; the peer's I/O task
//! owns the framed stream and the [`SlotGuard`], so the slot is released when
//! that task ends and never earlier.
//!
//! # I/O loop
//!
//! One task per peer multiplexes, with `tokio::select!`:
//!
//! - the peer's cancellation token ([`Peer::stop`], registry shutdown),
//! - the bounded outbound queue fed by [`Peer::send`],
//! - inbound frames from the network.
//!
//! Overlay control messages (`PING`, `PONG`, `ENDPOINTS`) are consumed here.
//! Every other message has its hop counter advanced, is recorded in the
//! suppression table, and is published to registry subscribers on first
//! sighting.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::message::{Message, MessageCodec, MessageKind};
use crate::metrics::OverlayMetrics;
use crate::registry::OverlayMessage;
use crate::relay::SuppressionTable;
use crate::slot::{Slot, SlotAllocator};
use crate::transport::BoxedStream;
use crate::{NodePublicKey, PeerId, ProtocolVersion};

/// Ledger divergence below which a peer is considered in sync.
const SANE_LEDGER_LIMIT: u32 = 24;

/// Ledger divergence above which a peer is considered broken.
const INSANE_LEDGER_LIMIT: u32 = 128;

/// How long a peer may stay insane before it is dropped.
const INSANE_GRACE: Duration = Duration::from_secs(8);

/// How long to wait for the close handshake when a peer stops.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Framed message stream of an active peer.
pub(crate) type PeerFramed = Framed<BoxedStream, MessageCodec>;

/// Whether a peer's claimed ledger agrees with ours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sanity {
    /// No claim yet, or no local reference point.
    Unknown,
    Sane,
    Insane,
}

/// Per-peer traffic counters.
#[derive(Debug, Default)]
pub struct PeerStats {
    messages_received: AtomicU64,
    messages_sent: AtomicU64,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl PeerStats {
    fn record_received(&self, bytes: usize) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_sent(&self, bytes: usize) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PeerStatsSnapshot {
        PeerStatsSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`PeerStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerStatsSnapshot {
    pub messages_received: u64,
    pub messages_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    /// Messages dropped because the outbound queue was full.
    pub messages_dropped: u64,
}

/// Everything a peer learned during its handshake.
pub(crate) struct PeerInit {
    pub id: PeerId,
    pub slot: Arc<Slot>,
    pub public_key: NodePublicKey,
    pub protocol: ProtocolVersion,
    pub version: Option<String>,
    pub cluster: bool,
    /// The remote allows its address to appear in crawl output.
    pub crawl: bool,
}

/// Registry-owned handles the I/O task needs.
pub(crate) struct PeerContext {
    pub allocator: Arc<dyn SlotAllocator>,
    pub suppression: Arc<SuppressionTable>,
    pub messages: broadcast::Sender<OverlayMessage>,
    pub metrics: Arc<OverlayMetrics>,
}

struct SanityState {
    sanity: Sanity,
    insane_since: Option<Instant>,
}

/// An authenticated, active connection.
pub struct Peer {
    id: PeerId,
    slot: Arc<Slot>,
    public_key: NodePublicKey,
    protocol: ProtocolVersion,
    version: Option<String>,
    cluster: bool,
    crawl: bool,
    connected_at: Instant,
    last_received: Mutex<Instant>,
    /// Zero until the peer sends a STATUS.
    claimed_ledger: AtomicU32,
    sanity: Mutex<SanityState>,
    stats: PeerStats,
    outbound_tx: mpsc::Sender<Message>,
    cancel: CancellationToken,
}

impl Peer {
    pub(crate) fn new(init: PeerInit, queue_size: usize) -> (Arc<Self>, mpsc::Receiver<Message>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(queue_size.max(1));
        let now = Instant::now();
        let peer = Arc::new(Self {
            id: init.id,
            slot: init.slot,
            public_key: init.public_key,
            protocol: init.protocol,
            version: init.version,
            cluster: init.cluster,
            crawl: init.crawl,
            connected_at: now,
            last_received: Mutex::new(now),
            claimed_ledger: AtomicU32::new(0),
            sanity: Mutex::new(SanityState {
                sanity: Sanity::Unknown,
                insane_since: None,
            }),
            stats: PeerStats::default(),
            outbound_tx,
            cancel: CancellationToken::new(),
        });
        (peer, outbound_rx)
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn slot(&self) -> &Arc<Slot> {
        &self.slot
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.slot.remote_endpoint()
    }

    pub fn public_key(&self) -> &NodePublicKey {
        &self.public_key
    }

    pub fn protocol(&self) -> ProtocolVersion {
        self.protocol
    }

    /// Software version the remote advertised, if any.
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn is_cluster(&self) -> bool {
        self.cluster
    }

    /// Returns true if the peer understands the hop counter.
    pub fn hops_aware(&self) -> bool {
        self.protocol.hops_aware()
    }

    pub fn is_inbound(&self) -> bool {
        self.slot.inbound()
    }

    /// Returns true if the remote allows its address in crawl output.
    pub fn crawl(&self) -> bool {
        self.crawl
    }

    pub fn listening_port(&self) -> Option<u16> {
        self.slot.listening_port()
    }

    pub fn uptime(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Time since the last message from this peer.
    pub fn idle(&self) -> Duration {
        self.last_received.lock().elapsed()
    }

    /// Ledger sequence from the peer's last STATUS message.
    pub fn claimed_ledger(&self) -> Option<u32> {
        match self.claimed_ledger.load(Ordering::Relaxed) {
            0 => None,
            seq => Some(seq),
        }
    }

    pub fn sanity(&self) -> Sanity {
        self.sanity.lock().sanity
    }

    pub fn stats(&self) -> PeerStatsSnapshot {
        self.stats.snapshot()
    }

    /// Queues a message for this peer without waiting.
    ///
    /// Returns false if the queue is full or the peer has stopped; the
    /// message is dropped in that case.
    pub fn send(&self, message: Message) -> bool {
        match self.outbound_tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(message)) => {
                self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                debug!("{} Outbound queue full, dropping {}", self.id, message.kind);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!("{} Outbound queue closed", self.id);
                false
            }
        }
    }

    /// Sends endpoint gossip.
    pub fn send_endpoints(&self, endpoints: &[SocketAddr]) -> bool {
        if endpoints.is_empty() {
            return false;
        }
        self.send(Message::endpoints(endpoints))
    }

    /// Periodic health check.
    ///
    /// Stops the peer if it has been silent longer than `idle_timeout` or
    /// insane for too long; pings it once it has been silent for `ping_after`.
    pub fn check(&self, idle_timeout: Duration, ping_after: Duration) {
        let idle = self.idle();
        if idle > idle_timeout {
            debug!("{} Idle for {:?}, closing", self.id, idle);
            self.stop();
            return;
        }

        let insane_for = self
            .sanity
            .lock()
            .insane_since
            .map(|since| since.elapsed());
        if let Some(elapsed) = insane_for {
            if elapsed > INSANE_GRACE {
                debug!(
                    "{} Claimed ledger {:?} is insane, closing",
                    self.id,
                    self.claimed_ledger()
                );
                self.stop();
                return;
            }
        }

        if idle > ping_after {
            self.send(Message::ping(rand::random()));
        }
    }

    /// Classifies the peer's claimed ledger against our validated `index`.
    pub fn check_sanity(&self, index: u32) {
        let Some(claimed) = self.claimed_ledger() else {
            return;
        };
        if index == 0 {
            return;
        }

        let diff = claimed.abs_diff(index);
        let mut state = self.sanity.lock();
        if diff < SANE_LEDGER_LIMIT {
            if state.sanity != Sanity::Sane {
                trace!("{} Sane at ledger {}", self.id, claimed);
            }
            state.sanity = Sanity::Sane;
            state.insane_since = None;
        } else if diff > INSANE_LEDGER_LIMIT && state.sanity != Sanity::Insane {
            debug!("{} Insane: claims {} vs validated {}", self.id, claimed, index);
            state.sanity = Sanity::Insane;
            state.insane_since = Some(Instant::now());
        }
    }

    /// Requests the I/O task to close the connection. Idempotent.
    pub fn stop(&self) {
        if !self.cancel.is_cancelled() {
            trace!("{} Stop requested", self.id);
            self.cancel.cancel();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Crawl entry for this peer.
    pub(crate) fn crawl_entry(&self) -> serde_json::Value {
        let mut entry = json!({
            "public_key": self.public_key.to_base64(),
            "type": if self.is_inbound() { "in" } else { "out" },
            "uptime": self.uptime().as_secs(),
        });
        if self.crawl {
            let remote = self.remote_address();
            entry["ip"] = json!(remote.ip().to_string());
            let port = if self.is_inbound() {
                self.listening_port()
            } else {
                Some(remote.port())
            };
            if let Some(port) = port {
                entry["port"] = json!(port);
            }
        }
        if let Some(version) = &self.version {
            entry["version"] = json!(version);
        }
        entry
    }

    /// Runs the peer until it is stopped, the remote closes, or I/O fails.
    ///
    /// Anything already in the framed write buffer (the inbound `101`
    /// response) is flushed before the first message.
    pub(crate) async fn run(
        self: Arc<Self>,
        mut framed: PeerFramed,
        mut outbound_rx: mpsc::Receiver<Message>,
        ctx: PeerContext,
    ) {
        // Writes race the cancellation token so a remote that stops reading
        // cannot hold the task past shutdown.
        let greeting = tokio::select! {
            _ = self.cancel.cancelled() => None,
            flushed = framed.flush() => Some(flushed),
        };
        match greeting {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                debug!("{} Failed to write greeting: {}", self.id, e);
                self.cancel.cancel();
                return;
            }
            None => {
                debug!("{} Stopped before greeting", self.id);
                return;
            }
        }

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    debug!("{} Stopped", self.id);
                    break;
                }

                msg = outbound_rx.recv() => {
                    let Some(message) = msg else {
                        break;
                    };
                    let len = message.body_len();
                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            debug!("{} Stopped during write", self.id);
                            break;
                        }
                        sent = framed.send(message) => {
                            if let Err(e) = sent {
                                debug!("{} Write failed: {}", self.id, e);
                                break;
                            }
                        }
                    }
                    self.stats.record_sent(len);
                }

                frame = framed.next() => {
                    match frame {
                        Some(Ok(message)) => self.on_message(message, &ctx),
                        Some(Err(e)) => {
                            debug!("{} Read failed: {}", self.id, e);
                            break;
                        }
                        None => {
                            debug!("{} Closed by remote", self.id);
                            break;
                        }
                    }
                }
            }
        }

        self.cancel.cancel();
        let _ = tokio::time::timeout(CLOSE_TIMEOUT, framed.close()).await;
    }

    fn on_message(&self, mut message: Message, ctx: &PeerContext) {
        self.stats.record_received(message.body_len());
        *self.last_received.lock() = Instant::now();
        ctx.metrics.messages_received.inc();
        trace!("{} Received {}", self.id, message.kind);

        match message.kind {
            MessageKind::PING => {
                if let Some(nonce) = message.u32_payload() {
                    self.send(Message::pong(nonce));
                }
                return;
            }
            MessageKind::PONG => return,
            MessageKind::ENDPOINTS => {
                let endpoints = self.resolve_endpoints(message.decode_endpoints());
                ctx.allocator.on_endpoints(&self.slot, endpoints);
                return;
            }
            MessageKind::STATUS => {
                if let Some(seq) = message.u32_payload() {
                    self.claimed_ledger.store(seq, Ordering::Relaxed);
                }
            }
            _ => {}
        }

        if let Some(hops) = message.hops {
            if !self.cluster {
                message.hops = Some(hops.saturating_add(1));
            }
        }

        if message.kind != MessageKind::STATUS
            && !ctx.suppression.add_peer(message.id(), self.id)
        {
            trace!("{} Duplicate {}", self.id, message.kind);
            return;
        }

        // No subscribers is not an error.
        let _ = ctx.messages.send(OverlayMessage {
            from_peer: self.id,
            message,
            received_at: std::time::Instant::now(),
        });
    }

    /// Replaces the `0.0.0.0:port` self entry with the peer's address.
    fn resolve_endpoints(&self, endpoints: Vec<SocketAddr>) -> Vec<SocketAddr> {
        let remote = self.remote_address();
        endpoints
            .into_iter()
            .map(|endpoint| {
                if !endpoint.ip().is_unspecified() {
                    return endpoint;
                }
                if self.is_inbound() {
                    self.slot.set_listening_port(endpoint.port());
                }
                SocketAddr::new(remote.ip(), endpoint.port())
            })
            .collect()
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("remote", &self.remote_address())
            .field("public_key", &self.public_key)
            .field("inbound", &self.is_inbound())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::{AllocatorConfig, SimpleSlotAllocator};
    use crate::slot::SlotId;
    use crate::testutil::detached_peer;

    fn context() -> (PeerContext, broadcast::Receiver<OverlayMessage>) {
        let (messages, rx) = broadcast::channel(16);
        let ctx = PeerContext {
            allocator: Arc::new(SimpleSlotAllocator::new(AllocatorConfig::default())),
            suppression: Arc::new(SuppressionTable::new(Duration::from_secs(30), 1024)),
            messages,
            metrics: Arc::new(OverlayMetrics::new()),
        };
        (ctx, rx)
    }

    fn peer(inbound: bool, protocol: ProtocolVersion) -> (Arc<Peer>, mpsc::Receiver<Message>) {
        let remote: SocketAddr = "198.51.100.4:40000".parse().unwrap();
        let slot = if inbound {
            Slot::new_inbound(SlotId(1), "10.0.0.1:51235".parse().unwrap(), remote)
        } else {
            Slot::new_outbound(SlotId(1), remote, false)
        };
        Peer::new(
            PeerInit {
                id: PeerId(3),
                slot: Arc::new(slot),
                public_key: NodePublicKey([1u8; 32]),
                protocol,
                version: Some("ledgermesh-0.1.0".to_string()),
                cluster: false,
                crawl: true,
            },
            2,
        )
    }

    #[test]
    fn test_send_is_best_effort() {
        let (peer, mut rx) = peer(false, ProtocolVersion::CURRENT);
        assert!(peer.send(Message::ping(1)));
        assert!(peer.send(Message::ping(2)));
        assert!(!peer.send(Message::ping(3)));
        assert_eq!(peer.stats().messages_dropped, 1);

        assert_eq!(rx.try_recv().unwrap(), Message::ping(1));
        drop(rx);
        assert!(!peer.send(Message::ping(4)));
    }

    #[test]
    fn test_crawl_entry() {
        let (outbound, _rx) = peer(false, ProtocolVersion::CURRENT);
        let entry = outbound.crawl_entry();
        assert_eq!(entry["type"], "out");
        assert_eq!(entry["ip"], "198.51.100.4");
        assert_eq!(entry["port"], 40000);
        assert_eq!(entry["version"], "ledgermesh-0.1.0");

        // Inbound peers are reported on their listening port, once known.
        let (inbound, _rx) = peer(true, ProtocolVersion::CURRENT);
        let entry = inbound.crawl_entry();
        assert_eq!(entry["type"], "in");
        assert!(entry.get("port").is_none());
        inbound.slot().set_listening_port(51235);
        assert_eq!(inbound.crawl_entry()["port"], 51235);
    }

    #[test]
    fn test_hops_aware() {
        assert!(peer(false, ProtocolVersion::CURRENT).0.hops_aware());
        assert!(!peer(false, ProtocolVersion::new(1, 1)).0.hops_aware());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let (peer, _rx) = peer(false, ProtocolVersion::CURRENT);
        assert!(!peer.is_stopped());
        peer.stop();
        peer.stop();
        assert!(peer.is_stopped());
    }

    #[test]
    fn test_resolve_self_endpoint() {
        let (peer, _rx) = peer(true, ProtocolVersion::CURRENT);
        let resolved = peer.resolve_endpoints(vec![
            "0.0.0.0:51235".parse().unwrap(),
            "203.0.113.9:51235".parse().unwrap(),
        ]);
        assert_eq!(
            resolved,
            vec![
                "198.51.100.4:51235".parse::<SocketAddr>().unwrap(),
                "203.0.113.9:51235".parse().unwrap(),
            ]
        );
        assert_eq!(peer.listening_port(), Some(51235));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sanity_transitions() {
        let (peer, _rx) = peer(false, ProtocolVersion::CURRENT);
        peer.check_sanity(1000);
        assert_eq!(peer.sanity(), Sanity::Unknown);

        peer.claimed_ledger.store(1010, Ordering::Relaxed);
        peer.check_sanity(1000);
        assert_eq!(peer.sanity(), Sanity::Sane);

        // Between the two limits the previous classification sticks.
        peer.check_sanity(1060);
        assert_eq!(peer.sanity(), Sanity::Sane);

        peer.check_sanity(2000);
        assert_eq!(peer.sanity(), Sanity::Insane);

        peer.check(Duration::from_secs(60), Duration::from_secs(1));
        assert!(!peer.is_stopped());

        tokio::time::advance(Duration::from_secs(9)).await;
        peer.check(Duration::from_secs(60), Duration::from_secs(30));
        assert!(peer.is_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_pings_then_closes_idle_peer() {
        let (peer, mut rx) = peer(false, ProtocolVersion::CURRENT);

        tokio::time::advance(Duration::from_secs(2)).await;
        peer.check(Duration::from_secs(60), Duration::from_secs(1));
        assert_eq!(rx.try_recv().unwrap().kind, MessageKind::PING);
        assert!(!peer.is_stopped());

        tokio::time::advance(Duration::from_secs(60)).await;
        peer.check(Duration::from_secs(60), Duration::from_secs(1));
        assert!(peer.is_stopped());
    }

    #[test]
    fn test_received_hops_advance_except_from_cluster() {
        let proposal = Message::new(MessageKind::PROPOSAL, vec![7u8]).with_hops(2);

        let (ctx, mut rx) = context();
        let (outsider, _out_rx) = detached_peer(5, ProtocolVersion::CURRENT, false);
        outsider.on_message(proposal.clone(), &ctx);
        assert_eq!(rx.try_recv().unwrap().message.hops, Some(3));

        let (ctx, mut rx) = context();
        let (member, _member_rx) = detached_peer(6, ProtocolVersion::CURRENT, true);
        member.on_message(proposal, &ctx);
        let received = rx.try_recv().unwrap();
        assert_eq!(received.from_peer, PeerId(6));
        assert_eq!(received.message.hops, Some(2));
    }

    #[tokio::test]
    async fn test_stop_interrupts_blocked_write() {
        // The remote half is kept alive but never read, so writes stall
        // once the pipe buffer fills.
        let (local, _remote) = tokio::io::duplex(64);
        let framed = Framed::new(Box::new(local) as BoxedStream, MessageCodec::new());
        let (peer, rx) = detached_peer(9, ProtocolVersion::CURRENT, false);
        let (ctx, _messages) = context();

        assert!(peer.send(Message::new(MessageKind::PROPOSAL, vec![0u8; 16 * 1024])));
        let task = tokio::spawn(peer.clone().run(framed, rx, ctx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!task.is_finished());

        peer.stop();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("peer task ends after stop")
            .unwrap();
        assert_eq!(peer.stats().messages_sent, 0);
    }
}
