//! The peer registry: owner of every active peer and tracked task.
//!
//! [`PeerRegistry`] is a cheap-to-clone handle around shared state. It keeps:
//!
//! - two indexes of active peers, by slot and by numeric id;
//! - the set of tracked children (connection attempts, peer I/O tasks and
//!   the maintenance timer), each with a cancellation token;
//! - the suppression table used by [`PeerRegistry::relay`];
//! - a broadcast channel on which received messages are published.
//!
//! Both indexes and the child set are guarded by one `parking_lot::Mutex`.
//! It is only held for inserts, removals and snapshots, never across an
//! `.await`.
//!
//! # Shutdown
//!
//! [`PeerRegistry::stop`] marks the registry as stopping and cancels every
//! tracked child. Each child deregisters itself through its [`ChildGuard`]
//! when its task ends; [`PeerRegistry::wait_stopped`] resolves once the
//! child count reaches zero.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::attempt::{AttemptHandle, ConnectionAttempt};
use crate::hello::{ChannelBinding, HandshakeVerifier, HelloPayload};
use crate::message::{Message, MessageId};
use crate::metrics::OverlayMetrics;
use crate::peer::{Peer, PeerContext, PeerFramed};
use crate::relay::{exceeds_hop_limit, fan_out, SuppressionStats, SuppressionTable};
use crate::slot::{SlotAllocator, SlotGuard, SlotId};
use crate::transport::Dialer;
use crate::{OverlayConfig, PeerId, Result};

/// A message received from a connected peer via the overlay network.
///
/// These messages are delivered to subscribers of the registry's broadcast
/// channel. The `from_peer` field identifies the sender.
#[derive(Debug, Clone)]
pub struct OverlayMessage {
    /// The peer that sent this message.
    pub from_peer: PeerId,
    /// The message, with its hop counter already advanced.
    pub message: Message,
    /// When the message was received from the peer (before broadcast channel delivery).
    pub received_at: Instant,
}

/// Summary statistics for the overlay.
#[derive(Debug, Clone)]
pub struct OverlayStats {
    /// Total number of active peers (inbound + outbound).
    pub active_peers: usize,
    /// Number of peers that connected to us.
    pub inbound_peers: usize,
    /// Number of peers we connected to.
    pub outbound_peers: usize,
    /// Attempts, peers and timers still running.
    pub tracked: usize,
    pub suppression: SuppressionStats,
    pub metrics: crate::metrics::OverlayMetricsSnapshot,
}

#[derive(Debug, Clone, Copy)]
enum ChildKind {
    Attempt(PeerId),
    Peer(PeerId),
    Timer,
}

struct Child {
    kind: ChildKind,
    token: CancellationToken,
}

#[derive(Default)]
struct RegistryState {
    by_slot: HashMap<SlotId, Arc<Peer>>,
    by_id: BTreeMap<PeerId, Arc<Peer>>,
    children: HashMap<u64, Child>,
    stopping: bool,
    timer_started: bool,
}

pub(crate) struct Shared {
    config: OverlayConfig,
    allocator: Arc<dyn SlotAllocator>,
    verifier: Arc<dyn HandshakeVerifier>,
    dialer: Arc<dyn Dialer>,
    state: Mutex<RegistryState>,
    next_id: AtomicU32,
    next_child: AtomicU64,
    child_count: watch::Sender<usize>,
    suppression: Arc<SuppressionTable>,
    messages: broadcast::Sender<OverlayMessage>,
    metrics: Arc<OverlayMetrics>,
    ticks: AtomicU64,
    validated_index: AtomicU32,
}

impl Shared {
    /// Registers a child. Must be called with the state lock held.
    fn track(
        self: &Arc<Self>,
        state: &mut RegistryState,
        kind: ChildKind,
        token: CancellationToken,
    ) -> ChildGuard {
        let key = self.next_child.fetch_add(1, Ordering::Relaxed);
        if state.stopping {
            token.cancel();
        }
        trace!("Tracking {:?}", kind);
        state.children.insert(key, Child { kind, token });
        self.child_count.send_replace(state.children.len());
        ChildGuard {
            shared: Arc::clone(self),
            key,
        }
    }
}

/// Deregisters a tracked child when dropped.
///
/// Never drop one while holding the registry lock.
pub(crate) struct ChildGuard {
    shared: Arc<Shared>,
    key: u64,
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        if let Some(child) = state.children.remove(&self.key) {
            trace!("Untracked {:?}", child.kind);
        }
        self.shared.child_count.send_replace(state.children.len());
    }
}

/// Process-wide owner of active peers and in-flight attempts.
#[derive(Clone)]
pub struct PeerRegistry {
    shared: Arc<Shared>,
}

impl PeerRegistry {
    pub fn new(
        config: OverlayConfig,
        allocator: Arc<dyn SlotAllocator>,
        verifier: Arc<dyn HandshakeVerifier>,
        dialer: Arc<dyn Dialer>,
    ) -> Self {
        let (messages, _) = broadcast::channel(config.message_channel_size.max(1));
        let suppression = Arc::new(SuppressionTable::new(
            config.suppression_ttl,
            config.suppression_max_entries,
        ));
        Self {
            shared: Arc::new(Shared {
                config,
                allocator,
                verifier,
                dialer,
                state: Mutex::new(RegistryState::default()),
                next_id: AtomicU32::new(1),
                next_child: AtomicU64::new(0),
                child_count: watch::Sender::new(0),
                suppression,
                messages,
                metrics: Arc::new(OverlayMetrics::new()),
                ticks: AtomicU64::new(0),
                validated_index: AtomicU32::new(0),
            }),
        }
    }

    pub fn config(&self) -> &OverlayConfig {
        &self.shared.config
    }

    pub(crate) fn allocator(&self) -> &Arc<dyn SlotAllocator> {
        &self.shared.allocator
    }

    pub(crate) fn verifier(&self) -> &Arc<dyn HandshakeVerifier> {
        &self.shared.verifier
    }

    pub(crate) fn dialer(&self) -> &Arc<dyn Dialer> {
        &self.shared.dialer
    }

    pub fn metrics(&self) -> &Arc<OverlayMetrics> {
        &self.shared.metrics
    }

    pub fn suppression(&self) -> &Arc<SuppressionTable> {
        &self.shared.suppression
    }

    /// Our node key.
    pub fn public_key(&self) -> crate::NodePublicKey {
        self.shared.verifier.public_key()
    }

    pub(crate) fn next_peer_id(&self) -> PeerId {
        PeerId(self.shared.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Our hello for a session, with listening port and privacy filled in.
    pub(crate) fn local_hello(&self, binding: &ChannelBinding) -> Result<HelloPayload> {
        let mut hello = self.shared.verifier.build_hello(binding)?;
        hello.listening_port = self.shared.config.listening_port;
        hello.private = self.shared.config.peer_private;
        Ok(hello)
    }

    pub(crate) fn peer_context(&self) -> PeerContext {
        PeerContext {
            allocator: self.shared.allocator.clone(),
            suppression: self.shared.suppression.clone(),
            messages: self.shared.messages.clone(),
            metrics: self.shared.metrics.clone(),
        }
    }

    /// Starts the one-second maintenance timer. Calling it again has no effect.
    pub fn start(&self) {
        let token = CancellationToken::new();
        let child = {
            let mut state = self.shared.state.lock();
            if state.timer_started || state.stopping {
                return;
            }
            state.timer_started = true;
            self.shared.track(&mut state, ChildKind::Timer, token.clone())
        };

        let registry = self.clone();
        tokio::spawn(async move {
            let period = registry.shared.config.tick_interval;
            let mut interval =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => registry.on_timer(),
                }
            }
            debug!("Maintenance timer stopped");
            drop(child);
        });
    }

    fn on_timer(&self) {
        self.shared.allocator.once_per_second();
        self.send_endpoints();
        self.auto_connect();

        let ticks = self.shared.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        if self.shared.config.check_ticks > 0 && ticks % self.shared.config.check_ticks == 0 {
            self.check();
        }
    }

    /// Starts an outbound connection attempt to `remote`.
    ///
    /// Returns `None` without side effects if the allocator refuses a slot or
    /// the registry is stopping.
    pub fn connect(&self, remote: SocketAddr) -> Option<AttemptHandle> {
        if self.is_stopping() {
            debug!("Connect: Stopping, not connecting to {}", remote);
            return None;
        }
        let Some(slot) = self.shared.allocator.new_outbound_slot(remote) else {
            debug!("Connect: No slot for {}", remote);
            return None;
        };
        let guard = SlotGuard::new(slot, self.shared.allocator.clone());

        let id = self.next_peer_id();
        let cancel = CancellationToken::new();
        let child = {
            let mut state = self.shared.state.lock();
            if state.stopping {
                None
            } else {
                Some(
                    self.shared
                        .track(&mut state, ChildKind::Attempt(id), cancel.clone()),
                )
            }
        };
        let child = child?;

        self.shared.metrics.attempts_started.inc();
        let attempt = ConnectionAttempt::new(id, remote, guard, self.clone(), cancel);
        Some(attempt.start(child))
    }

    /// Inserts a handshaken peer into both indexes and starts its I/O task.
    ///
    /// Returns false, dropping the peer and releasing its slot, if the
    /// registry is stopping.
    pub(crate) fn promote(
        &self,
        peer: Arc<Peer>,
        framed: PeerFramed,
        outbound_rx: mpsc::Receiver<Message>,
        slot: SlotGuard,
    ) -> bool {
        let mut state = self.shared.state.lock();
        if state.stopping {
            debug!("{} Not promoted: stopping", peer.id());
            return false;
        }
        self.insert_and_run(&mut state, peer, framed, outbound_rx, slot);
        true
    }

    /// Registers `peer` and spawns its I/O task. Must be called under the lock.
    fn insert_and_run(
        &self,
        state: &mut RegistryState,
        peer: Arc<Peer>,
        framed: PeerFramed,
        outbound_rx: mpsc::Receiver<Message>,
        slot: SlotGuard,
    ) {
        let id = peer.id();
        let slot_id = peer.slot().id();

        let previous = state.by_slot.insert(slot_id, peer.clone());
        assert!(previous.is_none(), "{} already has a peer", slot_id);
        let previous = state.by_id.insert(id, peer.clone());
        assert!(previous.is_none(), "{} already registered", id);

        let child = self
            .shared
            .track(state, ChildKind::Peer(id), peer.cancel_token());

        self.shared.metrics.peers_activated.inc();
        info!(
            "{} Activated {} {} ({})",
            id,
            if peer.is_inbound() { "inbound" } else { "outbound" },
            peer.remote_address(),
            peer.public_key()
        );

        let registry = self.clone();
        let ctx = self.peer_context();
        tokio::spawn(async move {
            peer.clone().run(framed, outbound_rx, ctx).await;
            registry.remove_peer(&peer);
            registry.shared.metrics.peers_closed.inc();
            drop(slot);
            drop(child);
        });
    }

    fn remove_peer(&self, peer: &Peer) {
        let mut state = self.shared.state.lock();
        let by_slot = Self::remove(&mut state, peer.slot().id());
        let by_id = Self::remove_by_id(&mut state, peer.id());
        drop(state);
        // The removed handles are released outside the lock.
        drop((by_slot, by_id));
        debug!("{} Removed {}", peer.id(), peer.remote_address());
    }

    /// Erases the slot index entry. The entry must exist.
    fn remove(state: &mut RegistryState, slot: SlotId) -> Arc<Peer> {
        state
            .by_slot
            .remove(&slot)
            .unwrap_or_else(|| panic!("no peer for {}", slot))
    }

    /// Erases the id index entry. The entry must exist.
    fn remove_by_id(state: &mut RegistryState, id: PeerId) -> Arc<Peer> {
        state
            .by_id
            .remove(&id)
            .unwrap_or_else(|| panic!("no peer with id {}", id))
    }

    /// Number of active peers.
    pub fn size(&self) -> usize {
        self.shared.state.lock().by_id.len()
    }

    /// Configured maximum number of peers.
    pub fn limit(&self) -> usize {
        self.shared.allocator.max_peers()
    }

    pub fn find_peer_by_short_id(&self, id: PeerId) -> Option<Arc<Peer>> {
        self.shared.state.lock().by_id.get(&id).cloned()
    }

    /// Snapshot of active peers in id order.
    pub fn active_peers(&self) -> Vec<Arc<Peer>> {
        self.shared.state.lock().by_id.values().cloned().collect()
    }

    /// Returns up to `limit` active peers, highest `score` first.
    ///
    /// Peers with equal scores keep their snapshot order.
    pub fn select_peers<F>(&self, score: F, limit: usize) -> Vec<Arc<Peer>>
    where
        F: Fn(&Peer) -> i64,
    {
        let mut scored: Vec<(i64, Arc<Peer>)> = self
            .active_peers()
            .into_iter()
            .map(|peer| (score(&peer), peer))
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        scored.into_iter().take(limit).map(|(_, peer)| peer).collect()
    }

    /// Relays a received message to every peer that does not have it yet.
    ///
    /// Drops the message if its hop counter reached `hop_limit`, and does
    /// nothing if `id` was already relayed. Returns the number of peers the
    /// message was queued for.
    pub fn relay(&self, message: &Message, id: MessageId, hop_limit: u32) -> usize {
        if exceeds_hop_limit(message, hop_limit) {
            self.shared.metrics.messages_hop_dropped.inc();
            trace!("Not relaying {} {}: hop limit {}", message.kind, id, hop_limit);
            return 0;
        }
        let Some(skip) = self.shared.suppression.take_for_relay(id) else {
            self.shared.metrics.messages_suppressed.inc();
            return 0;
        };

        let sent = fan_out(&self.active_peers(), message, &skip);
        self.shared.metrics.messages_relayed.inc();
        trace!("Relayed {} {} to {} peers", message.kind, id, sent);
        sent
    }

    /// Sends a message originated by this node to every active peer.
    ///
    /// When hop expiry is enabled the counter is reset to zero.
    pub fn send(&self, mut message: Message) -> usize {
        if self.shared.config.expire {
            message.hops = Some(0);
        }
        // Mark it relayed so echoes from peers are not relayed again.
        let _ = self.shared.suppression.take_for_relay(message.id());
        let sent = fan_out(&self.active_peers(), &message, &Default::default());
        trace!("Sent {} to {} peers", message.kind, sent);
        sent
    }

    /// Point-in-time description of active peers.
    pub fn crawl(&self) -> serde_json::Value {
        let active: Vec<serde_json::Value> =
            self.active_peers().iter().map(|p| p.crawl_entry()).collect();
        json!({ "active": active })
    }

    /// Subscribes to messages received from peers.
    pub fn subscribe(&self) -> broadcast::Receiver<OverlayMessage> {
        self.shared.messages.subscribe()
    }

    /// Pushes the allocator's endpoint gossip to its peers.
    pub fn send_endpoints(&self) {
        for (slot, endpoints) in self.shared.allocator.build_endpoints_for_peers() {
            let peer = self.shared.state.lock().by_slot.get(&slot).cloned();
            if let Some(peer) = peer {
                peer.send_endpoints(&endpoints);
            }
        }
    }

    /// Dials the allocator's recommended addresses.
    pub fn auto_connect(&self) {
        for remote in self.shared.allocator.autoconnect() {
            let _ = self.connect(remote);
        }
    }

    /// Runs the idle and sanity check over all peers.
    pub fn check(&self) {
        let config = &self.shared.config;
        for peer in self.active_peers() {
            peer.check(config.peer_idle_timeout, config.tick_interval);
        }
    }

    /// Records our validated ledger index and reclassifies every peer.
    pub fn check_sanity(&self, index: u32) {
        self.shared.validated_index.store(index, Ordering::Relaxed);
        for peer in self.active_peers() {
            peer.check_sanity(index);
        }
    }

    /// Last index passed to [`check_sanity`](Self::check_sanity).
    pub fn validated_index(&self) -> u32 {
        self.shared.validated_index.load(Ordering::Relaxed)
    }

    pub fn is_stopping(&self) -> bool {
        self.shared.state.lock().stopping
    }

    /// Number of attempts, peers and timers still running.
    pub fn tracked(&self) -> usize {
        *self.shared.child_count.borrow()
    }

    /// Cancels every tracked attempt, peer and timer. Idempotent.
    pub fn stop(&self) {
        let mut state = self.shared.state.lock();
        if state.stopping {
            return;
        }
        state.stopping = true;
        info!(
            "Stopping overlay: {} peers, {} tracked",
            state.by_id.len(),
            state.children.len()
        );
        for child in state.children.values() {
            trace!("Cancelling {:?}", child.kind);
            child.token.cancel();
        }
    }

    /// Resolves once every tracked child has deregistered.
    pub async fn wait_stopped(&self) {
        let mut rx = self.shared.child_count.subscribe();
        if rx.wait_for(|count| *count == 0).await.is_err() {
            warn!("Child count channel closed during shutdown");
        }
    }

    /// Stops the registry and waits for all of its tasks.
    pub async fn shutdown(&self) {
        self.stop();
        self.wait_stopped().await;
        info!("Overlay stopped");
    }

    pub fn stats(&self) -> OverlayStats {
        let (active, inbound) = {
            let state = self.shared.state.lock();
            let inbound = state.by_id.values().filter(|p| p.is_inbound()).count();
            (state.by_id.len(), inbound)
        };
        OverlayStats {
            active_peers: active,
            inbound_peers: inbound,
            outbound_peers: active - inbound,
            tracked: self.tracked(),
            suppression: self.shared.suppression.stats(),
            metrics: self.shared.metrics.snapshot(),
        }
    }
}

impl std::fmt::Debug for PeerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerRegistry")
            .field("active", &self.size())
            .field("tracked", &self.tracked())
            .finish()
    }
}
