//! Built-in slot allocator.
//!
//! [`SimpleSlotAllocator`] is the admission policy a standalone node uses when
//! no external discovery service is plugged in. It tracks every slot by its
//! remote endpoint and decides:
//!
//! - whether a new inbound or outbound connection may start (duplicates,
//!   self connections and the per-IP inbound limit are refused);
//! - whether a handshaken connection may become active (capacity per
//!   direction and duplicate node keys);
//! - which addresses to dial, redirect to, and gossip.
//!
//! Candidate addresses come from the configured bootstrap list, from `503`
//! redirects and from endpoint gossip. They are kept in a bounded cache with
//! the newest entries last.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tracing::{debug, info, trace};

use crate::slot::{ActivateResult, Slot, SlotAllocator, SlotId, SlotState};
use crate::NodePublicKey;

/// Maximum number of addresses returned in a redirect.
const REDIRECT_LIMIT: usize = 10;

/// Maximum number of addresses in one gossip message.
const GOSSIP_LIMIT: usize = 10;

/// Interval between endpoint gossip rounds.
const GOSSIP_INTERVAL: Duration = Duration::from_secs(5);

/// How long to wait before dialing the same address again.
const RETRY_BACKOFF: Duration = Duration::from_secs(10);

/// Capacity of the candidate address cache.
const CACHE_SIZE: usize = 1000;

/// Configuration for [`SimpleSlotAllocator`].
#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    /// Maximum number of active peers in both directions.
    pub max_peers: usize,

    /// Outbound share of `max_peers`; the rest is available to inbound peers.
    pub out_peers: usize,

    /// Whether inbound connections are accepted at all.
    pub want_incoming: bool,

    /// Whether the maintenance timer should dial cached addresses.
    pub auto_connect: bool,

    /// Port advertised in gossip as our own address.
    pub listening_port: Option<u16>,

    /// Maximum concurrent inbound connections from one IP address.
    pub ip_limit: usize,

    /// Our public address, if known. Never redirected to or dialed.
    pub public_ip: Option<Ipv4Addr>,

    /// Addresses we always keep a connection to. They bypass capacity limits.
    pub fixed: Vec<SocketAddr>,

    /// Initial dial candidates.
    pub bootstrap: Vec<SocketAddr>,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            max_peers: 21,
            out_peers: 10,
            want_incoming: true,
            auto_connect: true,
            listening_port: Some(51235),
            ip_limit: 2,
            public_ip: None,
            fixed: Vec::new(),
            bootstrap: Vec::new(),
        }
    }
}

impl AllocatorConfig {
    /// Inbound share of `max_peers`.
    pub fn in_peers(&self) -> usize {
        self.max_peers.saturating_sub(self.out_peers)
    }
}

#[derive(Default)]
struct State {
    /// Every tracked slot, by remote endpoint.
    slots: HashMap<SocketAddr, Arc<Slot>>,
    /// Keys of active slots.
    keys: HashSet<NodePublicKey>,
    active_in: usize,
    active_out: usize,
    /// Candidate addresses, oldest first.
    cache: VecDeque<SocketAddr>,
    retry_after: HashMap<SocketAddr, Instant>,
    last_gossip: Option<Instant>,
}

impl State {
    fn remember(&mut self, addr: SocketAddr) {
        if let Some(pos) = self.cache.iter().position(|a| *a == addr) {
            self.cache.remove(pos);
        }
        self.cache.push_back(addr);
        while self.cache.len() > CACHE_SIZE {
            self.cache.pop_front();
        }
    }

    fn outbound_pending(&self) -> usize {
        self.slots
            .values()
            .filter(|s| !s.inbound() && s.state() != SlotState::Active)
            .count()
    }
}

/// In-process slot allocator with a bounded address cache.
pub struct SimpleSlotAllocator {
    config: AllocatorConfig,
    next_slot: AtomicU64,
    state: Mutex<State>,
}

impl SimpleSlotAllocator {
    pub fn new(config: AllocatorConfig) -> Self {
        let mut state = State::default();
        for addr in &config.bootstrap {
            state.remember(*addr);
        }
        Self {
            config,
            next_slot: AtomicU64::new(1),
            state: Mutex::new(state),
        }
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Number of active inbound and outbound slots.
    pub fn active_counts(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.active_in, state.active_out)
    }

    /// Snapshot of the candidate cache, newest last.
    pub fn cached_endpoints(&self) -> Vec<SocketAddr> {
        self.state.lock().cache.iter().copied().collect()
    }

    fn slot_id(&self) -> SlotId {
        SlotId(self.next_slot.fetch_add(1, Ordering::Relaxed))
    }

    /// Addresses that are never worth dialing or handing out.
    fn is_usable(&self, addr: &SocketAddr) -> bool {
        if addr.port() == 0 || addr.ip().is_unspecified() {
            return false;
        }
        match (self.config.public_ip, addr.ip()) {
            (Some(ours), IpAddr::V4(ip)) => {
                !(ip == ours && Some(addr.port()) == self.config.listening_port)
            }
            _ => true,
        }
    }

    fn learn(&self, source: &str, endpoints: Vec<SocketAddr>) {
        let mut state = self.state.lock();
        let mut learned = 0;
        for addr in endpoints {
            if self.is_usable(&addr) {
                state.remember(addr);
                learned += 1;
            }
        }
        if learned > 0 {
            trace!("Learned {} endpoints from {}", learned, source);
        }
    }
}

impl SlotAllocator for SimpleSlotAllocator {
    fn max_peers(&self) -> usize {
        self.config.max_peers
    }

    fn new_outbound_slot(&self, remote: SocketAddr) -> Option<Arc<Slot>> {
        let mut state = self.state.lock();
        if state.slots.contains_key(&remote) {
            debug!("Outbound {}: already connected", remote);
            return None;
        }
        let fixed = self.config.fixed.contains(&remote);
        let slot = Arc::new(Slot::new_outbound(self.slot_id(), remote, fixed));
        state.slots.insert(remote, slot.clone());
        state
            .retry_after
            .insert(remote, Instant::now() + RETRY_BACKOFF);
        trace!("New outbound {} to {}", slot.id(), remote);
        Some(slot)
    }

    fn new_inbound_slot(&self, local: SocketAddr, remote: SocketAddr) -> Option<Arc<Slot>> {
        if !self.config.want_incoming {
            debug!("Inbound {}: not accepting incoming connections", remote);
            return None;
        }
        let mut state = self.state.lock();

        // Our own outbound connection arriving back at our listener.
        if state
            .slots
            .values()
            .any(|s| !s.inbound() && s.local_endpoint() == Some(remote))
        {
            info!("Inbound {}: self connection", remote);
            return None;
        }
        if state.slots.contains_key(&remote) {
            debug!("Inbound {}: duplicate connection", remote);
            return None;
        }
        let from_ip = state
            .slots
            .values()
            .filter(|s| s.inbound() && s.remote_endpoint().ip() == remote.ip())
            .count();
        if from_ip >= self.config.ip_limit {
            debug!("Inbound {}: IP limit {} reached", remote, self.config.ip_limit);
            return None;
        }

        let slot = Arc::new(Slot::new_inbound(self.slot_id(), local, remote));
        state.slots.insert(remote, slot.clone());
        trace!("New inbound {} from {}", slot.id(), remote);
        Some(slot)
    }

    fn on_connected(&self, slot: &Arc<Slot>, local: SocketAddr) -> bool {
        let state = self.state.lock();
        slot.set_local_endpoint(local);
        // An inbound slot whose remote is our own local endpoint.
        if let Some(other) = state.slots.get(&local) {
            if other.inbound() {
                info!("Outbound {}: self connection via {}", slot.remote_endpoint(), local);
                return false;
            }
        }
        slot.set_state(SlotState::Connected);
        true
    }

    fn activate(&self, slot: &Arc<Slot>, key: &NodePublicKey, cluster: bool) -> ActivateResult {
        let mut state = self.state.lock();
        if state.keys.contains(key) {
            return ActivateResult::Duplicate;
        }

        let bypass = cluster || slot.fixed();
        if !bypass {
            let full = if slot.inbound() {
                state.active_in >= self.config.in_peers()
            } else {
                state.active_out >= self.config.out_peers
            };
            if full {
                return ActivateResult::Full;
            }
        }

        slot.set_public_key(*key);
        slot.set_cluster(cluster);
        slot.set_state(SlotState::Active);
        state.keys.insert(*key);
        if slot.inbound() {
            state.active_in += 1;
        } else {
            state.active_out += 1;
            state.retry_after.remove(&slot.remote_endpoint());
        }
        if let Some(endpoint) = slot.listening_endpoint() {
            if self.is_usable(&endpoint) {
                state.remember(endpoint);
            }
        }
        ActivateResult::Success
    }

    fn on_closed(&self, slot: &Arc<Slot>) {
        let mut state = self.state.lock();
        let remote = slot.remote_endpoint();
        if state.slots.get(&remote).map(|s| s.id()) == Some(slot.id()) {
            state.slots.remove(&remote);
        }
        if let Some(key) = slot.public_key() {
            if state.keys.remove(&key) {
                if slot.inbound() {
                    state.active_in = state.active_in.saturating_sub(1);
                } else {
                    state.active_out = state.active_out.saturating_sub(1);
                }
            }
        }
        trace!("Closed {} ({})", slot.id(), remote);
    }

    fn on_redirects(&self, remote: SocketAddr, endpoints: Vec<SocketAddr>) {
        self.learn(&remote.to_string(), endpoints);
    }

    fn on_endpoints(&self, slot: &Arc<Slot>, endpoints: Vec<SocketAddr>) {
        self.learn(&slot.remote_endpoint().to_string(), endpoints);
    }

    fn redirect(&self, slot: &Arc<Slot>) -> Vec<SocketAddr> {
        let requester = slot.remote_endpoint().ip();
        let state = self.state.lock();
        state
            .cache
            .iter()
            .rev()
            .filter(|addr| addr.ip() != requester)
            .take(REDIRECT_LIMIT)
            .copied()
            .collect()
    }

    fn autoconnect(&self) -> Vec<SocketAddr> {
        if !self.config.auto_connect {
            return Vec::new();
        }
        let state = self.state.lock();
        let now = Instant::now();
        let ready = |addr: &SocketAddr| {
            !state.slots.contains_key(addr)
                && state.retry_after.get(addr).map_or(true, |next| *next <= now)
        };

        let mut targets: Vec<SocketAddr> =
            self.config.fixed.iter().copied().filter(|a| ready(a)).collect();

        let wanted = self
            .config
            .out_peers
            .saturating_sub(state.active_out + state.outbound_pending());
        if wanted == 0 {
            return targets;
        }

        let mut candidates: Vec<SocketAddr> = state
            .cache
            .iter()
            .copied()
            .filter(|a| ready(a) && !targets.contains(a))
            .collect();
        candidates.shuffle(&mut rand::thread_rng());
        targets.extend(candidates.into_iter().take(wanted));
        targets
    }

    fn once_per_second(&self) {
        let now = Instant::now();
        self.state.lock().retry_after.retain(|_, next| *next > now);
    }

    fn build_endpoints_for_peers(&self) -> Vec<(SlotId, Vec<SocketAddr>)> {
        let mut state = self.state.lock();
        let now = Instant::now();
        if state
            .last_gossip
            .is_some_and(|last| now.duration_since(last) < GOSSIP_INTERVAL)
        {
            return Vec::new();
        }
        state.last_gossip = Some(now);

        let mut ours = Vec::new();
        if self.config.want_incoming {
            if let Some(port) = self.config.listening_port {
                ours.push(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
            }
        }

        state
            .slots
            .values()
            .filter(|slot| slot.state() == SlotState::Active)
            .map(|slot| {
                let own = slot.listening_endpoint();
                let mut endpoints = ours.clone();
                endpoints.extend(
                    state
                        .cache
                        .iter()
                        .rev()
                        .filter(|addr| Some(**addr) != own)
                        .take(GOSSIP_LIMIT)
                        .copied(),
                );
                (slot.id(), endpoints)
            })
            .filter(|(_, endpoints)| !endpoints.is_empty())
            .collect()
    }
}

impl std::fmt::Debug for SimpleSlotAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SimpleSlotAllocator")
            .field("slots", &state.slots.len())
            .field("active_in", &state.active_in)
            .field("active_out", &state.active_out)
            .field("cache", &state.cache.len())
            .finish()
    }
}
