//! Connection slots and the allocator interface that issues them.
//!
//! A [`Slot`] is one unit of connection capacity granted by a
//! [`SlotAllocator`]. Exactly one attempt or peer owns a slot at a time, and
//! the slot goes back to the allocator exactly once. [`SlotGuard`] enforces
//! that: it is the only way the overlay holds a slot, and it calls
//! [`SlotAllocator::on_closed`] from `Drop`. A successful handshake moves the
//! guard into the peer's task; every failure path simply drops it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::{Direction, NodePublicKey};

/// Allocator-assigned identifier of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotId(pub u64);

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "slot#{}", self.0)
    }
}

/// Lifecycle state of a slot as tracked by the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Inbound connection accepted, handshake in progress.
    Accept,
    /// Outbound connection being dialed.
    Connect,
    /// Outbound TCP/TLS established, handshake in progress.
    Connected,
    /// Handshake complete; counted toward peer capacity.
    Active,
    /// Released back to the allocator.
    Closing,
}

/// Outcome of [`SlotAllocator::activate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivateResult {
    Success,
    /// A slot with the same public key is already active.
    Duplicate,
    /// No capacity left for this direction.
    Full,
}

/// One reserved connection capacity unit.
///
/// Immutable identity (id, direction, remote endpoint) plus the mutable
/// attributes the allocator fills in as the handshake progresses.
#[derive(Debug)]
pub struct Slot {
    id: SlotId,
    direction: Direction,
    remote: SocketAddr,
    fixed: bool,
    local: Mutex<Option<SocketAddr>>,
    state: Mutex<SlotState>,
    public_key: Mutex<Option<NodePublicKey>>,
    cluster: AtomicBool,
    /// Zero when unknown.
    listening_port: AtomicU16,
}

impl Slot {
    /// Creates the slot for a connection accepted by our listener.
    pub fn new_inbound(id: SlotId, local: SocketAddr, remote: SocketAddr) -> Self {
        Self::new(id, Direction::Inbound, Some(local), remote, false, SlotState::Accept)
    }

    /// Creates the slot for a connection we are about to dial.
    pub fn new_outbound(id: SlotId, remote: SocketAddr, fixed: bool) -> Self {
        Self::new(id, Direction::Outbound, None, remote, fixed, SlotState::Connect)
    }

    fn new(
        id: SlotId,
        direction: Direction,
        local: Option<SocketAddr>,
        remote: SocketAddr,
        fixed: bool,
        state: SlotState,
    ) -> Self {
        Self {
            id,
            direction,
            remote,
            fixed,
            local: Mutex::new(local),
            state: Mutex::new(state),
            public_key: Mutex::new(None),
            cluster: AtomicBool::new(false),
            listening_port: AtomicU16::new(0),
        }
    }

    pub fn id(&self) -> SlotId {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn inbound(&self) -> bool {
        self.direction == Direction::Inbound
    }

    pub fn remote_endpoint(&self) -> SocketAddr {
        self.remote
    }

    /// Returns true for configured fixed peers, which bypass capacity limits.
    pub fn fixed(&self) -> bool {
        self.fixed
    }

    pub fn local_endpoint(&self) -> Option<SocketAddr> {
        *self.local.lock()
    }

    pub fn set_local_endpoint(&self, local: SocketAddr) {
        *self.local.lock() = Some(local);
    }

    pub fn state(&self) -> SlotState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: SlotState) {
        *self.state.lock() = state;
    }

    pub fn public_key(&self) -> Option<NodePublicKey> {
        *self.public_key.lock()
    }

    pub fn set_public_key(&self, key: NodePublicKey) {
        *self.public_key.lock() = Some(key);
    }

    pub fn cluster(&self) -> bool {
        self.cluster.load(Ordering::Relaxed)
    }

    pub fn set_cluster(&self, cluster: bool) {
        self.cluster.store(cluster, Ordering::Relaxed);
    }

    /// Port the remote accepts inbound connections on, if it told us.
    pub fn listening_port(&self) -> Option<u16> {
        match self.listening_port.load(Ordering::Relaxed) {
            0 => None,
            port => Some(port),
        }
    }

    pub fn set_listening_port(&self, port: u16) {
        self.listening_port.store(port, Ordering::Relaxed);
    }

    /// The address other nodes could dial to reach this peer, if known.
    pub fn listening_endpoint(&self) -> Option<SocketAddr> {
        if self.inbound() {
            self.listening_port()
                .map(|port| SocketAddr::new(self.remote.ip(), port))
        } else {
            Some(self.remote)
        }
    }
}

/// Admission policy and discovery collaborator.
///
/// Grants and revokes slots, enforces peer-count and per-IP limits, supplies
/// redirect candidates when full and autoconnect targets when short of
/// outbound peers. Calls are synchronous and must not block.
pub trait SlotAllocator: Send + Sync {
    /// Configured maximum number of active peers.
    fn max_peers(&self) -> usize;

    /// Reserves an outbound slot, or `None` if the address must not be dialed.
    fn new_outbound_slot(&self, remote: SocketAddr) -> Option<Arc<Slot>>;

    /// Reserves a slot for an accepted connection.
    ///
    /// Returns `None` for a self-connection or a refused address.
    fn new_inbound_slot(&self, local: SocketAddr, remote: SocketAddr) -> Option<Arc<Slot>>;

    /// Records that an outbound slot finished TCP/TLS from `local`.
    ///
    /// Returns false if the connection duplicates one we already track
    /// (typically a connection to ourselves).
    fn on_connected(&self, slot: &Arc<Slot>, local: SocketAddr) -> bool;

    /// Promotes a handshaken slot to active.
    fn activate(&self, slot: &Arc<Slot>, key: &NodePublicKey, cluster: bool) -> ActivateResult;

    /// Returns a slot to the allocator. Called exactly once per slot.
    fn on_closed(&self, slot: &Arc<Slot>);

    /// Alternate addresses learned from a `503` redirect by `remote`.
    fn on_redirects(&self, remote: SocketAddr, endpoints: Vec<SocketAddr>);

    /// Endpoint gossip received from an active peer.
    fn on_endpoints(&self, slot: &Arc<Slot>, endpoints: Vec<SocketAddr>);

    /// Addresses to offer a peer we are turning away.
    fn redirect(&self, slot: &Arc<Slot>) -> Vec<SocketAddr>;

    /// Addresses the registry should dial now.
    fn autoconnect(&self) -> Vec<SocketAddr>;

    /// Periodic bookkeeping, invoked by the maintenance timer.
    fn once_per_second(&self);

    /// Endpoint gossip to push to each active slot.
    fn build_endpoints_for_peers(&self) -> Vec<(SlotId, Vec<SocketAddr>)>;
}

/// Exclusive ownership of a slot.
///
/// Dropping the guard hands the slot back to its allocator. There is no other
/// release path, so a slot is released exactly once no matter how the owning
/// attempt or peer ends.
pub struct SlotGuard {
    slot: Arc<Slot>,
    allocator: Arc<dyn SlotAllocator>,
}

impl SlotGuard {
    pub fn new(slot: Arc<Slot>, allocator: Arc<dyn SlotAllocator>) -> Self {
        Self { slot, allocator }
    }

    pub fn slot(&self) -> &Arc<Slot> {
        &self.slot
    }

    pub fn allocator(&self) -> &Arc<dyn SlotAllocator> {
        &self.allocator
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        trace!("Releasing {} ({})", self.slot.id(), self.slot.remote_endpoint());
        self.slot.set_state(SlotState::Closing);
        self.allocator.on_closed(&self.slot);
    }
}

impl std::fmt::Debug for SlotGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotGuard").field("slot", &self.slot.id()).finish()
    }
}
