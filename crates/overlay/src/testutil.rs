//! Collaborator doubles for unit tests.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::message::Message;
use crate::peer::{Peer, PeerInit};
use crate::slot::{ActivateResult, Slot, SlotAllocator, SlotId};
use crate::transport::{BoxedStream, Dialer, SecureStream, TcpConnected};
use crate::{NodePublicKey, PeerId, ProtocolVersion, Result};

/// Allocator that grants every request and records what it was told.
pub(crate) struct RecordingAllocator {
    next_slot: AtomicU64,
    refuse_outbound: AtomicBool,
    refuse_inbound: AtomicBool,
    accept_connected: AtomicBool,
    activate_result: Mutex<ActivateResult>,
    slots: Mutex<Vec<Arc<Slot>>>,
    closed: Mutex<HashMap<SlotId, usize>>,
    redirects: Mutex<Vec<SocketAddr>>,
    received_redirects: Mutex<Vec<(SocketAddr, Vec<SocketAddr>)>>,
}

impl Default for RecordingAllocator {
    fn default() -> Self {
        Self {
            next_slot: AtomicU64::new(1),
            refuse_outbound: AtomicBool::new(false),
            refuse_inbound: AtomicBool::new(false),
            accept_connected: AtomicBool::new(true),
            activate_result: Mutex::new(ActivateResult::Success),
            slots: Mutex::new(Vec::new()),
            closed: Mutex::new(HashMap::new()),
            redirects: Mutex::new(Vec::new()),
            received_redirects: Mutex::new(Vec::new()),
        }
    }
}

impl RecordingAllocator {
    pub fn refuse_outbound(&self, refuse: bool) {
        self.refuse_outbound.store(refuse, Ordering::SeqCst);
    }

    pub fn refuse_inbound(&self, refuse: bool) {
        self.refuse_inbound.store(refuse, Ordering::SeqCst);
    }

    pub fn set_accept_connected(&self, accept: bool) {
        self.accept_connected.store(accept, Ordering::SeqCst);
    }

    pub fn set_activate_result(&self, result: ActivateResult) {
        *self.activate_result.lock() = result;
    }

    pub fn set_redirects(&self, redirects: Vec<SocketAddr>) {
        *self.redirects.lock() = redirects;
    }

    pub fn received_redirects(&self) -> Vec<(SocketAddr, Vec<SocketAddr>)> {
        self.received_redirects.lock().clone()
    }

    pub fn closed_count(&self, id: SlotId) -> usize {
        self.closed.lock().get(&id).copied().unwrap_or(0)
    }

    pub fn total_closed(&self) -> usize {
        self.closed.lock().values().sum()
    }

    /// True if no slot was released more than once.
    pub fn all_closed_once(&self) -> bool {
        self.closed.lock().values().all(|count| *count == 1)
    }

    fn slot_id(&self) -> SlotId {
        SlotId(self.next_slot.fetch_add(1, Ordering::SeqCst))
    }
}

impl SlotAllocator for RecordingAllocator {
    fn max_peers(&self) -> usize {
        21
    }

    fn new_outbound_slot(&self, remote: SocketAddr) -> Option<Arc<Slot>> {
        if self.refuse_outbound.load(Ordering::SeqCst) {
            return None;
        }
        let slot = Arc::new(Slot::new_outbound(self.slot_id(), remote, false));
        self.slots.lock().push(slot.clone());
        Some(slot)
    }

    fn new_inbound_slot(&self, local: SocketAddr, remote: SocketAddr) -> Option<Arc<Slot>> {
        if self.refuse_inbound.load(Ordering::SeqCst) {
            return None;
        }
        let mut slots = self.slots.lock();
        if slots
            .iter()
            .any(|s| !s.inbound() && s.local_endpoint() == Some(remote))
        {
            return None;
        }
        let slot = Arc::new(Slot::new_inbound(self.slot_id(), local, remote));
        slots.push(slot.clone());
        Some(slot)
    }

    fn on_connected(&self, slot: &Arc<Slot>, local: SocketAddr) -> bool {
        slot.set_local_endpoint(local);
        self.accept_connected.load(Ordering::SeqCst)
    }

    fn activate(&self, slot: &Arc<Slot>, key: &NodePublicKey, cluster: bool) -> ActivateResult {
        let result = *self.activate_result.lock();
        if result == ActivateResult::Success {
            slot.set_public_key(*key);
            slot.set_cluster(cluster);
        }
        result
    }

    fn on_closed(&self, slot: &Arc<Slot>) {
        *self.closed.lock().entry(slot.id()).or_insert(0) += 1;
        self.slots.lock().retain(|s| s.id() != slot.id());
    }

    fn on_redirects(&self, remote: SocketAddr, endpoints: Vec<SocketAddr>) {
        self.received_redirects.lock().push((remote, endpoints));
    }

    fn on_endpoints(&self, _slot: &Arc<Slot>, _endpoints: Vec<SocketAddr>) {}

    fn redirect(&self, _slot: &Arc<Slot>) -> Vec<SocketAddr> {
        self.redirects.lock().clone()
    }

    fn autoconnect(&self) -> Vec<SocketAddr> {
        Vec::new()
    }

    fn once_per_second(&self) {}

    fn build_endpoints_for_peers(&self) -> Vec<(SlotId, Vec<SocketAddr>)> {
        Vec::new()
    }
}

/// Dialer whose connections never complete.
pub(crate) struct PendingDialer;

#[async_trait]
impl Dialer for PendingDialer {
    async fn dial(&self, _remote: SocketAddr) -> Result<TcpConnected> {
        std::future::pending().await
    }

    async fn secure(&self, _stream: BoxedStream, _remote: SocketAddr) -> Result<SecureStream> {
        std::future::pending().await
    }
}

/// An outbound peer with no I/O task behind it.
pub(crate) fn detached_peer(
    id: u32,
    protocol: ProtocolVersion,
    cluster: bool,
) -> (Arc<Peer>, mpsc::Receiver<Message>) {
    let remote: SocketAddr = format!("198.51.100.{}:51235", id % 250)
        .parse()
        .expect("valid test address");
    Peer::new(
        PeerInit {
            id: PeerId(id),
            slot: Arc::new(Slot::new_outbound(SlotId(u64::from(id)), remote, false)),
            public_key: NodePublicKey([id as u8; 32]),
            protocol,
            version: None,
            cluster,
            crawl: true,
        },
        8,
    )
}
