//! Duplicate suppression and fan-out for relayed messages.
//!
//! The overlay floods consensus messages to every active peer. To stop a
//! message from bouncing around the mesh, the [`SuppressionTable`] keeps one
//! record per [`MessageId`]:
//!
//! - **Peer set**: peers known to already have the message, either because
//!   they sent it to us or because we sent it to them.
//! - **Relayed flag**: set the first time we relay or originate the message.
//!   Once set, later relay requests for the same id are no-ops.
//!
//! Taking the record for relay is a single atomic check-and-update per entry
//! ([`SuppressionTable::take_for_relay`]), independent of the registry lock.
//!
//! Records are evicted after a configurable TTL, and early when the table
//! grows past its size cap. A message can only be re-relayed after its record
//! has been evicted.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::message::{Message, MessageId};
use crate::peer::Peer;
use crate::PeerId;

/// How often to sweep for expired records.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

struct SuppressionEntry {
    first_seen: Instant,
    peers: HashSet<PeerId>,
    relayed: bool,
}

impl SuppressionEntry {
    fn new() -> Self {
        Self {
            first_seen: Instant::now(),
            peers: HashSet::new(),
            relayed: false,
        }
    }

    fn is_expired(&self, ttl: Duration) -> bool {
        self.first_seen.elapsed() > ttl
    }
}

/// Per-message record of which peers already have it.
pub struct SuppressionTable {
    entries: DashMap<MessageId, SuppressionEntry>,
    ttl: Duration,
    max_entries: usize,
    last_cleanup: RwLock<Instant>,
    sightings: AtomicU64,
    duplicates: AtomicU64,
    relayed: AtomicU64,
    suppressed: AtomicU64,
}

impl SuppressionTable {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            max_entries: max_entries.max(1),
            last_cleanup: RwLock::new(Instant::now()),
            sightings: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            relayed: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
        }
    }

    /// Records that `peer` sent us message `id`.
    ///
    /// Returns true if this is the first time the message has been seen.
    pub fn add_peer(&self, id: MessageId, peer: PeerId) -> bool {
        self.sightings.fetch_add(1, Ordering::Relaxed);
        self.maybe_cleanup();

        let mut first = false;
        self.entries
            .entry(id)
            .or_insert_with(|| {
                first = true;
                SuppressionEntry::new()
            })
            .peers
            .insert(peer);

        if first {
            trace!("New message {} from {}", id, peer);
        } else {
            self.duplicates.fetch_add(1, Ordering::Relaxed);
        }
        first
    }

    /// Claims message `id` for relay.
    ///
    /// Returns `None` if the message was already relayed. Otherwise marks it
    /// relayed and returns the peers that must be skipped, leaving the
    /// record's peer set empty for later sightings.
    pub fn take_for_relay(&self, id: MessageId) -> Option<HashSet<PeerId>> {
        self.maybe_cleanup();

        let mut entry = self.entries.entry(id).or_insert_with(SuppressionEntry::new);
        if entry.relayed {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            trace!("Suppressed relay of {}", id);
            return None;
        }
        entry.relayed = true;
        self.relayed.fetch_add(1, Ordering::Relaxed);
        Some(std::mem::take(&mut entry.peers))
    }

    /// Returns true if message `id` was seen or relayed within the retention window.
    pub fn contains(&self, id: &MessageId) -> bool {
        self.entries.contains_key(id)
    }

    /// Returns the peers currently recorded for `id`.
    pub fn peers(&self, id: &MessageId) -> HashSet<PeerId> {
        self.entries
            .get(id)
            .map(|entry| entry.peers.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops expired records, then the oldest half if still over the size cap.
    pub fn cleanup(&self) {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries.retain(|_, entry| !entry.is_expired(ttl));

        if self.entries.len() > self.max_entries {
            let mut by_age: Vec<(Instant, MessageId)> = self
                .entries
                .iter()
                .map(|e| (e.first_seen, *e.key()))
                .collect();
            by_age.sort_unstable_by_key(|(seen, _)| *seen);
            let excess = by_age.len().saturating_sub(self.max_entries / 2);
            for (_, id) in by_age.into_iter().take(excess) {
                self.entries.remove(&id);
            }
        }

        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!("Suppression cleanup: removed {} records", removed);
        }
        *self.last_cleanup.write() = Instant::now();
    }

    fn maybe_cleanup(&self) {
        let due = self.last_cleanup.read().elapsed() > CLEANUP_INTERVAL
            || self.entries.len() > self.max_entries;
        if due {
            self.cleanup();
        }
    }

    pub fn stats(&self) -> SuppressionStats {
        SuppressionStats {
            tracked: self.entries.len(),
            sightings: self.sightings.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            relayed: self.relayed.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
        }
    }
}

impl Default for SuppressionTable {
    fn default() -> Self {
        Self::new(Duration::from_secs(300), 100_000)
    }
}

/// Statistics snapshot from a [`SuppressionTable`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SuppressionStats {
    /// Records currently held.
    pub tracked: usize,
    /// Messages received from peers, duplicates included.
    pub sightings: u64,
    /// Received messages that were already known.
    pub duplicates: u64,
    /// Messages claimed for relay.
    pub relayed: u64,
    /// Relay requests refused because the message was already relayed.
    pub suppressed: u64,
}

impl SuppressionStats {
    /// Duplicate sightings as a percentage of all sightings.
    pub fn duplicate_rate(&self) -> f64 {
        if self.sightings == 0 {
            0.0
        } else {
            (self.duplicates as f64 / self.sightings as f64) * 100.0
        }
    }
}

/// Returns true if a hop-bounded message must not travel further.
pub(crate) fn exceeds_hop_limit(message: &Message, hop_limit: u32) -> bool {
    matches!(message.hops, Some(hops) if hops >= hop_limit)
}

/// Sends `message` to every peer outside `skip`.
///
/// Peers that predate the hop counter only receive messages without one.
/// Each send is independent; a full or closed queue only affects that peer.
/// Returns the number of peers the message was queued for.
pub(crate) fn fan_out(peers: &[Arc<Peer>], message: &Message, skip: &HashSet<PeerId>) -> usize {
    let mut sent = 0;
    for peer in peers {
        if skip.contains(&peer.id()) {
            continue;
        }
        if message.has_hops() && !peer.hops_aware() {
            continue;
        }
        if peer.send(message.clone()) {
            sent += 1;
        }
    }
    sent
}
