//! Peer-to-peer overlay for ledgermesh.
//!
//! This crate owns the connection lifecycle of a ledger node's overlay: it
//! dials and authenticates outbound peers, accepts inbound upgrade requests,
//! keeps the registry of active peers, and floods protocol messages across the
//! mesh with duplicate suppression and hop bounding. It provides:
//!
//! - **Outbound connection attempts** - A per-connection state machine that
//!   dials, negotiates TLS, exchanges a hello over an HTTP upgrade, and
//!   promotes the connection into an active peer
//! - **Inbound handoff** - The symmetric path for connections accepted by the
//!   listener, answered with either a `101` upgrade or a `503` redirect
//! - **Peer registry** - Slot and id indexes of active peers, scored peer
//!   selection, crawl snapshots, a one-second maintenance timer and
//!   coordinated shutdown of every attempt, peer and timer
//! - **Message relay** - Suppression-table based fan-out that never re-sends
//!   a message to a peer that already has it
//!
//! # Architecture
//!
//! - [`PeerRegistry`] - Central owner of active peers and tracked tasks
//! - [`ConnectionAttempt`] - One outbound dial through promotion
//! - [`Peer`] - An authenticated, active connection and its I/O task
//! - [`SuppressionTable`] - Per-message record of peers that already have it
//! - [`SlotAllocator`] - Admission policy collaborator; [`SimpleSlotAllocator`]
//!   is the built-in implementation
//! - [`HandshakeVerifier`] - Hello signing and verification collaborator;
//!   [`Ed25519Handshake`] is the built-in implementation
//! - [`Dialer`] - Transport collaborator; [`TlsDialer`] is the built-in
//!   implementation
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ledgermesh_overlay::{
//!     AllocatorConfig, Ed25519Handshake, OverlayConfig, PeerRegistry, SimpleSlotAllocator,
//!     TlsDialer,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let allocator = Arc::new(SimpleSlotAllocator::new(AllocatorConfig::default()));
//! let verifier = Arc::new(Ed25519Handshake::generate());
//! let dialer = Arc::new(TlsDialer::new()?);
//!
//! let registry = PeerRegistry::new(OverlayConfig::default(), allocator, verifier, dialer);
//! registry.start();
//! registry.connect("203.0.113.7:51235".parse()?);
//!
//! let mut rx = registry.subscribe();
//! while let Ok(msg) = rx.recv().await {
//!     println!("{} from {}", msg.message.kind, msg.from_peer);
//! }
//! registry.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod allocator;
mod attempt;
mod error;
mod handoff;
mod hello;
mod http;
mod message;
mod metrics;
mod peer;
mod registry;
mod relay;
mod slot;
mod transport;

#[cfg(test)]
mod testutil;

pub use allocator::{AllocatorConfig, SimpleSlotAllocator};
pub use attempt::{AttemptHandle, AttemptState, ConnectionAttempt};
pub use error::OverlayError;
pub use handoff::Handoff;
pub use hello::{ChannelBinding, Ed25519Handshake, HandshakeVerifier, HelloPayload};
pub use http::{Headers, HttpRequest, HttpResponse, RequestDecoder, ResponseDecoder};
pub use message::{Message, MessageCodec, MessageId, MessageKind};
pub use metrics::{Counter, OverlayMetrics, OverlayMetricsSnapshot, Timer};
pub use peer::{Peer, PeerStats, PeerStatsSnapshot, Sanity};
pub use registry::{OverlayMessage, OverlayStats, PeerRegistry};
pub use relay::{SuppressionStats, SuppressionTable};
pub use slot::{ActivateResult, Slot, SlotAllocator, SlotGuard, SlotId, SlotState};
pub use transport::{
    BoxedStream, Dialer, PeerStream, SecureStream, TcpConnected, TlsAcceptor, TlsDialer,
};

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine};

/// Result type for overlay operations.
pub type Result<T> = std::result::Result<T, OverlayError>;

/// Default user agent advertised in upgrade requests and responses.
pub const USER_AGENT: &str = concat!("ledgermesh-", env!("CARGO_PKG_VERSION"));

/// Deadline applied to every step of the connection handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Configuration for the overlay core.
///
/// Admission policy (peer counts, per-IP limits, bootstrap addresses) lives
/// in [`AllocatorConfig`]; this struct covers what the registry, attempts and
/// peers need.
#[derive(Debug, Clone)]
pub struct OverlayConfig {
    /// Whether originated messages carry a hop counter.
    ///
    /// When set, [`PeerRegistry::send`] resets the counter to zero before
    /// fan-out so receivers can bound how far the message travels.
    pub expire: bool,

    /// Hop bound used when relaying received messages.
    pub max_hops: u32,

    /// Whether this node asks peers not to expose its address in crawls.
    pub peer_private: bool,

    /// Port advertised in our hello, if we accept inbound peers.
    pub listening_port: Option<u16>,

    /// Per-step deadline for the connection handshake.
    pub handshake_timeout: Duration,

    /// Interval of the maintenance timer.
    pub tick_interval: Duration,

    /// Every this many ticks the maintenance timer runs a peer check sweep.
    pub check_ticks: u64,

    /// Peers with no inbound traffic for this long are closed by the check sweep.
    pub peer_idle_timeout: Duration,

    /// Value of the `User-Agent` / `Server` header.
    pub user_agent: String,

    /// Public keys of nodes in our cluster.
    ///
    /// Cluster members bypass slot capacity and do not increment hop
    /// counters on relayed messages.
    pub cluster_nodes: HashSet<NodePublicKey>,

    /// Capacity of each peer's outbound queue.
    pub peer_queue_size: usize,

    /// Capacity of the received-message broadcast channel.
    pub message_channel_size: usize,

    /// How long suppression records are kept.
    pub suppression_ttl: Duration,

    /// Suppression table size that forces an early cleanup.
    pub suppression_max_entries: usize,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            expire: false,
            max_hops: 2,
            peer_private: false,
            listening_port: Some(51235),
            handshake_timeout: HANDSHAKE_TIMEOUT,
            tick_interval: Duration::from_secs(1),
            check_ticks: 10,
            peer_idle_timeout: Duration::from_secs(60),
            user_agent: USER_AGENT.to_string(),
            cluster_nodes: HashSet::new(),
            peer_queue_size: 256,
            message_channel_size: 4096,
            suppression_ttl: Duration::from_secs(300),
            suppression_max_entries: 100_000,
        }
    }
}

/// Process-unique numeric identifier of an attempt or peer.
///
/// Assigned from a registry-owned counter. Displayed as a fixed-width log
/// prefix such as `[007]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(pub u32);

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:03}]", self.0)
    }
}

/// A node's Ed25519 public key, as verified from its hello.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodePublicKey(pub [u8; 32]);

impl NodePublicKey {
    /// Returns the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Returns the standard base64 encoding used on the wire and in crawl output.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    /// Parses a base64-encoded 32-byte key.
    pub fn from_base64(s: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(s.trim())
            .map_err(|e| OverlayError::BadHello(format!("invalid public key encoding: {}", e)))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| OverlayError::BadHello("public key must be 32 bytes".to_string()))?;
        Ok(Self(key))
    }
}

impl std::fmt::Display for NodePublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

impl std::fmt::Debug for NodePublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodePublicKey({})", hex::encode(&self.0[..8]))
    }
}

/// Overlay protocol version, carried in the `Upgrade` header as `RTXP/<major>.<minor>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtocolVersion {
    /// The version this node speaks.
    pub const CURRENT: ProtocolVersion = ProtocolVersion { major: 1, minor: 2 };

    /// Oldest version we still accept.
    pub const MINIMUM: ProtocolVersion = ProtocolVersion { major: 1, minor: 1 };

    /// First version whose peers understand the hop counter.
    pub const HOPS_AWARE: ProtocolVersion = ProtocolVersion { major: 1, minor: 2 };

    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    /// Parses a single `RTXP/<major>.<minor>` token.
    pub fn parse(s: &str) -> Option<Self> {
        let rest = s.trim().strip_prefix("RTXP/")?;
        let (major, minor) = rest.split_once('.')?;
        Some(Self {
            major: major.parse().ok()?,
            minor: minor.parse().ok()?,
        })
    }

    /// Picks the highest supported version from a comma-separated `Upgrade` value.
    pub fn negotiate(upgrade: &str) -> Option<Self> {
        upgrade
            .split(',')
            .filter_map(Self::parse)
            .filter(|v| v.is_supported())
            .max()
    }

    pub fn is_supported(&self) -> bool {
        *self >= Self::MINIMUM && *self <= Self::CURRENT
    }

    pub fn hops_aware(&self) -> bool {
        *self >= Self::HOPS_AWARE
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RTXP/{}.{}", self.major, self.minor)
    }
}

/// Which side initiated a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// The remote connected to us.
    Inbound,
    /// We connected to the remote.
    Outbound,
}

impl Direction {
    /// Returns true if we initiated this connection.
    pub fn we_called_remote(&self) -> bool {
        matches!(self, Direction::Outbound)
    }
}

/// Address of a peer as written in configuration.
///
/// The host can be either an IP address or a hostname; hostnames are
/// resolved at startup with [`PeerAddress::resolve`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerAddress {
    /// IP address or hostname of the peer.
    pub host: String,
    /// TCP port number.
    pub port: u16,
}

impl PeerAddress {
    /// Creates a new peer address from a host and port.
    ///
    /// # Example
    ///
    /// ```rust
    /// use ledgermesh_overlay::PeerAddress;
    ///
    /// let addr = PeerAddress::new("peers.example.net", 51235);
    /// assert_eq!(addr.to_string(), "peers.example.net:51235");
    /// ```
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parses `host port`, `host:port` or `[v6]:port`.
    ///
    /// A missing or zero port is rejected.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let invalid = || OverlayError::InvalidPeerAddress(s.to_string());

        if let Ok(addr) = s.parse::<SocketAddr>() {
            if addr.port() == 0 {
                return Err(invalid());
            }
            return Ok(Self::new(addr.ip().to_string(), addr.port()));
        }

        let (host, port) = match s.split_once(char::is_whitespace) {
            Some((host, port)) => (host, port.trim()),
            None => s.rsplit_once(':').ok_or_else(invalid)?,
        };
        let port: u16 = port.parse().map_err(|_| invalid())?;
        if host.is_empty() || port == 0 {
            return Err(invalid());
        }
        Ok(Self::new(host, port))
    }

    /// Resolves the host to socket addresses.
    pub async fn resolve(&self) -> Result<Vec<SocketAddr>> {
        let addrs = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| OverlayError::InvalidPeerAddress(format!("{}: {}", self, e)))?;
        Ok(addrs.collect())
    }

    /// Returns true if this address is a private/local network address.
    pub fn is_private(&self) -> bool {
        match self.host.parse::<std::net::IpAddr>() {
            Ok(ip) => is_private_ip(&ip),
            Err(_) => self.host == "localhost",
        }
    }
}

impl std::fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Returns true for loopback, RFC 1918, link-local and unique-local addresses.
///
/// These addresses are not routable on the public internet and are never
/// accepted as a configured public IP.
pub fn is_private_ip(ip: &std::net::IpAddr) -> bool {
    match ip {
        std::net::IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        std::net::IpAddr::V6(v6) => {
            v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00
        }
    }
}
