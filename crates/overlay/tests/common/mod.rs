//! Shared harness for overlay integration tests.
//!
//! Nodes talk over an in-memory network of `tokio::io::duplex` pipes. The
//! dialer's "TLS" step writes a random 32-byte channel binding in clear text,
//! which the accepting side reads back, so both ends agree on the binding the
//! same way exported keying material would.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ledgermesh_overlay::{
    ActivateResult, AllocatorConfig, BoxedStream, ChannelBinding, Dialer, Ed25519Handshake,
    HandshakeVerifier, NodePublicKey, OverlayConfig, OverlayError, PeerRegistry, SecureStream,
    SimpleSlotAllocator, Slot, SlotAllocator, SlotId, TcpConnected,
};
use parking_lot::Mutex;
use rand::RngCore;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

type Incoming = (DuplexStream, SocketAddr);

// ---------------------------------------------------------------------------
// In-memory network
// ---------------------------------------------------------------------------

/// Address book of listening endpoints.
#[derive(Default)]
pub struct MemoryNetwork {
    listeners: Mutex<HashMap<SocketAddr, mpsc::UnboundedSender<Incoming>>>,
    next_port: AtomicU16,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            listeners: Mutex::new(HashMap::new()),
            next_port: AtomicU16::new(40000),
        })
    }

    /// Starts accepting connections on `addr`.
    pub fn listen(&self, addr: SocketAddr) -> mpsc::UnboundedReceiver<Incoming> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().insert(addr, tx);
        rx
    }

    fn ephemeral(&self, ip: IpAddr) -> SocketAddr {
        SocketAddr::new(ip, self.next_port.fetch_add(1, Ordering::Relaxed))
    }

    /// Accepts connections on `addr` and never answers them.
    pub fn listen_silent(&self, addr: SocketAddr) {
        let mut rx = self.listen(addr);
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Some((stream, _)) = rx.recv().await {
                held.push(stream);
            }
        });
    }

    /// Accepts connections on `addr` and answers every request with `response`.
    pub fn listen_canned(&self, addr: SocketAddr, response: Vec<u8>) {
        let mut rx = self.listen(addr);
        tokio::spawn(async move {
            while let Some((mut stream, _)) = rx.recv().await {
                let response = response.clone();
                tokio::spawn(async move {
                    let mut binding = [0u8; 32];
                    if stream.read_exact(&mut binding).await.is_err() {
                        return;
                    }
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 1024];
                    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                        match stream.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => buf.extend_from_slice(&chunk[..n]),
                        }
                    }
                    let _ = stream.write_all(&response).await;
                    let _ = stream.shutdown().await;
                });
            }
        });
    }
}

/// Dials over a [`MemoryNetwork`] from a fixed IP.
pub struct MemoryDialer {
    net: Arc<MemoryNetwork>,
    ip: IpAddr,
}

#[async_trait]
impl Dialer for MemoryDialer {
    async fn dial(&self, remote: SocketAddr) -> ledgermesh_overlay::Result<TcpConnected> {
        let listener = self.net.listeners.lock().get(&remote).cloned();
        let Some(listener) = listener else {
            return Err(OverlayError::ConnectionFailed(format!(
                "{}: connection refused",
                remote
            )));
        };
        let (client, server) = tokio::io::duplex(256 * 1024);
        let local_addr = self.net.ephemeral(self.ip);
        listener
            .send((server, local_addr))
            .map_err(|_| OverlayError::ConnectionFailed(format!("{}: reset", remote)))?;
        Ok(TcpConnected {
            stream: Box::new(client),
            local_addr,
        })
    }

    async fn secure(
        &self,
        mut stream: BoxedStream,
        _remote: SocketAddr,
    ) -> ledgermesh_overlay::Result<SecureStream> {
        let mut binding = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut binding);
        stream.write_all(&binding).await?;
        Ok(SecureStream {
            stream,
            binding: ChannelBinding(binding),
        })
    }
}

// ---------------------------------------------------------------------------
// Allocator wrapper
// ---------------------------------------------------------------------------

/// [`SimpleSlotAllocator`] that counts releases per slot.
pub struct CountingAllocator {
    pub inner: SimpleSlotAllocator,
    closed: Mutex<HashMap<SlotId, usize>>,
    issued: Mutex<Vec<SlotId>>,
}

impl CountingAllocator {
    pub fn new(config: AllocatorConfig) -> Self {
        Self {
            inner: SimpleSlotAllocator::new(config),
            closed: Mutex::new(HashMap::new()),
            issued: Mutex::new(Vec::new()),
        }
    }

    pub fn issued(&self) -> usize {
        self.issued.lock().len()
    }

    pub fn total_closed(&self) -> usize {
        self.closed.lock().values().sum()
    }

    /// True if every issued slot was released exactly once.
    pub fn all_released_once(&self) -> bool {
        let closed = self.closed.lock();
        let issued = self.issued.lock();
        issued.iter().all(|id| closed.get(id) == Some(&1)) && closed.len() == issued.len()
    }

    fn record(&self, slot: Option<Arc<Slot>>) -> Option<Arc<Slot>> {
        if let Some(slot) = &slot {
            self.issued.lock().push(slot.id());
        }
        slot
    }
}

impl SlotAllocator for CountingAllocator {
    fn max_peers(&self) -> usize {
        self.inner.max_peers()
    }

    fn new_outbound_slot(&self, remote: SocketAddr) -> Option<Arc<Slot>> {
        self.record(self.inner.new_outbound_slot(remote))
    }

    fn new_inbound_slot(&self, local: SocketAddr, remote: SocketAddr) -> Option<Arc<Slot>> {
        self.record(self.inner.new_inbound_slot(local, remote))
    }

    fn on_connected(&self, slot: &Arc<Slot>, local: SocketAddr) -> bool {
        self.inner.on_connected(slot, local)
    }

    fn activate(&self, slot: &Arc<Slot>, key: &NodePublicKey, cluster: bool) -> ActivateResult {
        self.inner.activate(slot, key, cluster)
    }

    fn on_closed(&self, slot: &Arc<Slot>) {
        *self.closed.lock().entry(slot.id()).or_insert(0) += 1;
        self.inner.on_closed(slot);
    }

    fn on_redirects(&self, remote: SocketAddr, endpoints: Vec<SocketAddr>) {
        self.inner.on_redirects(remote, endpoints);
    }

    fn on_endpoints(&self, slot: &Arc<Slot>, endpoints: Vec<SocketAddr>) {
        self.inner.on_endpoints(slot, endpoints);
    }

    fn redirect(&self, slot: &Arc<Slot>) -> Vec<SocketAddr> {
        self.inner.redirect(slot)
    }

    fn autoconnect(&self) -> Vec<SocketAddr> {
        self.inner.autoconnect()
    }

    fn once_per_second(&self) {
        self.inner.once_per_second();
    }

    fn build_endpoints_for_peers(&self) -> Vec<(SlotId, Vec<SocketAddr>)> {
        self.inner.build_endpoints_for_peers()
    }
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

pub struct TestNode {
    pub addr: SocketAddr,
    pub registry: PeerRegistry,
    pub allocator: Arc<CountingAllocator>,
    pub public_key: NodePublicKey,
}

impl TestNode {
    /// A node listening on `addr` with default policy.
    pub fn new(net: &Arc<MemoryNetwork>, addr: &str) -> Self {
        Self::with_config(net, addr, OverlayConfig::default(), AllocatorConfig::default())
    }

    pub fn with_config(
        net: &Arc<MemoryNetwork>,
        addr: &str,
        mut overlay: OverlayConfig,
        mut allocator: AllocatorConfig,
    ) -> Self {
        let addr: SocketAddr = addr.parse().expect("valid test address");
        overlay.listening_port = Some(addr.port());
        allocator.listening_port = Some(addr.port());

        let identity = Ed25519Handshake::generate();
        let public_key = identity.public_key();
        let allocator = Arc::new(CountingAllocator::new(allocator));
        let registry = PeerRegistry::new(
            overlay,
            allocator.clone(),
            Arc::new(identity),
            Arc::new(MemoryDialer {
                net: net.clone(),
                ip: addr.ip(),
            }),
        );

        let mut incoming = net.listen(addr);
        let server = registry.clone();
        tokio::spawn(async move {
            while let Some((mut stream, remote)) = incoming.recv().await {
                let registry = server.clone();
                tokio::spawn(async move {
                    let mut binding = [0u8; 32];
                    if stream.read_exact(&mut binding).await.is_err() {
                        return;
                    }
                    let secure = SecureStream {
                        stream: Box::new(stream),
                        binding: ChannelBinding(binding),
                    };
                    let _ = registry.serve_inbound(secure, addr, remote).await;
                });
            }
        });

        Self {
            addr,
            registry,
            allocator,
            public_key,
        }
    }
}

/// Polls `condition` until it holds, panicking after five seconds.
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Connects `from` to `to` and waits until both sides list the peer.
pub async fn link(from: &TestNode, to: &TestNode) {
    let (from_before, to_before) = (from.registry.size(), to.registry.size());
    from.registry
        .connect(to.addr)
        .expect("outbound slot available");
    wait_until("link", || {
        from.registry.size() == from_before + 1 && to.registry.size() == to_before + 1
    })
    .await;
}

/// A canned HTTP response with a JSON body.
pub fn http_response(status: u16, reason: &str, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
        status,
        reason,
        body.len(),
        body
    )
    .into_bytes()
}
