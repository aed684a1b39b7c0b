//! Outbound connection attempts.
//!
//! A [`ConnectionAttempt`] takes one reserved outbound slot from dial to
//! promotion. It runs as a single task that suspends at each I/O step:
//!
//! ```text
//! Dialing -> TlsHandshaking -> SendingHello -> AwaitingResponse -> ProcessingResponse
//!                                                    |                    |
//!                                                    v                    v
//!                                              ShuttingDown          (promoted)
//!                                                    |
//!                                                    v
//!                                                 Closed
//! ```
//!
//! Every step runs under its own deadline ([`OverlayConfig::handshake_timeout`],
//! 15 seconds by default). The deadline restarts for each partial write and
//! each read, so a slow but progressing remote is not cut off. A missed
//! deadline fails the attempt with a timeout; cancellation (registry
//! shutdown or [`AttemptHandle::cancel`]) aborts whichever step is pending.
//!
//! The attempt owns its [`SlotGuard`]. On promotion the guard moves into the
//! new peer's task; on every other exit it is dropped when the attempt ends,
//! releasing the slot exactly once.
//!
//! [`OverlayConfig::handshake_timeout`]: crate::OverlayConfig::handshake_timeout

use std::future::Future;
use std::net::SocketAddr;

use bytes::BytesMut;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, Framed, FramedParts};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::hello::{ChannelBinding, HelloPayload};
use crate::http::{HttpRequest, HttpResponse, ResponseDecoder};
use crate::message::MessageCodec;
use crate::peer::{Peer, PeerInit};
use crate::registry::{ChildGuard, PeerRegistry};
use crate::slot::{ActivateResult, SlotGuard};
use crate::transport::BoxedStream;
use crate::{OverlayError, PeerId, ProtocolVersion, Result};

/// Step of an outbound connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Dialing,
    TlsHandshaking,
    SendingHello,
    AwaitingResponse,
    ProcessingResponse,
    /// The remote closed during the handshake; closing our side.
    ShuttingDown,
    /// Terminal. The attempt was promoted, failed, or was cancelled.
    Closed,
}

/// How a handshake that did not fail ended.
enum Outcome {
    /// Handed over to the registry as an active peer.
    Promoted,
    /// The remote answered without upgrading, or closed the connection.
    Closed,
}

/// One outbound connection from dial through promotion.
pub struct ConnectionAttempt {
    id: PeerId,
    remote: SocketAddr,
    slot: Option<SlotGuard>,
    registry: PeerRegistry,
    cancel: CancellationToken,
    state: watch::Sender<AttemptState>,
    started: std::time::Instant,
}

impl ConnectionAttempt {
    pub(crate) fn new(
        id: PeerId,
        remote: SocketAddr,
        slot: SlotGuard,
        registry: PeerRegistry,
        cancel: CancellationToken,
    ) -> Self {
        debug!("{} Connect {}", id, remote);
        Self {
            id,
            remote,
            slot: Some(slot),
            registry,
            cancel,
            state: watch::Sender::new(AttemptState::Dialing),
            started: std::time::Instant::now(),
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn state(&self) -> AttemptState {
        *self.state.borrow()
    }

    /// Spawns the attempt. `child` deregisters it from the registry when the
    /// task ends, after the slot has been released.
    pub(crate) fn start(self, child: ChildGuard) -> AttemptHandle {
        let handle = AttemptHandle {
            id: self.id,
            remote: self.remote,
            cancel: self.cancel.clone(),
            state: self.state.subscribe(),
            join: None,
        };
        let join = tokio::spawn(async move {
            self.run().await;
            drop(child);
        });
        AttemptHandle {
            join: Some(join),
            ..handle
        }
    }

    async fn run(mut self) {
        let cancel = self.cancel.clone();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(OverlayError::Cancelled),
            result = self.handshake() => result,
        };

        let metrics = self.registry.metrics().clone();
        match result {
            Ok(Outcome::Promoted) => {
                metrics.handshake_latency.record_since(self.started);
            }
            Ok(Outcome::Closed) => {}
            Err(OverlayError::Cancelled) => debug!("{} Stop", self.id),
            Err(OverlayError::ConnectionTimeout(step)) => {
                metrics.attempts_timed_out.inc();
                debug!("{} Timeout during {}", self.id, step);
            }
            Err(e) => {
                metrics.attempts_failed.inc();
                debug!("{} {}", self.id, e);
            }
        }

        self.set_state(AttemptState::Closed);
        // Releases the slot unless it moved into a peer.
        self.slot.take();
        trace!("{} Attempt finished", self.id);
    }

    fn set_state(&self, state: AttemptState) {
        trace!("{} {:?}", self.id, state);
        self.state.send_replace(state);
    }

    /// Runs `fut` under the per-step deadline.
    async fn step<T>(&self, name: &'static str, fut: impl Future<Output = T>) -> Result<T> {
        tokio::time::timeout(self.registry.config().handshake_timeout, fut)
            .await
            .map_err(|_| OverlayError::ConnectionTimeout(name.to_string()))
    }

    fn slot_guard(&self) -> Result<&SlotGuard> {
        self.slot
            .as_ref()
            .ok_or_else(|| OverlayError::Internal("slot already released".to_string()))
    }

    async fn handshake(&mut self) -> Result<Outcome> {
        let remote = self.remote;

        self.set_state(AttemptState::Dialing);
        let dialer = self.registry.dialer().clone();
        let connected = self.step("connect", dialer.dial(remote)).await??;
        trace!("{} Connected from {}", self.id, connected.local_addr);

        self.set_state(AttemptState::TlsHandshaking);
        let secure = self
            .step("TLS handshake", dialer.secure(connected.stream, remote))
            .await??;
        {
            let guard = self.slot_guard()?;
            if !guard
                .allocator()
                .on_connected(guard.slot(), connected.local_addr)
            {
                return Err(OverlayError::DuplicateConnection);
            }
        }

        self.set_state(AttemptState::SendingHello);
        let mut stream = secure.stream;
        let request = self.build_request(&secure.binding)?;
        self.write_request(&mut stream, &request).await?;

        self.set_state(AttemptState::AwaitingResponse);
        let mut buf = BytesMut::with_capacity(4096);
        let Some(response) = self.read_response(&mut stream, &mut buf).await? else {
            info!("{} EOF", self.id);
            self.set_state(AttemptState::ShuttingDown);
            let _ = self.step("shutdown", stream.shutdown()).await;
            return Ok(Outcome::Closed);
        };

        self.set_state(AttemptState::ProcessingResponse);
        self.process_response(response, stream, buf, &secure.binding)
    }

    fn build_request(&self, binding: &ChannelBinding) -> Result<HttpRequest> {
        let config = self.registry.config();
        let mut request = HttpRequest::get("/");
        request.headers.insert("User-Agent", config.user_agent.clone());
        request
            .headers
            .insert("Upgrade", ProtocolVersion::CURRENT.to_string());
        request.headers.insert("Connection", "Upgrade");
        request.headers.insert("Connect-As", "Peer");

        let hello = self.registry.local_hello(binding)?;
        hello.append_headers(&mut request.headers);
        Ok(request)
    }

    async fn write_request(&self, stream: &mut BoxedStream, request: &HttpRequest) -> Result<()> {
        let buf = request.encode();
        let mut written = 0;
        while written < buf.len() {
            let n = self.step("write", stream.write(&buf[written..])).await??;
            if n == 0 {
                return Err(OverlayError::PeerDisconnected(
                    "write returned zero bytes".to_string(),
                ));
            }
            trace!("{} Wrote {} bytes", self.id, n);
            written += n;
        }
        self.step("write", stream.flush()).await??;
        Ok(())
    }

    /// Reads until a full response is parsed. `None` means the remote closed first.
    async fn read_response(
        &self,
        stream: &mut BoxedStream,
        buf: &mut BytesMut,
    ) -> Result<Option<HttpResponse>> {
        let mut decoder = ResponseDecoder::new();
        loop {
            if let Some(response) = decoder.decode(buf)? {
                return Ok(Some(response));
            }
            let n = self.step("read", stream.read_buf(buf)).await??;
            if n == 0 {
                return Ok(None);
            }
            trace!("{} Read {} bytes", self.id, n);
        }
    }

    fn process_response(
        &mut self,
        response: HttpResponse,
        stream: BoxedStream,
        leftover: BytesMut,
        binding: &ChannelBinding,
    ) -> Result<Outcome> {
        if response.status == 503 {
            let redirects = parse_redirects(&response.body);
            debug!(
                "{} Redirected by {} with {} addresses",
                self.id,
                self.remote,
                redirects.len()
            );
            let guard = self.slot_guard()?;
            guard.allocator().on_redirects(self.remote, redirects);
            return Ok(Outcome::Closed);
        }

        if !response.is_peer_upgrade() {
            info!(
                "{} HTTP Response: {} {}",
                self.id, response.status, response.reason
            );
            return Ok(Outcome::Closed);
        }

        let protocol = response
            .headers
            .get("Upgrade")
            .and_then(ProtocolVersion::negotiate)
            .ok_or_else(|| OverlayError::VersionMismatch("no supported protocol".to_string()))?;

        let hello = HelloPayload::from_headers(&response.headers)
            .and_then(|hello| {
                self.registry
                    .verifier()
                    .verify_hello(&hello, binding)
                    .map(|key| (hello, key))
            })
            .map_err(|e| match e {
                OverlayError::BadHello(_) => e,
                other => OverlayError::BadHello(other.to_string()),
            })?;
        let (hello, public_key) = hello;

        let config = self.registry.config();
        let cluster = config.cluster_nodes.contains(&public_key);
        let slot = self.slot_guard()?.slot().clone();
        if let Some(port) = hello.listening_port {
            slot.set_listening_port(port);
        }
        match self
            .slot_guard()?
            .allocator()
            .activate(&slot, &public_key, cluster)
        {
            ActivateResult::Success => {}
            ActivateResult::Duplicate => return Err(OverlayError::DuplicateConnection),
            ActivateResult::Full => {
                debug!("{} Outbound slots full", self.id);
                return Err(OverlayError::SlotsFull);
            }
        }

        let (peer, outbound_rx) = Peer::new(
            PeerInit {
                id: self.id,
                slot,
                public_key,
                protocol,
                version: response.headers.get("Server").map(str::to_string),
                cluster,
                crawl: !hello.private,
            },
            config.peer_queue_size,
        );

        let mut parts = FramedParts::new::<crate::Message>(stream, MessageCodec::new());
        parts.read_buf = leftover;
        let framed = Framed::from_parts(parts);

        let Some(guard) = self.slot.take() else {
            return Err(OverlayError::Internal("slot already released".to_string()));
        };
        if self.registry.promote(peer, framed, outbound_rx, guard) {
            Ok(Outcome::Promoted)
        } else {
            Err(OverlayError::ShuttingDown)
        }
    }
}

impl std::fmt::Debug for ConnectionAttempt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionAttempt")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("state", &self.state())
            .finish()
    }
}

#[derive(Deserialize)]
struct RedirectBody {
    #[serde(rename = "peer-ips", default)]
    peer_ips: Vec<String>,
}

/// Extracts redirect addresses from a `503` body, skipping malformed entries.
fn parse_redirects(body: &[u8]) -> Vec<SocketAddr> {
    match serde_json::from_slice::<RedirectBody>(body) {
        Ok(body) => body
            .peer_ips
            .iter()
            .filter_map(|s| s.parse::<SocketAddr>().ok())
            .filter(|addr| addr.port() != 0)
            .collect(),
        Err(e) => {
            trace!("Unparseable redirect body: {}", e);
            Vec::new()
        }
    }
}

/// Handle to a running [`ConnectionAttempt`].
pub struct AttemptHandle {
    id: PeerId,
    remote: SocketAddr,
    cancel: CancellationToken,
    state: watch::Receiver<AttemptState>,
    join: Option<JoinHandle<()>>,
}

impl AttemptHandle {
    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Current step of the attempt.
    pub fn state(&self) -> AttemptState {
        *self.state.borrow()
    }

    /// Aborts the attempt. Has no effect once it has finished.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the attempt task to end, slot released and deregistered.
    pub async fn finished(mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map(|j| j.is_finished()).unwrap_or(true)
    }
}

impl std::fmt::Debug for AttemptHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttemptHandle")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("state", &self.state())
            .finish()
    }
}
