//! Inbound handoff.
//!
//! The listener owns accepted sockets until they present an HTTP request.
//! [`PeerRegistry::accept_inbound`] decides what happens next: answer it,
//! give it back, or take the connection over as a peer. Taking over means
//! inserting the new peer and spawning its I/O task under the registry lock,
//! so a concurrent `stop()` either sees the peer or prevents it.

use std::net::SocketAddr;

use bytes::BytesMut;
use serde::Serialize;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::codec::{Decoder, Framed, FramedParts};
use tracing::{debug, info, trace, warn};

use crate::hello::{ChannelBinding, HelloPayload};
use crate::http::{HttpRequest, HttpResponse, RequestDecoder};
use crate::message::MessageCodec;
use crate::peer::{Peer, PeerInit};
use crate::registry::PeerRegistry;
use crate::slot::{ActivateResult, Slot, SlotGuard};
use crate::transport::{BoxedStream, SecureStream};
use crate::{Message, NodePublicKey, OverlayError, ProtocolVersion, Result};

/// Outcome of [`PeerRegistry::accept_inbound`].
pub enum Handoff {
    /// The connection became a peer and is no longer the caller's.
    Moved,
    /// Write `response` to `stream`, then close it.
    Respond {
        stream: BoxedStream,
        response: HttpResponse,
    },
    /// Not an overlay request; the caller may serve it some other way.
    NotHandled(BoxedStream),
    /// The connection was refused without a response.
    Closed,
}

impl std::fmt::Debug for Handoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Handoff::Moved => write!(f, "Moved"),
            Handoff::Respond { response, .. } => {
                write!(f, "Respond({} {})", response.status, response.reason)
            }
            Handoff::NotHandled(_) => write!(f, "NotHandled"),
            Handoff::Closed => write!(f, "Closed"),
        }
    }
}

#[derive(Serialize)]
struct RedirectBody {
    #[serde(rename = "peer-ips")]
    peer_ips: Vec<String>,
}

impl PeerRegistry {
    /// Handles an upgrade request that arrived on an inbound connection.
    ///
    /// `buffered` holds any bytes read past the end of the request.
    pub fn accept_inbound(
        &self,
        request: HttpRequest,
        secure: SecureStream,
        buffered: BytesMut,
        local: SocketAddr,
        remote: SocketAddr,
    ) -> Handoff {
        let SecureStream { stream, binding } = secure;

        if request.path == "/crawl" {
            let body = json!({ "overlay": self.crawl() });
            return respond(stream, HttpResponse::json(200, "OK", &body));
        }

        if !request.is_peer_upgrade() {
            trace!("Not a peer upgrade from {}: {} {}", remote, request.method, request.path);
            return Handoff::NotHandled(stream);
        }

        if self.is_stopping() {
            debug!("Refusing {} while stopping", remote);
            return respond(
                stream,
                Ok(HttpResponse::new(503, "Service Unavailable")),
            );
        }

        let Some(slot) = self.allocator().new_inbound_slot(local, remote) else {
            debug!("No inbound slot for {}", remote);
            return Handoff::Closed;
        };
        let guard = SlotGuard::new(slot, self.allocator().clone());

        if !request.connects_as_peer() {
            debug!("{} does not connect as peer", remote);
            return self.redirect(stream, guard.slot(), remote);
        }

        let (hello, public_key, protocol) = match self.verify_inbound(&request, &binding) {
            Ok(verified) => verified,
            Err(e) => {
                info!("Bad hello from {}: {}", remote, e);
                return respond(stream, Ok(HttpResponse::new(400, "Bad Request")));
            }
        };

        let cluster = self.config().cluster_nodes.contains(&public_key);
        let slot = guard.slot().clone();
        if let Some(port) = hello.listening_port {
            slot.set_listening_port(port);
        }
        match self.allocator().activate(&slot, &public_key, cluster) {
            ActivateResult::Success => {}
            result => {
                debug!("Activation of {} refused: {:?}", remote, result);
                return self.redirect(stream, &slot, remote);
            }
        }

        let response = match self.upgrade_response(protocol, &binding) {
            Ok(response) => response,
            Err(e) => {
                warn!("Failed to build upgrade response for {}: {}", remote, e);
                return respond(stream, Ok(HttpResponse::new(500, "Internal Server Error")));
            }
        };

        let (peer, outbound_rx) = Peer::new(
            PeerInit {
                id: self.next_peer_id(),
                slot,
                public_key,
                protocol,
                version: request.headers.get("User-Agent").map(str::to_string),
                cluster,
                crawl: !hello.private,
            },
            self.config().peer_queue_size,
        );

        let mut parts = FramedParts::new::<Message>(stream, MessageCodec::new());
        parts.read_buf = buffered;
        parts.write_buf = response.encode();
        let framed = Framed::from_parts(parts);

        if self.promote(peer, framed, outbound_rx, guard) {
            Handoff::Moved
        } else {
            Handoff::Closed
        }
    }

    fn verify_inbound(
        &self,
        request: &HttpRequest,
        binding: &ChannelBinding,
    ) -> Result<(HelloPayload, NodePublicKey, ProtocolVersion)> {
        let protocol = request
            .headers
            .get("Upgrade")
            .and_then(ProtocolVersion::negotiate)
            .ok_or_else(|| OverlayError::VersionMismatch("no supported protocol".to_string()))?;
        let hello = HelloPayload::from_headers(&request.headers)?;
        let key = self.verifier().verify_hello(&hello, binding)?;
        Ok((hello, key, protocol))
    }

    fn upgrade_response(
        &self,
        protocol: ProtocolVersion,
        binding: &ChannelBinding,
    ) -> Result<HttpResponse> {
        let config = self.config();
        let mut response = HttpResponse::new(101, "Switching Protocols");
        response.headers.insert("Connection", "Upgrade");
        response.headers.insert("Upgrade", protocol.to_string());
        response.headers.insert("Server", config.user_agent.clone());
        self.local_hello(binding)?.append_headers(&mut response.headers);
        Ok(response)
    }

    /// Answers 503 with alternate addresses. The slot is released when the
    /// caller drops its guard.
    fn redirect(
        &self,
        stream: BoxedStream,
        slot: &std::sync::Arc<Slot>,
        remote: SocketAddr,
    ) -> Handoff {
        let peer_ips: Vec<String> = self
            .allocator()
            .redirect(slot)
            .iter()
            .map(SocketAddr::to_string)
            .collect();
        debug!("Redirecting {} with {} addresses", remote, peer_ips.len());
        self.metrics().inbound_redirected.inc();

        let response = HttpResponse::json(503, "Service Unavailable", &RedirectBody { peer_ips })
            .map(|mut response| {
                response
                    .headers
                    .insert("Remote-Address", remote.ip().to_string());
                response
            });
        respond(stream, response)
    }

    /// Reads one request from an accepted, TLS-secured connection and hands
    /// it to [`accept_inbound`](Self::accept_inbound), writing whatever
    /// response comes back. Non-overlay requests get `404 Not Found`.
    pub async fn serve_inbound(
        &self,
        secure: SecureStream,
        local: SocketAddr,
        remote: SocketAddr,
    ) -> Result<()> {
        let SecureStream { mut stream, binding } = secure;
        let deadline = self.config().handshake_timeout;

        let mut buf = BytesMut::with_capacity(4096);
        let mut decoder = RequestDecoder;
        let request = tokio::time::timeout(deadline, async {
            loop {
                if let Some(request) = decoder.decode(&mut buf)? {
                    return Ok(request);
                }
                if stream.read_buf(&mut buf).await? == 0 {
                    return Err(OverlayError::PeerDisconnected(
                        "closed before sending a request".to_string(),
                    ));
                }
            }
        })
        .await
        .map_err(|_| OverlayError::ConnectionTimeout("read request".to_string()))??;

        let secure = SecureStream { stream, binding };
        match self.accept_inbound(request, secure, buf, local, remote) {
            Handoff::Moved | Handoff::Closed => Ok(()),
            Handoff::Respond { stream, response } => {
                write_response(stream, &response, deadline).await
            }
            Handoff::NotHandled(stream) => {
                write_response(stream, &HttpResponse::new(404, "Not Found"), deadline).await
            }
        }
    }
}

fn respond(stream: BoxedStream, response: Result<HttpResponse>) -> Handoff {
    let response = response.unwrap_or_else(|e| {
        warn!("Failed to encode response: {}", e);
        HttpResponse::new(500, "Internal Server Error")
    });
    Handoff::Respond { stream, response }
}

async fn write_response(
    mut stream: BoxedStream,
    response: &HttpResponse,
    deadline: std::time::Duration,
) -> Result<()> {
    tokio::time::timeout(deadline, async {
        stream.write_all(&response.encode()).await?;
        stream.flush().await?;
        let _ = stream.shutdown().await;
        Ok::<_, OverlayError>(())
    })
    .await
    .map_err(|_| OverlayError::ConnectionTimeout("write response".to_string()))?
}
