//! Node runner and peer-facing client commands.
//!
//! [`run_node`] wires the overlay core to real sockets: it binds the peer
//! listener, completes TLS on every accepted connection and hands it to
//! [`PeerRegistry::serve_inbound`], relays received protocol messages, and
//! drives the maintenance timer until the process is asked to stop.
//!
//! # Shutdown
//!
//! On Ctrl-C the listener stops accepting, then the registry cancels every
//! attempt, peer and timer and waits for all of them to finish before the
//! runner returns.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::StreamExt;
use ledgermesh_overlay::{
    Dialer, HttpRequest, MessageKind, PeerRegistry, ResponseDecoder, SimpleSlotAllocator,
    TlsAcceptor, TlsDialer,
};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AppConfig;

/// Options for the run command.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Disable automatic dialing and fixed peers.
    pub standalone: bool,
}

/// Message kinds forwarded to other peers after receipt.
const RELAYED_KINDS: &[MessageKind] = &[
    MessageKind::PROPOSAL,
    MessageKind::VALIDATION,
    MessageKind::TRANSACTION,
];

/// A running overlay node.
pub struct Node {
    registry: PeerRegistry,
    local_addr: Option<SocketAddr>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Builds the overlay from `config`, binds the listener and starts the
    /// maintenance timer.
    pub async fn start(config: &AppConfig, options: RunOptions) -> anyhow::Result<Self> {
        config.validate()?;

        let identity = config.identity()?;
        let overlay = config.overlay_config()?;
        let allocator = config.allocator_config(options.standalone).await?;
        let want_incoming = allocator.want_incoming;

        let registry = PeerRegistry::new(
            overlay,
            Arc::new(SimpleSlotAllocator::new(allocator)),
            Arc::new(identity),
            Arc::new(TlsDialer::new()?),
        );
        info!(
            "Node {} starting with key {}",
            config.node.name,
            registry.public_key()
        );

        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();
        let mut local_addr = None;

        if want_incoming {
            let acceptor = load_acceptor(config)?;
            let ip: IpAddr = config.overlay.listen_address.parse()?;
            let listener = TcpListener::bind(SocketAddr::new(ip, config.overlay.port))
                .await
                .with_context(|| format!("binding peer port {}", config.overlay.port))?;
            let addr = listener.local_addr()?;
            info!("Listening for peers on {}", addr);
            local_addr = Some(addr);
            tasks.push(tokio::spawn(accept_loop(
                listener,
                acceptor,
                registry.clone(),
                cancel.clone(),
            )));
        } else {
            info!("Inbound connections disabled");
        }

        tasks.push(tokio::spawn(relay_loop(
            registry.clone(),
            registry.subscribe(),
            cancel.clone(),
        )));

        registry.start();

        Ok(Self {
            registry,
            local_addr,
            cancel,
            tasks,
        })
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    /// Address the peer listener is bound to, if it runs.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Stops accepting, then shuts the overlay down and waits for it.
    pub async fn shutdown(self) {
        info!("Shutting down overlay");
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Node task failed: {}", e);
            }
        }
        self.registry.shutdown().await;
        info!("Overlay stopped");
    }
}

/// Runs a node until Ctrl-C.
pub async fn run_node(config: AppConfig, options: RunOptions) -> anyhow::Result<()> {
    let node = Node::start(&config, options).await?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Received shutdown signal");

    node.shutdown().await;
    Ok(())
}

fn load_acceptor(config: &AppConfig) -> anyhow::Result<TlsAcceptor> {
    match (&config.node.tls_cert, &config.node.tls_key) {
        (Some(cert), Some(key)) => {
            let cert_pem = std::fs::read(cert)
                .with_context(|| format!("reading TLS certificate {}", cert.display()))?;
            let key_pem = std::fs::read(key)
                .with_context(|| format!("reading TLS key {}", key.display()))?;
            Ok(TlsAcceptor::from_pem(&cert_pem, &key_pem)?)
        }
        _ => {
            debug!("Generating self-signed peer certificate");
            Ok(TlsAcceptor::self_signed(&config.node.name)?)
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    registry: PeerRegistry,
    cancel: CancellationToken,
) {
    let handshake_timeout = registry.config().handshake_timeout;
    loop {
        let (stream, remote) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    continue;
                }
            },
        };

        let acceptor = acceptor.clone();
        let registry = registry.clone();
        tokio::spawn(async move {
            let local = match stream.local_addr() {
                Ok(local) => local,
                Err(e) => {
                    debug!("Dropping {}: {}", remote, e);
                    return;
                }
            };
            let _ = stream.set_nodelay(true);
            let handshake = tokio::time::timeout(handshake_timeout, acceptor.accept(stream));
            let secure = match handshake.await {
                Ok(Ok(secure)) => secure,
                Ok(Err(e)) => {
                    debug!("TLS handshake with {} failed: {}", remote, e);
                    return;
                }
                Err(_) => {
                    debug!("TLS handshake with {} timed out", remote);
                    return;
                }
            };
            if let Err(e) = registry.serve_inbound(secure, local, remote).await {
                debug!("Inbound connection from {} ended: {}", remote, e);
            }
        });
    }
    debug!("Accept loop stopped");
}

async fn relay_loop(
    registry: PeerRegistry,
    mut messages: broadcast::Receiver<ledgermesh_overlay::OverlayMessage>,
    cancel: CancellationToken,
) {
    let max_hops = registry.config().max_hops;
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = messages.recv() => received,
        };
        match received {
            Ok(received) => {
                if !RELAYED_KINDS.contains(&received.message.kind) {
                    continue;
                }
                let id = received.message.id();
                let sent = registry.relay(&received.message, id, max_hops);
                debug!(
                    "{} {} relayed to {} peers",
                    received.from_peer, received.message.kind, sent
                );
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Relay fell behind, skipped {} messages", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Connects to `addr` over TLS and returns its `/crawl` document.
pub async fn crawl_peer(addr: SocketAddr, timeout: Duration) -> anyhow::Result<serde_json::Value> {
    let fut = async {
        let dialer = TlsDialer::new()?;
        let connected = dialer.dial(addr).await?;
        let mut secure = dialer.secure(connected.stream, addr).await?;

        let mut request = HttpRequest::get("/crawl");
        request.headers.insert("Host", addr.to_string());
        request.headers.insert("Connection", "close");
        secure.stream.write_all(&request.encode()).await?;
        secure.stream.flush().await?;

        let mut responses = FramedRead::new(secure.stream, ResponseDecoder::new());
        let response = responses
            .next()
            .await
            .ok_or_else(|| anyhow::anyhow!("{} closed without answering", addr))??;
        if response.status != 200 {
            anyhow::bail!("{} answered {} {}", addr, response.status, response.reason);
        }
        let crawl: serde_json::Value = serde_json::from_slice(&response.body)?;
        Ok::<_, anyhow::Error>(crawl)
    };
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| anyhow::anyhow!("crawl of {} timed out", addr))?
}
