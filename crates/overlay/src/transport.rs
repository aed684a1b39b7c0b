//! TCP and TLS transport for peer connections.
//!
//! Connection attempts reach the network only through the [`Dialer`] trait so
//! the handshake state machine can run over in-memory streams in tests. The
//! built-in [`TlsDialer`] and [`TlsAcceptor`] wrap `tokio-rustls`.
//!
//! Peers authenticate each other with their node keys, not with certificates:
//! the client accepts any server certificate, and both sides instead sign a
//! value exported from the TLS session (see [`ChannelBinding`]).

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{
    CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime,
};
use rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::hello::ChannelBinding;
use crate::{OverlayError, Result};

/// Label for the keying material exporter that derives the channel binding.
const BINDING_LABEL: &[u8] = b"EXPORTER-ledgermesh-session";

/// A bidirectional byte stream a peer connection can run over.
pub trait PeerStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> PeerStream for T {}

/// Type-erased peer stream.
pub type BoxedStream = Box<dyn PeerStream>;

/// Result of [`Dialer::dial`].
pub struct TcpConnected {
    pub stream: BoxedStream,
    /// Our side of the connection, reported to the slot allocator.
    pub local_addr: SocketAddr,
}

/// A stream that finished its TLS handshake.
pub struct SecureStream {
    pub stream: BoxedStream,
    pub binding: ChannelBinding,
}

impl std::fmt::Debug for SecureStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureStream")
            .field("binding", &self.binding)
            .finish()
    }
}

/// Opens outbound connections.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Establishes the transport connection to `remote`.
    async fn dial(&self, remote: SocketAddr) -> Result<TcpConnected>;

    /// Runs the client side of the TLS handshake over `stream`.
    async fn secure(&self, stream: BoxedStream, remote: SocketAddr) -> Result<SecureStream>;
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

fn tls_error(e: impl std::fmt::Display) -> OverlayError {
    OverlayError::Tls(e.to_string())
}

/// [`Dialer`] over real TCP sockets and `rustls`.
#[derive(Clone)]
pub struct TlsDialer {
    connector: tokio_rustls::TlsConnector,
}

impl TlsDialer {
    pub fn new() -> Result<Self> {
        let config = ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .map_err(tls_error)?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
            .with_no_client_auth();
        Ok(Self {
            connector: tokio_rustls::TlsConnector::from(Arc::new(config)),
        })
    }
}

#[async_trait]
impl Dialer for TlsDialer {
    async fn dial(&self, remote: SocketAddr) -> Result<TcpConnected> {
        let stream = TcpStream::connect(remote)
            .await
            .map_err(|e| OverlayError::ConnectionFailed(format!("{}: {}", remote, e)))?;
        stream.set_nodelay(true)?;
        let local_addr = stream.local_addr()?;
        trace!("TCP connected {} -> {}", local_addr, remote);
        Ok(TcpConnected {
            stream: Box::new(stream),
            local_addr,
        })
    }

    async fn secure(&self, stream: BoxedStream, remote: SocketAddr) -> Result<SecureStream> {
        let tls = self
            .connector
            .connect(ServerName::from(remote.ip()), stream)
            .await
            .map_err(tls_error)?;
        let binding = {
            let (_, conn) = tls.get_ref();
            ChannelBinding(
                conn.export_keying_material([0u8; 32], BINDING_LABEL, None)
                    .map_err(tls_error)?,
            )
        };
        debug!("TLS established with {}", remote);
        Ok(SecureStream {
            stream: Box::new(tls),
            binding,
        })
    }
}

impl std::fmt::Debug for TlsDialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsDialer").finish()
    }
}

/// Server side of the TLS handshake for accepted connections.
#[derive(Clone)]
pub struct TlsAcceptor {
    inner: tokio_rustls::TlsAcceptor,
}

impl TlsAcceptor {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            inner: tokio_rustls::TlsAcceptor::from(Arc::new(config)),
        }
    }

    /// Builds an acceptor from a PEM certificate chain and private key.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &cert_pem[..])
            .collect::<std::result::Result<_, _>>()?;
        if certs.is_empty() {
            return Err(OverlayError::Tls("no certificate found".to_string()));
        }
        let key = rustls_pemfile::private_key(&mut &key_pem[..])?
            .ok_or_else(|| OverlayError::Tls("no private key found".to_string()))?;
        Self::with_cert(certs, key)
    }

    /// Builds an acceptor with a freshly generated self-signed certificate.
    pub fn self_signed(hostname: &str) -> Result<Self> {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec![hostname.to_string()]).map_err(tls_error)?;
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
        Self::with_cert(vec![cert.der().clone()], key)
    }

    fn with_cert(certs: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> Result<Self> {
        let config = ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .map_err(tls_error)?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(tls_error)?;
        Ok(Self::new(config))
    }

    /// Runs the server side of the TLS handshake.
    pub async fn accept<S>(&self, stream: S) -> Result<SecureStream>
    where
        S: PeerStream + 'static,
    {
        let tls = self.inner.accept(stream).await.map_err(tls_error)?;
        let binding = {
            let (_, conn) = tls.get_ref();
            ChannelBinding(
                conn.export_keying_material([0u8; 32], BINDING_LABEL, None)
                    .map_err(tls_error)?,
            )
        };
        Ok(SecureStream {
            stream: Box::new(tls),
            binding,
        })
    }
}

impl std::fmt::Debug for TlsAcceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsAcceptor").finish()
    }
}

/// Accepts any server certificate.
///
/// Identity is established by the session-signed hello, not by the
/// certificate chain.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tls_round_trip_shares_binding() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let acceptor = TlsAcceptor::self_signed("localhost").unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut secure = acceptor.accept(tcp).await.unwrap();
            let mut buf = [0u8; 5];
            secure.stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");
            secure.binding
        });

        let dialer = TlsDialer::new().unwrap();
        let connected = dialer.dial(addr).await.unwrap();
        assert_eq!(connected.local_addr.ip(), addr.ip());
        let mut secure = dialer.secure(connected.stream, addr).await.unwrap();
        secure.stream.write_all(b"hello").await.unwrap();
        secure.stream.flush().await.unwrap();

        let server_binding = server.await.unwrap();
        assert_eq!(server_binding, secure.binding);
    }

    #[tokio::test]
    async fn test_dial_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let dialer = TlsDialer::new().unwrap();
        assert!(matches!(
            dialer.dial(addr).await,
            Err(OverlayError::ConnectionFailed(_))
        ));
    }

    #[test]
    fn test_from_pem_rejects_empty() {
        assert!(TlsAcceptor::from_pem(b"", b"").is_err());
    }
}
