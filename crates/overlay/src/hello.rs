//! Hello payloads and the handshake verification interface.
//!
//! Each side of a new connection proves ownership of its node key by signing
//! the TLS session's channel binding, a value both ends derive from the same
//! TLS session and that a man in the middle cannot forward. The hello travels
//! as headers of the HTTP upgrade request (outbound) or the `101` response
//! (inbound):
//!
//! | Header              | Content                                   |
//! |---------------------|-------------------------------------------|
//! | `Public-Key`        | base64 Ed25519 node key                   |
//! | `Session-Signature` | base64 signature over the channel binding |
//! | `Protocol`          | `RTXP/<major>.<minor>`                    |
//! | `Listening-Port`    | port for inbound connections (optional)   |
//! | `Crawl`             | `public` or `private`                     |

use base64::{engine::general_purpose::STANDARD, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;

use crate::http::Headers;
use crate::{NodePublicKey, OverlayError, ProtocolVersion, Result};

/// A value unique to one TLS session and identical at both of its ends.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ChannelBinding(pub [u8; 32]);

impl std::fmt::Debug for ChannelBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ChannelBinding({})", hex::encode(&self.0[..4]))
    }
}

/// The handshake message proving key ownership for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloPayload {
    pub protocol: ProtocolVersion,
    pub public_key: NodePublicKey,
    pub signature: Vec<u8>,
    pub listening_port: Option<u16>,
    /// The sender asks not to have its address exposed in crawls.
    pub private: bool,
}

impl HelloPayload {
    /// Writes the hello headers.
    pub fn append_headers(&self, headers: &mut Headers) {
        headers.insert("Public-Key", self.public_key.to_base64());
        headers.insert("Session-Signature", STANDARD.encode(&self.signature));
        headers.insert("Protocol", self.protocol.to_string());
        if let Some(port) = self.listening_port {
            headers.insert("Listening-Port", port.to_string());
        }
        headers.insert("Crawl", if self.private { "private" } else { "public" });
    }

    /// Reads a hello from upgrade headers.
    ///
    /// Only checks that the fields are well formed; the signature is checked
    /// by [`HandshakeVerifier::verify_hello`].
    pub fn from_headers(headers: &Headers) -> Result<Self> {
        let missing = |name: &str| OverlayError::BadHello(format!("missing {} header", name));

        let public_key = NodePublicKey::from_base64(
            headers
                .get("Public-Key")
                .ok_or_else(|| missing("Public-Key"))?,
        )?;

        let signature = STANDARD
            .decode(
                headers
                    .get("Session-Signature")
                    .ok_or_else(|| missing("Session-Signature"))?,
            )
            .map_err(|e| OverlayError::BadHello(format!("invalid signature encoding: {}", e)))?;

        let protocol = headers
            .get("Protocol")
            .or_else(|| headers.get("Upgrade"))
            .and_then(ProtocolVersion::negotiate)
            .ok_or_else(|| {
                OverlayError::VersionMismatch(
                    headers.get("Protocol").unwrap_or("<none>").to_string(),
                )
            })?;

        let listening_port = match headers.get("Listening-Port") {
            Some(v) => match v.parse::<u16>() {
                Ok(0) | Err(_) => {
                    return Err(OverlayError::BadHello(format!("invalid Listening-Port {:?}", v)))
                }
                Ok(port) => Some(port),
            },
            None => None,
        };

        let private = headers
            .get("Crawl")
            .map(|v| v.trim().eq_ignore_ascii_case("private"))
            .unwrap_or(false);

        Ok(Self {
            protocol,
            public_key,
            signature,
            listening_port,
            private,
        })
    }
}

/// Builds and verifies hello payloads for a session.
///
/// Implementations own the node identity and the cryptography; the overlay
/// only moves hellos between the wire and this interface.
pub trait HandshakeVerifier: Send + Sync {
    /// Our node key.
    fn public_key(&self) -> NodePublicKey;

    /// Creates our hello for the session identified by `binding`.
    ///
    /// The overlay fills in `listening_port` and `private` afterwards.
    fn build_hello(&self, binding: &ChannelBinding) -> Result<HelloPayload>;

    /// Checks a received hello against this session's binding and returns the
    /// remote node key.
    fn verify_hello(&self, hello: &HelloPayload, binding: &ChannelBinding) -> Result<NodePublicKey>;
}

/// Ed25519 node identity signing the raw channel binding.
pub struct Ed25519Handshake {
    signing_key: SigningKey,
}

impl Ed25519Handshake {
    pub fn new(signing_key: SigningKey) -> Self {
        Self { signing_key }
    }

    /// Creates a handshake with a fresh random identity.
    pub fn generate() -> Self {
        Self::new(SigningKey::generate(&mut OsRng))
    }

    /// Creates a handshake from a base64-encoded 32-byte seed.
    pub fn from_seed_base64(seed: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(seed.trim())
            .map_err(|e| OverlayError::Internal(format!("invalid node seed: {}", e)))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| OverlayError::Internal("node seed must be 32 bytes".to_string()))?;
        Ok(Self::new(SigningKey::from_bytes(&seed)))
    }

    /// Returns the base64-encoded seed.
    pub fn seed_base64(&self) -> String {
        STANDARD.encode(self.signing_key.to_bytes())
    }
}

impl HandshakeVerifier for Ed25519Handshake {
    fn public_key(&self) -> NodePublicKey {
        NodePublicKey(self.signing_key.verifying_key().to_bytes())
    }

    fn build_hello(&self, binding: &ChannelBinding) -> Result<HelloPayload> {
        let signature = self.signing_key.sign(&binding.0);
        Ok(HelloPayload {
            protocol: ProtocolVersion::CURRENT,
            public_key: self.public_key(),
            signature: signature.to_bytes().to_vec(),
            listening_port: None,
            private: false,
        })
    }

    fn verify_hello(
        &self,
        hello: &HelloPayload,
        binding: &ChannelBinding,
    ) -> Result<NodePublicKey> {
        if !hello.protocol.is_supported() {
            return Err(OverlayError::VersionMismatch(hello.protocol.to_string()));
        }
        if hello.public_key == self.public_key() {
            return Err(OverlayError::BadHello("self connection".to_string()));
        }

        let key = VerifyingKey::from_bytes(hello.public_key.as_bytes())
            .map_err(|e| OverlayError::BadHello(format!("invalid public key: {}", e)))?;
        let signature = Signature::from_slice(&hello.signature)
            .map_err(|e| OverlayError::BadHello(format!("invalid signature: {}", e)))?;
        key.verify_strict(&binding.0, &signature)
            .map_err(|_| OverlayError::BadHello("session signature mismatch".to_string()))?;

        Ok(hello.public_key)
    }
}

impl std::fmt::Debug for Ed25519Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ed25519Handshake")
            .field("public_key", &self.public_key())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BINDING: ChannelBinding = ChannelBinding([5u8; 32]);

    #[test]
    fn test_hello_verifies_across_nodes() {
        let alice = Ed25519Handshake::generate();
        let bob = Ed25519Handshake::generate();

        let hello = alice.build_hello(&BINDING).unwrap();
        assert_eq!(bob.verify_hello(&hello, &BINDING).unwrap(), alice.public_key());
    }

    #[test]
    fn test_hello_bound_to_session() {
        let alice = Ed25519Handshake::generate();
        let bob = Ed25519Handshake::generate();

        let hello = alice.build_hello(&BINDING).unwrap();
        let other = ChannelBinding([6u8; 32]);
        assert!(matches!(
            bob.verify_hello(&hello, &other),
            Err(OverlayError::BadHello(_))
        ));
    }

    #[test]
    fn test_rejects_own_key() {
        let alice = Ed25519Handshake::generate();
        let hello = alice.build_hello(&BINDING).unwrap();
        let err = alice.verify_hello(&hello, &BINDING).unwrap_err();
        assert!(err.to_string().contains("self connection"));
    }

    #[test]
    fn test_rejects_unsupported_protocol() {
        let alice = Ed25519Handshake::generate();
        let bob = Ed25519Handshake::generate();
        let mut hello = alice.build_hello(&BINDING).unwrap();
        hello.protocol = ProtocolVersion::new(2, 0);
        assert!(matches!(
            bob.verify_hello(&hello, &BINDING),
            Err(OverlayError::VersionMismatch(_))
        ));
    }

    #[test]
    fn test_headers_round_trip() {
        let alice = Ed25519Handshake::generate();
        let mut hello = alice.build_hello(&BINDING).unwrap();
        hello.listening_port = Some(51235);
        hello.private = true;

        let mut headers = Headers::new();
        hello.append_headers(&mut headers);
        assert_eq!(headers.get("Crawl"), Some("private"));
        assert_eq!(HelloPayload::from_headers(&headers).unwrap(), hello);
    }

    #[test]
    fn test_from_headers_rejects_missing_fields() {
        let alice = Ed25519Handshake::generate();
        let hello = alice.build_hello(&BINDING).unwrap();

        let mut headers = Headers::new();
        hello.append_headers(&mut headers);
        let mut without_key = Headers::new();
        for (k, v) in headers.iter().filter(|(k, _)| *k != "Public-Key") {
            without_key.insert(k, v);
        }
        assert!(matches!(
            HelloPayload::from_headers(&without_key),
            Err(OverlayError::BadHello(_))
        ));

        headers.insert("Listening-Port", "0");
        assert!(HelloPayload::from_headers(&headers).is_err());
    }

    #[test]
    fn test_seed_round_trip() {
        let alice = Ed25519Handshake::generate();
        let restored = Ed25519Handshake::from_seed_base64(&alice.seed_base64()).unwrap();
        assert_eq!(restored.public_key(), alice.public_key());
        assert!(Ed25519Handshake::from_seed_base64("c2hvcnQ=").is_err());
    }
}
