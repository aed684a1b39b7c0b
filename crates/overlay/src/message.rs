//! Wire envelope and framing for peer messages.
//!
//! The overlay does not interpret protocol payloads; it only needs a type tag
//! and an optional hop counter. Each frame on the wire is:
//!
//! ```text
//! +------------------+--------------+-----------+------------------+---------+
//! | Length (4 bytes) | Kind (2)     | Flags (1) | Hops (4, if set) | Payload |
//! +------------------+--------------+-----------+------------------+---------+
//! ```
//!
//! The length covers everything after itself. Bit 0 of the flags byte marks
//! the presence of the hop counter.

use std::net::SocketAddr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha256};
use tokio_util::codec::{Decoder, Encoder};

use crate::{OverlayError, Result};

/// Maximum frame body size (64 MB) - prevents memory exhaustion.
const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Smallest valid body: kind plus flags.
const MIN_MESSAGE_SIZE: usize = 3;

const FLAG_HAS_HOPS: u8 = 0x01;

/// Protocol message type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageKind(pub u16);

impl MessageKind {
    pub const PING: MessageKind = MessageKind(3);
    pub const PONG: MessageKind = MessageKind(4);
    pub const ENDPOINTS: MessageKind = MessageKind(15);
    pub const TRANSACTION: MessageKind = MessageKind(30);
    pub const PROPOSAL: MessageKind = MessageKind(33);
    pub const STATUS: MessageKind = MessageKind(34);
    pub const VALIDATION: MessageKind = MessageKind(41);

    /// Returns a human-readable name for logging.
    pub fn name(&self) -> &'static str {
        match *self {
            Self::PING => "PING",
            Self::PONG => "PONG",
            Self::ENDPOINTS => "ENDPOINTS",
            Self::TRANSACTION => "TRANSACTION",
            Self::PROPOSAL => "PROPOSAL",
            Self::STATUS => "STATUS",
            Self::VALIDATION => "VALIDATION",
            _ => "UNKNOWN",
        }
    }

    /// Returns true for messages consumed by the overlay itself.
    pub fn is_overlay_control(&self) -> bool {
        matches!(*self, Self::PING | Self::PONG | Self::ENDPOINTS)
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), self.0)
    }
}

/// Content identifier of a message, used as the suppression key.
///
/// SHA-256 over the kind and payload. The hop counter is excluded so the
/// same message seen at different distances maps to one record.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId(pub [u8; 32]);

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl std::fmt::Debug for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MessageId({})", self)
    }
}

/// An opaque protocol message with a type tag and an optional hop counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub hops: Option<u32>,
    pub payload: Bytes,
}

impl Message {
    /// Creates a message without a hop counter.
    pub fn new(kind: MessageKind, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            hops: None,
            payload: payload.into(),
        }
    }

    pub fn with_hops(mut self, hops: u32) -> Self {
        self.hops = Some(hops);
        self
    }

    pub fn has_hops(&self) -> bool {
        self.hops.is_some()
    }

    /// Computes the suppression identifier of this message.
    pub fn id(&self) -> MessageId {
        let mut hasher = Sha256::new();
        hasher.update(self.kind.0.to_be_bytes());
        hasher.update(&self.payload);
        MessageId(hasher.finalize().into())
    }

    /// Encoded size of the frame body (without the length prefix).
    pub fn body_len(&self) -> usize {
        MIN_MESSAGE_SIZE + if self.hops.is_some() { 4 } else { 0 } + self.payload.len()
    }

    pub fn ping(nonce: u32) -> Self {
        Self::new(MessageKind::PING, nonce.to_be_bytes().to_vec())
    }

    pub fn pong(nonce: u32) -> Self {
        Self::new(MessageKind::PONG, nonce.to_be_bytes().to_vec())
    }

    /// Announces the ledger sequence the sender claims to have validated.
    pub fn status(ledger_seq: u32) -> Self {
        Self::new(MessageKind::STATUS, ledger_seq.to_be_bytes().to_vec())
    }

    /// Reads the 4-byte big-endian value carried by PING, PONG and STATUS.
    pub fn u32_payload(&self) -> Option<u32> {
        let bytes: [u8; 4] = self.payload.as_ref().try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }

    /// Endpoint gossip: one `ip:port` per line.
    pub fn endpoints(endpoints: &[SocketAddr]) -> Self {
        let body = endpoints
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("\n");
        Self::new(MessageKind::ENDPOINTS, body.into_bytes())
    }

    /// Parses endpoint gossip, skipping malformed lines.
    pub fn decode_endpoints(&self) -> Vec<SocketAddr> {
        std::str::from_utf8(&self.payload)
            .map(|body| {
                body.lines()
                    .filter_map(|line| line.trim().parse().ok())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Codec for length-prefixed [`Message`] frames.
///
/// Implements tokio's `Encoder` and `Decoder` traits for use with `Framed`.
#[derive(Debug, Default)]
pub struct MessageCodec {
    decode_state: DecodeState,
}

/// Internal state machine for streaming message decoding.
#[derive(Debug, Default)]
enum DecodeState {
    /// Waiting for the 4-byte length prefix.
    #[default]
    ReadingLength,
    /// Have length, waiting for the message body.
    ReadingBody { len: usize },
}

impl MessageCodec {
    pub fn new() -> Self {
        Self::default()
    }

    fn decode_body(mut body: BytesMut) -> Result<Message> {
        let kind = MessageKind(body.get_u16());
        let flags = body.get_u8();
        let hops = if flags & FLAG_HAS_HOPS != 0 {
            if body.len() < 4 {
                return Err(OverlayError::Message(
                    "hop flag set but counter missing".to_string(),
                ));
            }
            Some(body.get_u32())
        } else {
            None
        };
        Ok(Message {
            kind,
            hops,
            payload: body.freeze(),
        })
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = OverlayError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            match self.decode_state {
                DecodeState::ReadingLength => {
                    if src.len() < 4 {
                        return Ok(None);
                    }

                    let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
                    if len < MIN_MESSAGE_SIZE {
                        return Err(OverlayError::Message(format!(
                            "message too small: {} bytes",
                            len
                        )));
                    }
                    if len > MAX_MESSAGE_SIZE {
                        return Err(OverlayError::Message(format!(
                            "message too large: {} bytes (limit: {})",
                            len, MAX_MESSAGE_SIZE
                        )));
                    }

                    src.advance(4);
                    src.reserve(len);
                    self.decode_state = DecodeState::ReadingBody { len };
                }
                DecodeState::ReadingBody { len } => {
                    if src.len() < len {
                        return Ok(None);
                    }

                    let body = src.split_to(len);
                    self.decode_state = DecodeState::ReadingLength;
                    return Self::decode_body(body).map(Some);
                }
            }
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = OverlayError;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<()> {
        let len = message.body_len();
        if len > MAX_MESSAGE_SIZE {
            return Err(OverlayError::Message(format!(
                "message too large: {} bytes",
                len
            )));
        }

        dst.reserve(4 + len);
        dst.put_u32(len as u32);
        dst.put_u16(message.kind.0);
        match message.hops {
            Some(hops) => {
                dst.put_u8(FLAG_HAS_HOPS);
                dst.put_u32(hops);
            }
            None => dst.put_u8(0),
        }
        dst.extend_from_slice(&message.payload);
        Ok(())
    }
}
