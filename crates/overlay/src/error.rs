//! Error types for overlay operations.
//!
//! Defines the [`OverlayError`] enum which covers every way a connection
//! attempt, an inbound handoff or an active peer can fail:
//!
//! - Connection failures, timeouts and graceful remote closes
//! - TLS and hello (handshake) failures
//! - Slot admission failures
//! - Malformed HTTP upgrade exchanges and wire messages
//! - Internal errors

use thiserror::Error;

/// Errors that can occur during overlay network operations.
///
/// None of these escape the registry boundary: attempts and peers log them
/// and terminate in isolation.
#[derive(Debug, Error)]
pub enum OverlayError {
    // ===== Connection Errors =====
    /// TCP connection could not be established.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// A handshake step did not complete before its deadline.
    #[error("timeout: {0}")]
    ConnectionTimeout(String),

    /// The remote end closed the connection.
    #[error("peer disconnected: {0}")]
    PeerDisconnected(String),

    /// The TLS handshake failed.
    #[error("TLS error: {0}")]
    Tls(String),

    // ===== Handshake Errors =====
    /// The allocator reported that this connection duplicates another one,
    /// typically a connection to ourselves.
    #[error("duplicate connection")]
    DuplicateConnection,

    /// The hello payload was missing, malformed or failed verification.
    #[error("bad hello: {0}")]
    BadHello(String),

    /// The remote speaks a protocol version we do not support.
    #[error("protocol version mismatch: {0}")]
    VersionMismatch(String),

    /// The allocator refused to activate the slot.
    #[error("slots full")]
    SlotsFull,

    // ===== Protocol Errors =====
    /// The HTTP upgrade request or response could not be parsed.
    #[error("invalid HTTP: {0}")]
    InvalidHttp(String),

    /// A wire message could not be framed or decoded.
    #[error("message error: {0}")]
    Message(String),

    // ===== State Errors =====
    /// Operation rejected because the registry is stopping.
    #[error("overlay is shutting down")]
    ShuttingDown,

    /// The operation was cancelled by `stop()`.
    #[error("cancelled")]
    Cancelled,

    // ===== Address Errors =====
    /// Invalid peer address format.
    #[error("invalid peer address: {0}")]
    InvalidPeerAddress(String),

    // ===== Wrapped Errors =====
    /// Low-level I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // ===== Internal Errors =====
    /// Internal channel send failed (receiver dropped).
    #[error("channel send error")]
    ChannelSend,

    /// Unexpected internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl OverlayError {
    /// Returns true if this error is transient and a later attempt could succeed.
    ///
    /// The overlay never retries on its own; the slot allocator decides when
    /// an address is worth dialing again.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            OverlayError::ConnectionFailed(_)
                | OverlayError::ConnectionTimeout(_)
                | OverlayError::PeerDisconnected(_)
                | OverlayError::SlotsFull
                | OverlayError::Io(_)
        )
    }

    /// Returns true if this error is a protocol violation by the remote.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            OverlayError::BadHello(_) | OverlayError::VersionMismatch(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(OverlayError::ConnectionTimeout("dial".into()).is_retriable());
        assert!(OverlayError::SlotsFull.is_retriable());
        assert!(!OverlayError::BadHello("sig".into()).is_retriable());
        assert!(OverlayError::BadHello("sig".into()).is_fatal());
        assert!(!OverlayError::DuplicateConnection.is_fatal());
    }

    #[test]
    fn test_io_conversion() {
        let err: OverlayError =
            std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset").into();
        assert!(matches!(err, OverlayError::Io(_)));
        assert!(err.to_string().contains("reset"));
    }
}
