//! Overlay error types.

use std::time::Duration;

use crate::identity::SessionId;

/// Errors that can occur in the hive_overlay crate.
#[derive(Debug, thiserror::Error)]
pub enum OverlayError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization of a packet failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Frame encryption or decryption failed (bad padding, wrong key).
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// A frame header announced a body larger than the configured maximum.
    #[error("Frame of {len} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },

    /// A frame header announced a zero-length body.
    #[error("Empty frame")]
    EmptyFrame,

    /// The session is already disconnected.
    #[error("Session closed: {0}")]
    SessionClosed(SessionId),

    /// No connected session matches the requested peer.
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// An operation timed out.
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    /// The node is not running.
    #[error("Node not running")]
    NotRunning,

    /// The remote peer violated the handshake or routing protocol.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A version string could not be parsed.
    #[error("Invalid version: {0}")]
    InvalidVersion(String),
}
