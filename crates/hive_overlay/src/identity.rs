//! Peer identity: self-asserted GUIDs and their persistence.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::OverlayError;
use crate::version::PeerVersion;

/// The self-asserted, stable identifier of a peer on the overlay.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerGuid(pub String);

impl PeerGuid {
    /// Generate a new random peer GUID (UUID v4).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Create a PeerGuid from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Return the inner string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Local identifier of one duplex connection. Never sent over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(uuid::Uuid);

impl SessionId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form keeps log lines readable.
        let s = self.0.simple().to_string();
        write!(f, "{}", &s[..8])
    }
}

/// The full identity of this node on the overlay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// Stable peer GUID, announced in every origin path hop.
    pub guid: PeerGuid,
    /// Human-readable name for the node (e.g. hostname).
    pub name: String,
    /// Protocol version announced during the handshake.
    pub version: PeerVersion,
}

impl NodeIdentity {
    /// Create a new identity with a fresh GUID and the crate's own version.
    pub fn generate(name: impl Into<String>) -> Self {
        Self {
            guid: PeerGuid::generate(),
            name: name.into(),
            version: PeerVersion::current(),
        }
    }

    /// Same as [`generate`](Self::generate) but announcing a specific version.
    pub fn with_version(name: impl Into<String>, version: PeerVersion) -> Self {
        Self {
            version,
            ..Self::generate(name)
        }
    }

    /// Save the identity to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), OverlayError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load an identity from a JSON file, or generate (and persist) a new one
    /// if the file does not exist or cannot be parsed.
    pub fn load_or_generate(path: &Path, name: impl Into<String>) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str::<NodeIdentity>(&data) {
                    Ok(identity) => return identity,
                    Err(e) => {
                        tracing::warn!("Corrupt identity file, generating new: {e}");
                    }
                },
                Err(e) => {
                    tracing::warn!("Cannot read identity file, generating new: {e}");
                }
            }
        }

        let identity = Self::generate(name);
        if let Err(e) = identity.save_to_file(path) {
            tracing::warn!("Failed to persist new identity: {e}");
        }
        identity
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
