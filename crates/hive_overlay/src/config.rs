//! Overlay configuration for a node.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::DEFAULT_MAX_FRAME_SIZE;
use crate::dedup::DEFAULT_DEDUP_CAPACITY;
use crate::endpoint::DEFAULT_MAX_RETRIES;
use crate::error::OverlayError;
use crate::version::VersionPolicy;

/// Configuration for the overlay layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    /// Address the listener binds for incoming peer connections.
    #[serde(with = "socket_addr_serde")]
    pub listen_addr: SocketAddr,

    /// Peers dialed on startup, as `"host:port"`.
    pub seed_peers: Vec<String>,

    /// Hives subscribed on startup.
    pub seed_hives: Vec<String>,

    /// Reconnect attempts before an endpoint is abandoned.
    pub max_retries: u32,

    /// Timeout for establishing an outbound TCP connection.
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,

    /// Longest a single frame write may block before the session is dropped.
    #[serde(with = "duration_serde")]
    pub send_timeout: Duration,

    /// Connection manager sleep when nothing is waiting to be dialed.
    #[serde(with = "duration_serde")]
    pub idle_poll_interval: Duration,

    /// Connection manager sleep while endpoints wait out their backoff.
    #[serde(with = "duration_serde")]
    pub retry_poll_interval: Duration,

    /// Content loop tick; bounds packet processing latency.
    #[serde(with = "duration_serde")]
    pub content_poll_interval: Duration,

    /// Number of packet GUIDs remembered for duplicate suppression.
    pub dedup_capacity: usize,

    /// Largest accepted frame body in bytes.
    pub max_frame_size: usize,

    /// Version thresholds applied to connecting peers.
    pub version_policy: VersionPolicy,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 9470)),
            seed_peers: Vec::new(),
            seed_hives: Vec::new(),
            max_retries: DEFAULT_MAX_RETRIES,
            connect_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(30),
            idle_poll_interval: Duration::from_secs(30),
            retry_poll_interval: Duration::from_secs(1),
            content_poll_interval: Duration::from_millis(50),
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            version_policy: VersionPolicy::default(),
        }
    }
}

impl OverlayConfig {
    /// Save the config to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), OverlayError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load config from a JSON file, or return defaults if the file is missing.
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str::<OverlayConfig>(&data) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!("Corrupt config file, using defaults: {e}");
                    }
                },
                Err(e) => {
                    tracing::warn!("Cannot read config file, using defaults: {e}");
                }
            }
        }
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S: Serializer>(addr: &SocketAddr, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<SocketAddr, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Durations travel as integer milliseconds.
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(dur.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
