//! Version gating: decides whether a connecting peer's protocol version is
//! supported, deprecated, or refused.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::OverlayError;

/// A dotted numeric version (`"2.0"`, `"0.75"`, `"1.2.3"`).
///
/// Components compare numerically left to right; missing trailing components
/// count as zero, so `"1.0" == "1"`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerVersion(Vec<u32>);

impl PeerVersion {
    /// The version this build announces.
    pub fn current() -> Self {
        env!("CARGO_PKG_VERSION").parse().unwrap_or_default()
    }

    pub fn components(&self) -> &[u32] {
        &self.0
    }
}

impl FromStr for PeerVersion {
    type Err = OverlayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(OverlayError::InvalidVersion(s.to_string()));
        }
        trimmed
            .split('.')
            .map(|part| {
                part.parse::<u32>()
                    .map_err(|_| OverlayError::InvalidVersion(s.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }
}

impl TryFrom<String> for PeerVersion {
    type Error = OverlayError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PeerVersion> for String {
    fn from(v: PeerVersion) -> Self {
        v.to_string()
    }
}

impl fmt::Display for PeerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(u32::to_string).collect();
        write!(f, "{}", parts.join("."))
    }
}

impl Ord for PeerVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.0.len().max(other.0.len());
        for i in 0..len {
            let a = self.0.get(i).copied().unwrap_or(0);
            let b = other.0.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for PeerVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for PeerVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PeerVersion {}

/// Outcome of the handshake version check, carried in the completion Welcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupportCode {
    Supported,
    Deprecated,
    Unsupported,
    Unknown,
}

impl SupportCode {
    /// Levels in the order the policy evaluates them.
    pub const EVALUATION_ORDER: [SupportCode; 3] = [
        SupportCode::Supported,
        SupportCode::Deprecated,
        SupportCode::Unsupported,
    ];
}

impl fmt::Display for SupportCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Supported => "supported",
            Self::Deprecated => "deprecated",
            Self::Unsupported => "unsupported",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// One configured threshold: peers at or above `min_version` get `level`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionThreshold {
    pub level: SupportCode,
    pub min_version: PeerVersion,
    #[serde(default)]
    pub link: String,
    #[serde(default)]
    pub message: String,
}

/// Result of evaluating a peer version against a [`VersionPolicy`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionVerdict {
    pub code: SupportCode,
    pub link: String,
    pub message: String,
}

/// Ordered list of thresholds supplied by the host application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionPolicy {
    thresholds: Vec<VersionThreshold>,
}

impl VersionPolicy {
    pub fn new(thresholds: Vec<VersionThreshold>) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &[VersionThreshold] {
        &self.thresholds
    }

    /// Evaluate a peer version.
    ///
    /// Levels are tried in the fixed order Supported, Deprecated, Unsupported
    /// regardless of configuration order; the first threshold whose minimum is
    /// `<= version` wins. When nothing matches the peer is `Supported`.
    pub fn evaluate(&self, version: &PeerVersion) -> VersionVerdict {
        for level in SupportCode::EVALUATION_ORDER {
            let hit = self
                .thresholds
                .iter()
                .filter(|t| t.level == level)
                .find(|t| t.min_version <= *version);
            if let Some(t) = hit {
                return VersionVerdict {
                    code: t.level,
                    link: t.link.clone(),
                    message: t.message.clone(),
                };
            }
        }
        VersionVerdict {
            code: SupportCode::Supported,
            link: String::new(),
            message: String::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
