//! Remote endpoint addressing and the exponential reconnect schedule.

use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::identity::PeerGuid;
use crate::version::PeerVersion;

/// Default retry ceiling. 2^21 seconds is a little over three weeks.
pub const DEFAULT_MAX_RETRIES: u32 = 21;

/// A remote peer by address and, once the handshake has run, by GUID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub peer_guid: Option<PeerGuid>,
    pub peer_version: Option<PeerVersion>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_retry_time: Option<DateTime<Utc>>,
    pub next_retry_time: Option<DateTime<Utc>>,
    /// Set when the session owning this endpoint was closed with retry
    /// suppressed (rejected version, self-connect, explicit close).
    #[serde(default)]
    pub retry_suppressed: bool,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            peer_guid: None,
            peer_version: None,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            last_retry_time: None,
            next_retry_time: None,
            retry_suppressed: false,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Parse `"host:port"`. Returns `None` when the port is missing or invalid.
    pub fn parse(addr: &str) -> Option<Self> {
        let (host, port) = addr.trim().rsplit_once(':')?;
        let port = port.parse().ok()?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return None;
        }
        Some(Self::new(host, port))
    }

    /// `"host:port"` form suitable for `TcpStream::connect`.
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn has_retries_left(&self) -> bool {
        !self.retry_suppressed && self.retry_count < self.max_retries
    }

    /// True once no further connection attempt will ever be granted.
    pub fn is_exhausted(&self) -> bool {
        self.retry_suppressed
            || (self.last_retry_time.is_some() && self.retry_count >= self.max_retries)
    }

    pub fn suppress_retry(&mut self) {
        self.retry_suppressed = true;
    }

    pub fn should_connect_now(&mut self) -> bool {
        self.should_connect_at(Utc::now())
    }

    /// Backoff decision at an explicit instant.
    ///
    /// The first call always succeeds. Afterwards a wait drawn uniformly from
    /// `[2^n, 2^(n+1))` seconds (n = retries so far) is fixed once and held
    /// until `now` passes it; then the attempt is granted and the next round
    /// starts with a fresh draw.
    pub fn should_connect_at(&mut self, now: DateTime<Utc>) -> bool {
        let Some(last) = self.last_retry_time else {
            self.grant(now);
            return true;
        };

        if self.retry_count >= self.max_retries {
            return false;
        }

        let count = self.retry_count;
        let next = *self
            .next_retry_time
            .get_or_insert_with(|| last + Self::backoff_window(count));

        if now >= next {
            self.grant(now);
            true
        } else {
            false
        }
    }

    /// Forget the accumulated backoff after a working connection was lost.
    ///
    /// The next attempt is scheduled 1–2 seconds after `now`, after which the
    /// usual exponential growth resumes.
    pub fn reset_retry_stats(&mut self) {
        self.reset_retry_stats_at(Utc::now());
    }

    pub fn reset_retry_stats_at(&mut self, now: DateTime<Utc>) {
        self.retry_count = 0;
        self.next_retry_time = None;
        self.last_retry_time = Some(now);
    }

    fn grant(&mut self, now: DateTime<Utc>) {
        self.last_retry_time = Some(now);
        self.next_retry_time = None;
        self.retry_count = self.retry_count.saturating_add(1);
    }

    fn backoff_window(retry_count: u32) -> TimeDelta {
        let exp = retry_count.min(40);
        let low_ms = (1u64 << exp).saturating_mul(1000);
        let high_ms = (1u64 << (exp + 1)).saturating_mul(1000);
        let wait_ms = rand::rng().random_range(low_ms..high_ms);
        TimeDelta::milliseconds(i64::try_from(wait_ms).unwrap_or(i64::MAX / 2))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.peer_guid {
            Some(guid) => write!(f, "{} ({guid})", self.address()),
            None => f.write_str(&self.address()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
