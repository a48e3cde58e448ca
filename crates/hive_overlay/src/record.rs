//! Per-item version accounting used to pick a winner between two copies of
//! the same item.
//!
//! Peers exchanging items compare records with [`SyncRecord::is_winner`]; the
//! ordering is `(version, when, by)`, highest first, and must be identical on
//! every peer for copies to converge.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Number of superseded updates kept in a record's history.
pub const MAX_PAST_UPDATES: usize = 25;

/// One update: when it happened and which peer made it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    pub when: DateTime<Utc>,
    pub by: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncHistory {
    pub when: DateTime<Utc>,
    pub by: String,
    /// Superseded heads, oldest first, at most [`MAX_PAST_UPDATES`].
    #[serde(default)]
    pub past_updates: Vec<Update>,
}

impl SyncHistory {
    fn head(&self) -> Update {
        Update {
            when: self.when,
            by: self.by.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub item_guid: String,
    pub version: u64,
    pub history: SyncHistory,
}

impl SyncRecord {
    /// First version of an item, created by `by` at `when`.
    pub fn new(item_guid: impl Into<String>, by: impl Into<String>, when: DateTime<Utc>) -> Self {
        Self {
            item_guid: item_guid.into(),
            version: 1,
            history: SyncHistory {
                when,
                by: by.into(),
                past_updates: Vec::new(),
            },
        }
    }

    /// Record a local modification. The version always increases; the
    /// replaced head moves into the history, dropping the oldest entry once
    /// the history is full.
    pub fn record_update(&mut self, by: impl Into<String>, when: DateTime<Utc>) {
        let previous = self.history.head();
        let past = &mut self.history.past_updates;
        past.push(previous);
        if past.len() > MAX_PAST_UPDATES {
            let excess = past.len() - MAX_PAST_UPDATES;
            past.drain(..excess);
        }
        self.history.when = when;
        self.history.by = by.into();
        self.version = self.version.saturating_add(1);
    }

    fn rank(&self) -> (u64, DateTime<Utc>, &str) {
        (self.version, self.history.when, self.history.by.as_str())
    }

    /// Total order used for conflict resolution.
    pub fn compare(&self, other: &SyncRecord) -> Ordering {
        self.rank().cmp(&other.rank())
    }

    /// Whether this copy should replace `other`.
    pub fn is_winner(&self, other: &SyncRecord) -> bool {
        self.compare(other) == Ordering::Greater
    }

    /// Whether the two copies were modified concurrently: equal versions
    /// with different heads, or adjacent versions where the newer copy does
    /// not descend from the older one's head.
    pub fn is_conflict(&self, other: &SyncRecord) -> bool {
        let (newer, older) = if self.version >= other.version {
            (self, other)
        } else {
            (other, self)
        };
        match newer.version - older.version {
            0 => newer.history.head() != older.history.head(),
            1 => newer.history.past_updates.last() != Some(&older.history.head()),
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_update_bumps_version_and_keeps_history() {
        let mut r = SyncRecord::new("item", "peer-a", t(0));
        r.record_update("peer-b", t(10));
        assert_eq!(r.version, 2);
        assert_eq!(r.history.by, "peer-b");
        assert_eq!(
            r.history.past_updates,
            vec![Update {
                when: t(0),
                by: "peer-a".into()
            }]
        );
    }

    #[test]
    fn test_history_capped_oldest_dropped() {
        let mut r = SyncRecord::new("item", "p0", t(0));
        for i in 1..=30 {
            r.record_update(format!("p{i}"), t(i));
        }
        assert_eq!(r.version, 31);
        assert_eq!(r.history.past_updates.len(), MAX_PAST_UPDATES);
        assert_eq!(r.history.past_updates[0].by, "p5");
        assert_eq!(r.history.past_updates.last().unwrap().by, "p29");
    }

    #[test]
    fn test_winner_by_version_then_time_then_peer() {
        let base = SyncRecord::new("item", "peer-a", t(0));

        let mut newer = base.clone();
        newer.record_update("peer-a", t(-100));
        assert!(newer.is_winner(&base));
        assert!(!base.is_winner(&newer));

        let later = SyncRecord::new("item", "peer-a", t(0) + TimeDelta::seconds(1));
        assert!(later.is_winner(&base));

        let other_peer = SyncRecord::new("item", "peer-b", t(0));
        assert!(other_peer.is_winner(&base));
        assert!(!base.is_winner(&other_peer));

        assert!(!base.is_winner(&base.clone()));
    }

    #[test]
    fn test_conflict_detection() {
        let base = SyncRecord::new("item", "peer-a", t(0));

        let mut a = base.clone();
        a.record_update("peer-a", t(10));
        let mut b = base.clone();
        b.record_update("peer-b", t(11));
        assert!(a.is_conflict(&b));
        assert!(b.is_conflict(&a));
        assert!(!a.is_conflict(&a.clone()));

        // a descends from base
        assert!(!a.is_conflict(&base));
        assert!(!base.is_conflict(&a));

        let mut c = b.clone();
        c.record_update("peer-b", t(12));
        // c is one ahead of a but descends from b
        assert!(c.is_conflict(&a));
        assert!(!c.is_conflict(&b));

        // too far apart to judge
        assert!(!c.is_conflict(&base));
    }

    #[test]
    fn test_record_json_shape() {
        let r = SyncRecord::new("item", "peer-a", t(0));
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["item_guid"], "item");
        assert_eq!(json["version"], 1);
        assert_eq!(json["history"]["by"], "peer-a");
        let back: SyncRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, r);
    }
}
