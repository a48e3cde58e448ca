//! Bounded FIFO set of recently seen packet GUIDs.
//!
//! Flooding is only safe because every peer remembers which packets it has
//! already handled. The cache is global per node (not scoped per hive) and
//! forgets the oldest GUID once it is full.

use std::collections::{HashSet, VecDeque};

use parking_lot::Mutex;

/// Default number of GUIDs remembered by a node.
pub const DEFAULT_DEDUP_CAPACITY: usize = 10_000;

#[derive(Debug, Default)]
struct Inner {
    order: VecDeque<String>,
    members: HashSet<String>,
}

/// Thread-safe bounded FIFO set keyed by packet GUID.
#[derive(Debug)]
pub struct HashQueue {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl HashQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Remember `key`. No-op if it is already present; otherwise inserts it
    /// and evicts the oldest keys until the size is back within capacity.
    pub fn enqueue(&self, key: &str) {
        let mut inner = self.inner.lock();
        if inner.members.contains(key) {
            return;
        }
        inner.members.insert(key.to_string());
        inner.order.push_back(key.to_string());
        while inner.order.len() > self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.members.remove(&oldest);
            }
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().members.contains(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for HashQueue {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
