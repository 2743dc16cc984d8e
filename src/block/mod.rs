//! Block records and the dedup ring.
//!
//! Concurrent sources routinely return the same chain head, so every candidate
//! block passes through a fixed-capacity FIFO set keyed by `height:hash`
//! before it reaches the classifier.

use serde::Serialize;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Default ring capacity: the latest-blocks view the UI shows.
pub const DEFAULT_RING_CAPACITY: usize = 50;

/// A normalised latest-block record. Immutable once constructed.
#[derive(Debug, Clone, Serialize)]
pub struct Block {
    pub height: u64,
    pub hash: String,
    pub time_unix: i64,
    /// Which fetcher produced it.
    pub source_id: String,
}

impl Block {
    /// Dedup key. Hashes compare case-insensitively.
    pub fn key(&self) -> String {
        format!("{}:{}", self.height, self.hash.to_ascii_lowercase())
    }
}

struct RingInner {
    items: VecDeque<Block>,
    index: HashSet<String>,
}

/// Fixed-capacity insertion-ordered set of recent blocks with O(1) membership.
/// Eviction is strictly FIFO.
pub struct DedupRing {
    capacity: usize,
    inner: Mutex<RingInner>,
}

impl DedupRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(RingInner {
                items: VecDeque::with_capacity(capacity),
                index: HashSet::with_capacity(capacity),
            }),
        }
    }

    /// Admit a block. Returns false when its key is already present; otherwise
    /// appends, evicting the oldest entry at capacity.
    pub fn admit(&self, block: &Block) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let key = block.key();
        if inner.index.contains(&key) {
            return false;
        }
        if inner.items.len() >= self.capacity {
            if let Some(old) = inner.items.pop_front() {
                inner.index.remove(&old.key());
            }
        }
        inner.items.push_back(block.clone());
        inner.index.insert(key);
        true
    }

    /// Snapshot of the ring contents, newest first.
    pub fn list(&self) -> Vec<Block> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.items.iter().rev().cloned().collect()
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.items.clear();
        inner.index.clear();
    }
}
