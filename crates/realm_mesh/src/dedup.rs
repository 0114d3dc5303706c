//! Dedup cache: the set of message ids this node has already processed.

use std::collections::{HashSet, VecDeque};

use parking_lot::Mutex;
use uuid::Uuid;

/// Bounded, insertion-ordered set of seen message ids.
///
/// Internally synchronized so the read loops and the cleanup timer can share
/// one instance without an outer lock.
pub struct DedupCache {
    inner: Mutex<Seen>,
    capacity: usize,
}

struct Seen {
    ids: HashSet<Uuid>,
    order: VecDeque<Uuid>,
}

impl Seen {
    fn pop_oldest(&mut self) -> bool {
        match self.order.pop_front() {
            Some(id) => {
                self.ids.remove(&id);
                true
            }
            None => false,
        }
    }
}

impl DedupCache {
    /// Create a cache holding at most `capacity` ids.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Seen {
                ids: HashSet::new(),
                order: VecDeque::new(),
            }),
            capacity: capacity.max(1),
        }
    }

    /// Record `id`. Returns `true` if it was not seen before.
    ///
    /// When the cache is full the oldest id is forgotten to make room.
    pub fn insert(&self, id: Uuid) -> bool {
        let mut seen = self.inner.lock();
        if !seen.ids.insert(id) {
            return false;
        }
        seen.order.push_back(id);
        while seen.order.len() > self.capacity {
            seen.pop_oldest();
        }
        true
    }

    /// Whether `id` has been seen and not yet evicted.
    pub fn contains(&self, id: &Uuid) -> bool {
        self.inner.lock().ids.contains(id)
    }

    /// Forget up to `n` of the oldest ids. Returns how many were removed.
    pub fn evict_oldest(&self, n: usize) -> usize {
        let mut seen = self.inner.lock();
        let mut removed = 0;
        while removed < n && seen.pop_oldest() {
            removed += 1;
        }
        removed
    }

    /// Number of ids currently remembered.
    pub fn len(&self) -> usize {
        self.inner.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
