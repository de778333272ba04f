//! Bounded cache of recently processed frame records.

use crate::record::FrameRecord;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

/// Insertion-ordered cache of frame records keyed by frame id.
///
/// This is a capacity bound, not an LRU: once full, the entry inserted
/// earliest is evicted, no matter how recently it was read. Re-putting an
/// existing frame id replaces the record without changing its position.
pub struct ResultCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
}

struct CacheInner {
    entries: HashMap<String, FrameRecord>,
    order: VecDeque<String>,
}

impl ResultCache {
    /// Create a cache holding at most `capacity` records (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::with_capacity(capacity),
                order: VecDeque::with_capacity(capacity),
            }),
            capacity,
        }
    }

    /// Insert a record, evicting the oldest entry when full.
    pub fn put(&self, record: FrameRecord) {
        let mut inner = self.inner.lock();

        if let Some(existing) = inner.entries.get_mut(&record.frame_id) {
            *existing = record;
            return;
        }

        if inner.order.len() >= self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.entries.remove(&oldest);
            }
        }

        inner.order.push_back(record.frame_id.clone());
        inner.entries.insert(record.frame_id.clone(), record);
    }

    /// Look up a record. Does not affect eviction order.
    pub fn get(&self, frame_id: &str) -> Option<FrameRecord> {
        self.inner.lock().entries.get(frame_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
