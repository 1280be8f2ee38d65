//! Bounded record of recently processed flood message ids.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;

/// LRU set of message ids with a time window.
///
/// An id is reported as new if it was never recorded, was evicted by
/// capacity pressure, or was recorded longer than `window` ago.
pub struct SeenCache {
    entries: LruCache<String, Instant>,
    window: Duration,
}

impl SeenCache {
    pub fn new(capacity: usize, window: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            window,
        }
    }

    /// Record `id`. Returns `true` the first time an id is seen within the
    /// window and `false` for a repeat.
    pub fn insert(&mut self, id: &str) -> bool {
        let now = Instant::now();
        if let Some(first_seen) = self.entries.get(id) {
            if now.duration_since(*first_seen) < self.window {
                return false;
            }
        }
        self.entries.put(id.to_string(), now);
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries
            .peek(id)
            .is_some_and(|first_seen| first_seen.elapsed() < self.window)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for SeenCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeenCache")
            .field("len", &self.entries.len())
            .field("capacity", &self.entries.cap())
            .field("window", &self.window)
            .finish()
    }
}
