//! Context key deduplication.
//!
//! Fixed-capacity LRU set of canonical context keys. A hit means the context
//! was already announced in the current window and needs no index event.

use std::collections::{BTreeMap, HashMap};

/// LRU set of context keys. Capacity 0 disables deduplication.
#[derive(Debug)]
pub struct DedupCache {
    capacity: usize,
    /// Key to its last-use tick.
    entries: HashMap<String, u64>,
    /// Last-use tick to key; the first entry is the least recently used.
    recency: BTreeMap<u64, String>,
    tick: u64,
}

impl DedupCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::with_capacity(capacity),
            recency: BTreeMap::new(),
            tick: 0,
        }
    }

    /// Record a key. Returns true if it was already present, in which case its
    /// recency is refreshed.
    pub fn add(&mut self, key: &str) -> bool {
        if self.capacity == 0 {
            return false;
        }
        self.tick += 1;
        let tick = self.tick;

        if let Some(last_used) = self.entries.get_mut(key) {
            let previous = std::mem::replace(last_used, tick);
            if let Some(key) = self.recency.remove(&previous) {
                self.recency.insert(tick, key);
            }
            return true;
        }

        if self.entries.len() >= self.capacity
            && let Some((_, oldest)) = self.recency.pop_first()
        {
            self.entries.remove(&oldest);
        }
        self.entries.insert(key.to_string(), tick);
        self.recency.insert(tick, key.to_string());
        false
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.recency.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_reports_presence() {
        let mut cache = DedupCache::new(2);
        assert!(!cache.add("a"));
        assert!(cache.add("a"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_overflow_evicts_least_recently_used() {
        let mut cache = DedupCache::new(3);
        cache.add("a");
        cache.add("b");
        cache.add("c");
        cache.add("d");

        assert_eq!(cache.len(), 3);
        assert!(!cache.contains("a"));
        assert!(cache.contains("b"));
        assert!(cache.contains("c"));
        assert!(cache.contains("d"));
    }

    #[test]
    fn test_readd_refreshes_recency() {
        let mut cache = DedupCache::new(2);
        cache.add("a");
        cache.add("b");
        assert!(cache.add("a"));
        assert_eq!(cache.len(), 2);

        cache.add("c");
        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert!(cache.contains("c"));
    }

    #[test]
    fn test_zero_capacity_disables() {
        let mut cache = DedupCache::new(0);
        assert!(!cache.add("a"));
        assert!(!cache.add("a"));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_clear() {
        let mut cache = DedupCache::new(2);
        cache.add("a");
        cache.clear();
        assert!(cache.is_empty());
        assert!(!cache.add("a"));
    }
}
