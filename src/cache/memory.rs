// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Cost-bounded LRU memory tier.

use std::sync::{Arc, Mutex};

use indexmap::IndexMap;

use crate::sync::resilient_lock;
use crate::types::Image;

struct MemoryEntry {
    image: Arc<Image>,
    cost: u64,
}

/// Entries in recency order: index 0 is the least recently used.
struct MemoryInner {
    entries: IndexMap<String, MemoryEntry>,
    total_cost: u64,
}

/// In-memory image cache bounded by total decoded cost and entry count.
///
/// Every lookup updates recency, so reads take the same lock as writes.
pub struct MemoryCache {
    inner: Mutex<MemoryInner>,
    cost_limit: u64,
    count_limit: usize,
}

impl MemoryCache {
    /// `0` for either limit means unbounded.
    pub fn new(cost_limit: u64, count_limit: usize) -> Self {
        Self {
            inner: Mutex::new(MemoryInner {
                entries: IndexMap::new(),
                total_cost: 0,
            }),
            cost_limit,
            count_limit,
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<Image>> {
        let mut inner = resilient_lock(&self.inner);
        let index = inner.entries.get_index_of(key)?;
        let last = inner.entries.len() - 1;
        // Shifts the entries after `index` down by one.
        inner.entries.move_index(index, last);
        inner.entries.get_index(last).map(|(_, entry)| Arc::clone(&entry.image))
    }

    /// Presence check that leaves recency untouched.
    pub fn contains(&self, key: &str) -> bool {
        resilient_lock(&self.inner).entries.contains_key(key)
    }

    /// Insert and evict least recently used entries until within budget.
    pub fn insert(&self, key: impl Into<String>, image: Arc<Image>) {
        let key = key.into();
        let cost = image.cost();
        if self.cost_limit > 0 && cost > self.cost_limit {
            tracing::debug!(
                "Not caching {} in memory: cost {} exceeds limit {}",
                key,
                cost,
                self.cost_limit
            );
            self.remove(&key);
            return;
        }

        let mut inner = resilient_lock(&self.inner);
        if let Some(old) = inner.entries.shift_remove(&key) {
            inner.total_cost -= old.cost;
        }
        inner.entries.insert(key, MemoryEntry { image, cost });
        inner.total_cost += cost;

        while self.over_budget(&inner) {
            let Some((evicted, entry)) = inner.entries.shift_remove_index(0) else {
                break;
            };
            inner.total_cost -= entry.cost;
            tracing::debug!("Evicted {} from memory cache ({} bytes)", evicted, entry.cost);
        }
    }

    fn over_budget(&self, inner: &MemoryInner) -> bool {
        (self.cost_limit > 0 && inner.total_cost > self.cost_limit)
            || (self.count_limit > 0 && inner.entries.len() > self.count_limit)
    }

    pub fn remove(&self, key: &str) -> Option<Arc<Image>> {
        let mut inner = resilient_lock(&self.inner);
        let entry = inner.entries.shift_remove(key)?;
        inner.total_cost -= entry.cost;
        Some(entry.image)
    }

    pub fn clear(&self) {
        let mut inner = resilient_lock(&self.inner);
        inner.entries.clear();
        inner.total_cost = 0;
    }

    pub fn len(&self) -> usize {
        resilient_lock(&self.inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_cost(&self) -> u64 {
        resilient_lock(&self.inner).total_cost
    }

    pub fn cost_limit(&self) -> u64 {
        self.cost_limit
    }

    /// Keys from least to most recently used.
    pub fn keys(&self) -> Vec<String> {
        resilient_lock(&self.inner).entries.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ImageFormat;
    use image::RgbaImage;

    /// A 10x10 image costs 400 bytes.
    fn image() -> Arc<Image> {
        Arc::new(Image::still(ImageFormat::Png, RgbaImage::new(10, 10)))
    }

    #[test]
    fn test_lru_eviction_respects_budget() {
        let cache = MemoryCache::new(1000, 0);
        cache.insert("a", image());
        cache.insert("b", image());
        assert_eq!(cache.total_cost(), 800);

        // Touch "a" so "b" becomes least recently used.
        assert!(cache.get("a").is_some());
        cache.insert("c", image());

        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert!(cache.contains("c"));
        assert!(cache.total_cost() <= cache.cost_limit());
        assert_eq!(cache.keys(), vec!["a".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_get_moves_entry_to_most_recent() {
        let cache = MemoryCache::new(0, 3);
        for key in ["a", "b", "c"] {
            cache.insert(key, image());
        }

        assert!(cache.get("a").is_some());
        assert_eq!(cache.keys(), vec!["b", "c", "a"]);
        assert!(cache.get("a").is_some());
        assert_eq!(cache.keys(), vec!["b", "c", "a"]);
        assert!(cache.get("missing").is_none());

        cache.insert("d", image());
        assert_eq!(cache.keys(), vec!["c", "a", "d"]);
        assert_eq!(cache.total_cost(), 1200);
    }

    #[test]
    fn test_count_limit() {
        let cache = MemoryCache::new(0, 2);
        for key in ["a", "b", "c"] {
            cache.insert(key, image());
        }
        assert_eq!(cache.len(), 2);
        assert!(!cache.contains("a"));
    }

    #[test]
    fn test_oversized_entry_not_retained() {
        let cache = MemoryCache::new(100, 0);
        cache.insert("big", image());
        assert!(cache.is_empty());
        assert_eq!(cache.total_cost(), 0);
    }

    #[test]
    fn test_replace_updates_cost() {
        let cache = MemoryCache::new(0, 0);
        cache.insert("a", image());
        cache.insert("a", Arc::new(Image::still(ImageFormat::Png, RgbaImage::new(5, 5))));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.total_cost(), 100);

        assert!(cache.remove("a").is_some());
        assert_eq!(cache.total_cost(), 0);
        assert!(cache.remove("a").is_none());
    }
}
