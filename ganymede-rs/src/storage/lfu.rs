//! The least-frequently-used storage engine.
//!
//! Entries are grouped into frequency buckets: a `BTreeMap` keyed by access count,
//! where each bucket is a `LinkedHashMap` holding the keys which were accessed that
//! many times, in the order they entered the bucket. An access moves a key from its
//! current bucket to the `count + 1` bucket; a fresh insert joins the count-1 bucket.
//!
//! The eviction victim is the front entry of the lowest-count bucket: the least
//! frequently used key, falling back to least-recently-promoted among keys with the
//! same count. Keeping each bucket recency-ordered is what makes the tie break
//! deterministic.
//!
//! Lock discipline matches [super::Lru]: one process-local `RwLock` around the whole
//! structure, lock-optimistic reads which re-check presence after upgrading.
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use linked_hash_map::LinkedHashMap;

use super::Storage;
use crate::item::Item;

struct Entry {
    item: Item,
    count: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    buckets: BTreeMap<u64, LinkedHashMap<String, ()>>,
}

impl Inner {
    /// Moves the given key from its current bucket into the next higher one.
    fn promote(&mut self, key: &str) {
        let count = match self.entries.get_mut(key) {
            Some(entry) => {
                entry.count += 1;
                entry.count
            }
            None => return,
        };

        self.remove_from_bucket(count - 1, key);
        let _ = self
            .buckets
            .entry(count)
            .or_default()
            .insert(key.to_owned(), ());
    }

    /// Places a brand new key into the count-1 bucket.
    fn insert(&mut self, key: &str, item: Item) {
        let _ = self.entries.insert(key.to_owned(), Entry { item, count: 1 });
        let _ = self.buckets.entry(1).or_default().insert(key.to_owned(), ());
    }

    fn remove_from_bucket(&mut self, count: u64, key: &str) {
        if let Some(bucket) = self.buckets.get_mut(&count) {
            let _ = bucket.remove(key);
            if bucket.is_empty() {
                let _ = self.buckets.remove(&count);
            }
        }
    }

    /// Evicts from the lowest bucket until the size constraint holds again.
    fn apply_policy(&mut self, threshold: usize) {
        while self.entries.len() > threshold {
            let count = match self.buckets.keys().next() {
                Some(count) => *count,
                None => unreachable!("over threshold but no buckets left"),
            };

            let victim = self
                .buckets
                .get_mut(&count)
                .and_then(|bucket| bucket.pop_front());
            match victim {
                Some((key, _)) => {
                    let _ = self.entries.remove(&key);
                    if self.buckets.get(&count).map(|b| b.is_empty()).unwrap_or(false) {
                        let _ = self.buckets.remove(&count);
                    }
                }
                None => unreachable!("lowest bucket was empty"),
            }
        }
    }
}

/// LFU storage with an entry-count threshold and LRU tie break.
pub struct Lfu {
    threshold: usize,
    inner: RwLock<Inner>,
}

impl Lfu {
    /// Creates an engine which keeps at most `threshold` entries.
    pub fn new(threshold: usize) -> Self {
        Lfu {
            threshold,
            inner: RwLock::new(Inner::default()),
        }
    }
}

impl Storage for Lfu {
    fn get(&self, key: &str, skip_inc: bool) -> Option<Item> {
        if skip_inc {
            return self
                .inner
                .read()
                .unwrap()
                .entries
                .get(key)
                .map(|entry| entry.item.clone());
        }

        let item = self
            .inner
            .read()
            .unwrap()
            .entries
            .get(key)
            .map(|entry| entry.item.clone())?;

        // Upgrade to bump the frequency; skipped if the key raced an evict.
        self.inner.write().unwrap().promote(key);

        Some(item)
    }

    fn put(&self, key: &str, item: Item, skip_inc: bool) -> bool {
        let mut inner = self.inner.write().unwrap();

        let existed = match inner.entries.get_mut(key) {
            Some(entry) => {
                entry.item = item;
                true
            }
            None => {
                inner.insert(key, item);
                false
            }
        };

        if existed {
            if !skip_inc {
                inner.promote(key);
            }
        } else {
            inner.apply_policy(self.threshold);
        }

        existed
    }

    fn evict(&self, key: &str) -> bool {
        let mut inner = self.inner.write().unwrap();
        match inner.entries.remove(key) {
            Some(entry) => {
                inner.remove_from_bucket(entry.count, key);
                true
            }
            None => false,
        }
    }

    fn inc(&self, key: &str) -> bool {
        let mut inner = self.inner.write().unwrap();
        if inner.entries.contains_key(key) {
            inner.promote(key);
            true
        } else {
            false
        }
    }

    fn len(&self) -> usize {
        self.inner.read().unwrap().entries.len()
    }

    fn keys(&self) -> Vec<String> {
        self.inner.read().unwrap().entries.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::{lfu, Storage};
    use std::sync::Arc;

    #[test]
    fn least_frequently_used_keys_are_evicted_first() {
        let storage = lfu(2);

        // "1" is written three times, "2" three times, "3" only ever once before the
        // engine overflows, so "3" is sacrificed both times...
        let mut evicted = Vec::new();
        for (key, value) in [
            ("1", "a"),
            ("1", "b"),
            ("1", "c"),
            ("2", "d"),
            ("2", "e"),
            ("3", "f"),
            ("2", "g"),
            ("3", "h"),
        ] {
            let mut tracked = storage.keys();
            if !tracked.iter().any(|k| k == key) {
                tracked.push(key.to_owned());
            }
            let _ = storage.put(key, item(key, value), false);
            for gone in tracked.iter().filter(|k| storage.get(k, true).is_none()) {
                evicted.push(gone.clone());
            }
        }

        assert_eq!(evicted, vec!["3", "3"]);

        let mut keys = storage.keys();
        keys.sort();
        assert_eq!(keys, vec!["1", "2"]);
        assert_eq!(value_of(storage.as_ref(), "1").as_deref(), Some("c"));
        assert_eq!(value_of(storage.as_ref(), "2").as_deref(), Some("g"));
    }

    #[test]
    fn frequency_ties_fall_back_to_recency() {
        let storage = lfu(2);

        // "a" and "b" both carry count 1; "a" has been in the bucket longer and is
        // therefore the victim...
        let _ = storage.put("a", item("a", "A"), false);
        let _ = storage.put("b", item("b", "B"), false);
        let _ = storage.put("c", item("c", "C"), false);

        let mut keys = storage.keys();
        keys.sort();
        assert_eq!(keys, vec!["b", "c"]);
    }

    #[test]
    fn frequent_keys_survive_newer_ones() {
        let storage = lfu(2);

        let _ = storage.put("hot", item("hot", "H"), false);
        let _ = storage.get("hot", false);
        let _ = storage.get("hot", false);
        let _ = storage.put("cold", item("cold", "C"), false);
        let _ = storage.put("new", item("new", "N"), false);

        // "cold" (count 1) loses against "hot" (count 3)...
        let mut keys = storage.keys();
        keys.sort();
        assert_eq!(keys, vec!["hot", "new"]);
    }

    #[test]
    fn skipped_accesses_do_not_bump_the_frequency() {
        let storage = lfu(2);

        let _ = storage.put("a", item("a", "A"), false);
        for _ in 0..10 {
            let _ = storage.get("a", true);
        }
        let _ = storage.put("a", item("a", "A2"), true);

        let _ = storage.put("b", item("b", "B"), false);
        let _ = storage.get("b", false);
        let _ = storage.put("c", item("c", "C"), false);

        // Despite the many skip-inc reads, "a" still counts as touched once and is
        // the eviction victim...
        let mut keys = storage.keys();
        keys.sort();
        assert_eq!(keys, vec!["b", "c"]);
    }

    #[test]
    fn eviction_removes_bucket_entries() {
        let storage = lfu(3);

        let _ = storage.put("a", item("a", "A"), false);
        let _ = storage.get("a", false);
        assert_eq!(storage.evict("a"), true);
        assert_eq!(storage.evict("a"), false);
        assert_eq!(storage.len(), 0);

        // A fresh insert after the evict starts from scratch...
        let _ = storage.put("a", item("a", "A2"), false);
        assert_eq!(value_of(storage.as_ref(), "a").as_deref(), Some("A2"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn survives_concurrent_access() {
        let storage = Arc::new(lfu(128));
        hammer(storage.clone()).await;
        assert_eq!(storage.len() <= 128, true);
    }
}
