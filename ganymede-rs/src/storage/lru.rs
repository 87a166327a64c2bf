//! The least-recently-used storage engine.
//!
//! Internally this is a `LinkedHashMap` whose iteration order doubles as the
//! replacement order: the front holds the least recently used entry, the back the most
//! recently used one. Reads and writes which count as an access move the entry to the
//! back; eviction pops from the front until the engine is back at its threshold.
//!
//! Reads are lock-optimistic: a get first takes the shared lock to fetch the value and
//! only upgrades to the exclusive lock to move the entry. Since the upgrade is a
//! release-and-reacquire, the entry may have been evicted in between, so its presence
//! is re-checked and the move is simply skipped if the key vanished.
use std::sync::RwLock;

use linked_hash_map::LinkedHashMap;

use super::Storage;
use crate::item::Item;

/// LRU storage with an entry-count threshold.
pub struct Lru {
    threshold: usize,
    map: RwLock<LinkedHashMap<String, Item>>,
}

impl Lru {
    /// Creates an engine which keeps at most `threshold` entries.
    pub fn new(threshold: usize) -> Self {
        Lru {
            threshold,
            map: RwLock::new(LinkedHashMap::new()),
        }
    }
}

impl Storage for Lru {
    fn get(&self, key: &str, skip_inc: bool) -> Option<Item> {
        if skip_inc {
            return self.map.read().unwrap().get(key).cloned();
        }

        let item = self.map.read().unwrap().get(key).cloned()?;

        // Upgrade to move the entry to the back. The key may have raced an evict
        // across the upgrade, in which case the order update is skipped.
        let _ = self.map.write().unwrap().get_refresh(key);

        Some(item)
    }

    fn put(&self, key: &str, item: Item, skip_inc: bool) -> bool {
        let mut map = self.map.write().unwrap();

        let existed = map.contains_key(key);
        if existed && skip_inc {
            // Replace in place without touching the order.
            if let Some(slot) = map.get_mut(key) {
                *slot = item;
            }
        } else {
            // New keys always enter the order; refreshed keys move to the back.
            let _ = map.insert(key.to_owned(), item);
        }

        while map.len() > self.threshold {
            match map.pop_front() {
                Some(_victim) => (),
                None => unreachable!("over threshold but nothing left to evict"),
            }
        }

        existed
    }

    fn evict(&self, key: &str) -> bool {
        self.map.write().unwrap().remove(key).is_some()
    }

    fn inc(&self, key: &str) -> bool {
        self.map.write().unwrap().get_refresh(key).is_some()
    }

    fn len(&self) -> usize {
        self.map.read().unwrap().len()
    }

    fn keys(&self) -> Vec<String> {
        self.map.read().unwrap().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::{lru, Storage};
    use std::sync::Arc;

    #[test]
    fn least_recently_used_keys_are_evicted_first() {
        let storage = lru(3);

        // Touch keys in a known order and verify the eviction order follows it...
        for (key, value) in [
            ("1", "0"),
            ("2", "1"),
            ("3", "2"),
            ("2", "3"),
            ("1", "4"),
            ("1", "5"),
            ("4", "6"),
            ("2", "7"),
            ("3", "8"),
        ] {
            let _ = storage.put(key, item(key, value), false);
        }

        assert_eq!(storage.len(), 3);
        assert_eq!(value_of(storage.as_ref(), "2").as_deref(), Some("7"));
        assert_eq!(value_of(storage.as_ref(), "3").as_deref(), Some("8"));
        assert_eq!(value_of(storage.as_ref(), "4").as_deref(), Some("6"));
        assert_eq!(storage.get("1", true), None);
    }

    #[test]
    fn reads_refresh_the_replacement_order() {
        let storage = lru(2);

        let _ = storage.put("a", item("a", "A"), false);
        let _ = storage.put("b", item("b", "B"), false);

        // Reading "a" saves it; the subsequent insert pushes "b" out instead...
        let _ = storage.get("a", false);
        let _ = storage.put("c", item("c", "C"), false);

        let mut keys = storage.keys();
        keys.sort();
        assert_eq!(keys, vec!["a", "c"]);
    }

    #[test]
    fn skipped_accesses_leave_the_order_untouched() {
        let storage = lru(2);

        let _ = storage.put("a", item("a", "A"), false);
        let _ = storage.put("b", item("b", "B"), false);

        // A skip-inc read of "a" and a skip-inc overwrite of "a" must not save it...
        let _ = storage.get("a", true);
        let _ = storage.put("a", item("a", "A2"), true);
        let _ = storage.put("c", item("c", "C"), false);

        let mut keys = storage.keys();
        keys.sort();
        assert_eq!(keys, vec!["b", "c"]);
    }

    #[test]
    fn explicit_eviction_frees_a_slot() {
        let storage = lru(2);

        let _ = storage.put("a", item("a", "A"), false);
        let _ = storage.put("b", item("b", "B"), false);
        assert_eq!(storage.evict("a"), true);
        assert_eq!(storage.evict("a"), false);

        let _ = storage.put("c", item("c", "C"), false);
        assert_eq!(storage.len(), 2);
        assert_eq!(value_of(storage.as_ref(), "b").as_deref(), Some("B"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn survives_concurrent_access() {
        let storage = Arc::new(lru(128));
        hammer(storage.clone()).await;
        assert_eq!(storage.len() <= 128, true);
    }
}
