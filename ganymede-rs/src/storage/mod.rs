//! Storage engines which decide what a table keeps and what it evicts.
//!
//! A [Storage] is the victim-tracking data structure behind a local store: a map from
//! key to [Item] plus a replacement order. Three engines are provided:
//!
//! * [unbounded]: a plain concurrent map which never evicts,
//! * [lru]: least recently used with an entry-count threshold,
//! * [lfu]: least frequently used, falling back to LRU among equally counted keys.
//!
//! Engines apply their replacement policy *synchronously* inside [Storage::put]: when
//! a put pushes the engine over its threshold, victims are dropped before the call
//! returns, so a store never exceeds its threshold at rest. (An earlier design ran a
//! periodic sweeper task instead, which let stores overshoot between ticks.)
//!
//! The `skip_inc` flag on [Storage::get] and [Storage::put] suppresses the access
//! accounting of the replacement order. The local store uses it for cache-aside fills
//! and read-modify-write cycles, where several internal touches of a key must count as
//! a single user access.
use crate::item::Item;

mod lfu;
mod lru;

pub use lfu::Lfu;
pub use lru::Lru;

/// The capability interface shared by all storage engines.
///
/// Engines guard their replacement order with their own process-local lock and stay
/// correct under arbitrary concurrent interleavings of all four operations.
pub trait Storage: Send + Sync {
    /// Looks up the item stored for `key`.
    ///
    /// Unless `skip_inc` is set, the access advances the key in the replacement order.
    fn get(&self, key: &str, skip_inc: bool) -> Option<Item>;

    /// Stores `item` under `key` and reports whether the key was already present.
    ///
    /// Inserting advances the replacement order unless `skip_inc` is set (a brand new
    /// key always enters the order). Overflow victims are evicted before this returns.
    fn put(&self, key: &str, item: Item, skip_inc: bool) -> bool;

    /// Drops the given key and reports whether it existed.
    fn evict(&self, key: &str) -> bool;

    /// Advances the key in the replacement order without reading it.
    fn inc(&self, key: &str) -> bool;

    /// Returns the number of resident entries.
    fn len(&self) -> usize;

    /// Determines if no entries are resident.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the resident keys in no particular order.
    fn keys(&self) -> Vec<String>;
}

/// Creates an unbounded storage engine which grows until keys are explicitly evicted.
pub fn unbounded() -> Box<dyn Storage> {
    Box::new(Unbounded::default())
}

/// Creates an LRU storage engine which keeps at most `threshold` entries.
pub fn lru(threshold: usize) -> Box<dyn Storage> {
    Box::new(Lru::new(threshold))
}

/// Creates an LFU storage engine which keeps at most `threshold` entries.
pub fn lfu(threshold: usize) -> Box<dyn Storage> {
    Box::new(Lfu::new(threshold))
}

/// A map without any replacement policy. All order related calls short-circuit.
#[derive(Default)]
struct Unbounded {
    map: std::sync::RwLock<std::collections::HashMap<String, Item>>,
}

impl Storage for Unbounded {
    fn get(&self, key: &str, _skip_inc: bool) -> Option<Item> {
        self.map.read().unwrap().get(key).cloned()
    }

    fn put(&self, key: &str, item: Item, _skip_inc: bool) -> bool {
        self.map.write().unwrap().insert(key.to_owned(), item).is_some()
    }

    fn evict(&self, key: &str) -> bool {
        self.map.write().unwrap().remove(key).is_some()
    }

    fn inc(&self, _key: &str) -> bool {
        false
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
    use super::test_support::*;
    use super::*;

    #[test]
    fn unbounded_storage_never_evicts() {
        let storage = unbounded();
        for n in 0..1000 {
            let key = format!("key-{}", n);
            assert_eq!(storage.put(&key, item(&key, "value"), false), false);
        }

        assert_eq!(storage.len(), 1000);
        assert_eq!(value_of(storage.as_ref(), "key-999").as_deref(), Some("value"));

        assert_eq!(storage.evict("key-0"), true);
        assert_eq!(storage.evict("key-0"), false);
        assert_eq!(storage.len(), 999);
    }

    #[test]
    fn unbounded_storage_reports_replacements() {
        let storage = unbounded();
        assert_eq!(storage.put("key", item("key", "1"), false), false);
        assert_eq!(storage.put("key", item("key", "2"), false), true);
        assert_eq!(value_of(storage.as_ref(), "key").as_deref(), Some("2"));
    }
}
