//! The concurrency-controlled local store behind each table.
//!
//! A [Store] composes a [Storage](crate::storage::Storage) engine (which decides what
//! stays resident) with the per-key locks of [crate::keyed_lock] (which serialize
//! mutations per key) and an optional cache-aside loader. Values at this level are
//! always [Item]s; the typed world ends one layer above, in [crate::table].
//!
//! The read path is lock-optimistic: a get holds the key's read lock while consulting
//! storage and only trades it for the write lock when a miss (or an expired hit) has
//! to be filled through the loader. The promotion is an explicit release-and-reacquire;
//! between the two locks another task may fill the key first, in which case the
//! loader simply runs again and overwrites with an equivalent value. Callers which
//! need herd protection on top wrap the get in a single-flight group (the router
//! does).
//!
//! Loader fills are stored with `skip_inc` so the replacement policy counts the
//! triggering user access, not the internal refill.
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::cache::Error;
use crate::item::Item;
use crate::keyed_lock::KeyedLock;
use crate::storage::Storage;

/// The cache-aside loader: invoked on misses to produce the value and TTL for a key.
///
/// The loader runs under the key's write lock, so at most one load per key is in
/// flight at any time, and its error is handed to the caller unchanged.
pub type Getter = Arc<
    dyn Fn(String) -> Pin<Box<dyn Future<Output = Result<(Bytes, Duration), Error>> + Send>>
        + Send
        + Sync,
>;

/// A byte-level key-value store with per-key locking and optional auto-fill.
pub struct Store {
    locks: KeyedLock,
    storage: Box<dyn Storage>,
    getter: Option<Getter>,
}

impl Store {
    /// Creates a store over the given storage engine.
    pub fn new(storage: Box<dyn Storage>, getter: Option<Getter>) -> Store {
        Store {
            locks: KeyedLock::new(),
            storage,
            getter,
        }
    }

    /// Looks up the given key.
    ///
    /// Returns the stored item and whether it was a hit. A miss (or an expired entry)
    /// triggers the loader when one is configured; the filled item is returned with
    /// `hit = false`. Without a loader, misses yield the zero item.
    pub async fn get(&self, key: &str) -> Result<(Item, bool), Error> {
        let read_guard = self.locks.read(key).await;
        let found = self.storage.get(key, false);

        if let Some(item) = found.filter(|item| !item.is_expired()) {
            return Ok((item, true));
        }

        if self.getter.is_none() {
            return Ok((Item::zero(), false));
        }

        // Promote: release the read lock, then fill under the write lock. The guards
        // are single-use values, so neither lock can be released twice, even on the
        // error path of the loader.
        drop(read_guard);
        let _write_guard = self.locks.write(key).await;

        let item = self.load_locked(key).await?;
        Ok((item, false))
    }

    /// Stores the given item under `key`.
    pub async fn put(&self, key: &str, item: Item) {
        let _guard = self.locks.write(key).await;
        let _ = self.storage.put(key, item, false);
    }

    /// Drops the given key and reports whether it existed.
    pub async fn evict(&self, key: &str) -> bool {
        let _guard = self.locks.write(key).await;
        self.storage.evict(key)
    }

    /// Drops all given keys, each under its own key lock.
    ///
    /// This is deliberately not atomic across keys; concurrent operations may
    /// interleave between individual evictions.
    pub async fn evict_all(&self, keys: &[String]) {
        for key in keys {
            let _ = self.evict(key).await;
        }
    }

    /// Atomically reads, transforms and replaces the value for `key`.
    ///
    /// The whole cycle runs under the key's write lock, which makes this the one
    /// operation with a read-modify-write guarantee. On a miss the loader (when
    /// configured) fills the current value first, still under the same lock. The
    /// mutator receives the current value bytes (empty on a bare miss) and returns
    /// the replacement plus its TTL; if it fails, the store is left untouched.
    pub async fn update<F, Fut>(&self, key: &str, apply: F) -> Result<Item, Error>
    where
        F: FnOnce(Bytes) -> Fut,
        Fut: Future<Output = Result<(Bytes, Duration), Error>>,
    {
        let _guard = self.locks.write(key).await;

        let current = self.storage.get(key, true);
        let was_miss = current.is_none();
        let current = match current {
            Some(item) => item,
            None if self.getter.is_some() => self.load_locked(key).await?,
            None => Item::zero(),
        };

        let (value, ttl) = apply(current.value).await?;
        let item = Item::new(key, value, ttl);
        let _ = self.storage.put(key, item.clone(), was_miss);

        Ok(item)
    }

    /// Reads the given key without loader, policy accounting or expiry refill.
    ///
    /// Expired entries are reported as absent.
    pub async fn peek(&self, key: &str) -> Option<Item> {
        let _guard = self.locks.read(key).await;
        self.storage.get(key, true).filter(|item| !item.is_expired())
    }

    /// Returns the number of resident entries.
    pub fn len(&self) -> usize {
        self.storage.len()
    }

    /// Determines if the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// Runs the loader for `key` and stores the result. The caller must hold the
    /// key's write lock.
    async fn load_locked(&self, key: &str) -> Result<Item, Error> {
        let getter = match &self.getter {
            Some(getter) => getter.clone(),
            None => return Ok(Item::zero()),
        };

        let (value, ttl) = (getter)(key.to_owned()).await?;
        let item = Item::new(key, value, ttl);
        let _ = self.storage.put(key, item.clone(), true);

        Ok(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn item(key: &str, value: &str) -> Item {
        Item::new(key, Bytes::copy_from_slice(value.as_bytes()), Duration::ZERO)
    }

    fn fixed_getter(value: &'static str) -> Getter {
        Arc::new(move |_key| {
            Box::pin(async move { Ok((Bytes::from_static(value.as_bytes()), Duration::ZERO)) })
        })
    }

    #[tokio::test]
    async fn put_get_evict_round_trip() {
        let store = Store::new(storage::unbounded(), None);

        store.put("key", item("key", "value")).await;
        let (found, hit) = store.get("key").await.unwrap();
        assert_eq!(hit, true);
        assert_eq!(found.value.as_ref(), b"value");

        assert_eq!(store.evict("key").await, true);
        assert_eq!(store.evict("key").await, false);

        let (found, hit) = store.get("key").await.unwrap();
        assert_eq!(hit, false);
        assert_eq!(found.is_zero(), true);
    }

    #[tokio::test]
    async fn expired_entries_read_as_misses() {
        let store = Store::new(storage::unbounded(), None);

        let mut stale = item("key", "value");
        stale.expire = 1;
        store.put("key", stale).await;

        let (found, hit) = store.get("key").await.unwrap();
        assert_eq!(hit, false);
        assert_eq!(found.is_zero(), true);
        assert_eq!(store.peek("key").await, None);
    }

    #[tokio::test]
    async fn misses_are_filled_through_the_loader() {
        let store = Store::new(storage::unbounded(), Some(fixed_getter("empty")));

        // The first get misses and fills...
        let (found, hit) = store.get("key").await.unwrap();
        assert_eq!(hit, false);
        assert_eq!(found.value.as_ref(), b"empty");

        // ...the second one hits the filled value.
        let (found, hit) = store.get("key").await.unwrap();
        assert_eq!(hit, true);
        assert_eq!(found.value.as_ref(), b"empty");

        // Explicit values win until evicted, then the loader takes over again.
        store.put("key", item("key", "1")).await;
        let (found, hit) = store.get("key").await.unwrap();
        assert_eq!(hit, true);
        assert_eq!(found.value.as_ref(), b"1");

        let _ = store.evict("key").await;
        let (found, hit) = store.get("key").await.unwrap();
        assert_eq!(hit, false);
        assert_eq!(found.value.as_ref(), b"empty");
    }

    #[tokio::test]
    async fn loader_errors_leave_the_store_untouched() {
        let getter: Getter = Arc::new(|_key| {
            Box::pin(async { Err(Error::internal(anyhow::anyhow!("backend down"))) })
        });
        let store = Store::new(storage::unbounded(), Some(getter));

        assert_eq!(store.get("key").await.is_err(), true);
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn updates_transform_the_current_value() {
        let store = Store::new(storage::unbounded(), None);
        store.put("key", item("key", "1")).await;

        let updated = store
            .update("key", |current| async move {
                let mut next = current.to_vec();
                next.extend_from_slice(b"1");
                Ok((Bytes::from(next), Duration::ZERO))
            })
            .await
            .unwrap();

        assert_eq!(updated.value.as_ref(), b"11");
        let (found, _) = store.get("key").await.unwrap();
        assert_eq!(found.value.as_ref(), b"11");
    }

    #[tokio::test]
    async fn updates_fill_missing_values_through_the_loader() {
        let store = Store::new(storage::unbounded(), Some(fixed_getter("empty")));

        let updated = store
            .update("key", |current| async move {
                assert_eq!(current.as_ref(), b"empty");
                Ok((Bytes::from_static(b"changed"), Duration::ZERO))
            })
            .await
            .unwrap();

        assert_eq!(updated.value.as_ref(), b"changed");
    }

    #[tokio::test]
    async fn updates_on_bare_misses_see_empty_bytes() {
        let store = Store::new(storage::unbounded(), None);

        let updated = store
            .update("key", |current| async move {
                assert_eq!(current.is_empty(), true);
                Ok((Bytes::from_static(b"fresh"), Duration::ZERO))
            })
            .await
            .unwrap();

        assert_eq!(updated.value.as_ref(), b"fresh");
    }

    #[tokio::test]
    async fn failing_updates_do_not_mutate() {
        let store = Store::new(storage::unbounded(), None);
        store.put("key", item("key", "before")).await;

        let result = store
            .update("key", |_current| async move {
                Err(Error::internal(anyhow::anyhow!("rejected")))
            })
            .await;
        assert_eq!(result.is_err(), true);

        let (found, _) = store.get("key").await.unwrap();
        assert_eq!(found.value.as_ref(), b"before");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn updates_on_one_key_are_serialized() {
        let store = Arc::new(Store::new(storage::unbounded(), None));
        store.put("counter", item("counter", "0")).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    let _ = store
                        .update("counter", |current| async move {
                            let n: u64 =
                                String::from_utf8_lossy(&current).parse().unwrap();
                            Ok((Bytes::from((n + 1).to_string()), Duration::ZERO))
                        })
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let (found, _) = store.get("counter").await.unwrap();
        assert_eq!(found.value.as_ref(), b"400");
    }

    #[tokio::test]
    async fn loads_count_as_a_single_access_for_the_policy() {
        let counted = Arc::new(AtomicUsize::new(0));
        let getter: Getter = {
            let counted = counted.clone();
            Arc::new(move |_key| {
                let counted = counted.clone();
                Box::pin(async move {
                    let _ = counted.fetch_add(1, Ordering::SeqCst);
                    Ok((Bytes::from_static(b"loaded"), Duration::ZERO))
                })
            })
        };

        // An LRU with room for two: the loader fill of "a" must not out-rank the
        // explicit access order.
        let store = Store::new(storage::lru(2), Some(getter));

        let (_, hit) = store.get("a").await.unwrap();
        assert_eq!(hit, false);
        store.put("b", item("b", "B")).await;
        store.put("c", item("c", "C")).await;

        // "a" was the least recently used entry and got evicted...
        assert_eq!(store.peek("a").await, None);
        assert_eq!(counted.load(Ordering::SeqCst), 1);
    }
}
