//! Provides reference counted readers-writer locks on a per-key basis.
//!
//! The local store serializes mutations per key instead of per table, so operations on
//! distinct keys never block each other. A lock entry only lives while at least one
//! guard (or a task waiting for one) references its key; the table of locks therefore
//! stays proportional to the number of keys under contention, not the number of keys
//! stored.
//!
//! The guards are plain RAII values. There is no lock upgrade: read-to-write promotion
//! is spelled out by the caller as "drop the read guard, acquire the write guard",
//! which makes the promotion window explicit and rules out double releases by
//! construction (dropping a guard consumes it).
//!
//! The inner locks are `tokio::sync::RwLock`s because write guards are held across
//! await points (cache-aside loads and procedure invocations run under the key's
//! write lock).
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

type SlotMap = Arc<Mutex<HashMap<String, Slot>>>;

struct Slot {
    lock: Arc<RwLock<()>>,
    refs: usize,
}

/// A map from key to readers-writer lock.
///
/// Cloning is cheap and yields a handle onto the same lock table.
#[derive(Clone, Default)]
pub struct KeyedLock {
    slots: SlotMap,
}

/// Keeps a key's lock entry alive and gives it back once dropped.
///
/// This is split from the guards so that a task cancelled while waiting for the lock
/// still decrements the reference count.
struct Registration {
    slots: SlotMap,
    key: String,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut slots = self.slots.lock().unwrap();
        if let Some(slot) = slots.get_mut(&self.key) {
            slot.refs -= 1;
            if slot.refs == 0 {
                let _ = slots.remove(&self.key);
            }
        }
    }
}

/// Holds a key's lock for shared access until dropped.
pub struct KeyReadGuard {
    _guard: OwnedRwLockReadGuard<()>,
    _registration: Registration,
}

/// Holds a key's lock exclusively until dropped.
pub struct KeyWriteGuard {
    _guard: OwnedRwLockWriteGuard<()>,
    _registration: Registration,
}

impl KeyedLock {
    /// Creates an empty lock table.
    pub fn new() -> Self {
        KeyedLock::default()
    }

    fn register(&self, key: &str) -> (Arc<RwLock<()>>, Registration) {
        let mut slots = self.slots.lock().unwrap();
        let slot = slots.entry(key.to_owned()).or_insert_with(|| Slot {
            lock: Arc::new(RwLock::new(())),
            refs: 0,
        });
        slot.refs += 1;

        (
            slot.lock.clone(),
            Registration {
                slots: self.slots.clone(),
                key: key.to_owned(),
            },
        )
    }

    /// Acquires the read half of the given key's lock.
    pub async fn read(&self, key: &str) -> KeyReadGuard {
        let (lock, registration) = self.register(key);
        KeyReadGuard {
            _guard: lock.read_owned().await,
            _registration: registration,
        }
    }

    /// Acquires the write half of the given key's lock.
    pub async fn write(&self, key: &str) -> KeyWriteGuard {
        let (lock, registration) = self.register(key);
        KeyWriteGuard {
            _guard: lock.write_owned().await,
            _registration: registration,
        }
    }

    #[cfg(test)]
    fn active_keys(&self) -> usize {
        self.slots.lock().unwrap().len()
    }
}
