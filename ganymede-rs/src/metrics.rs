//! Tracks per-table and cache-wide operation counters.
//!
//! Counters are only ever incremented on the *owner* of a key: when node A asks node B
//! for a key, B accounts the get (and a potential miss), A accounts nothing. This
//! keeps the numbers meaningful: every operation is counted exactly once in the
//! cluster, on the node which actually did the work.
//!
//! Each table carries its own [Counters] and additionally feeds the cache-wide
//! instance, so the cache total is always the sum over its tables. The hot counters
//! are atomics (procedure calls sit behind a short read-write lock as they are keyed
//! by name); [Counters::snapshot] produces the plain [Metrics] value handed to
//! callers.
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::RwLock;

/// A point-in-time copy of the counters of a table or a whole cache.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Metrics {
    /// Number of get operations which reached this node as owner.
    pub get: i64,

    /// Number of gets whose storage lookup came back empty (or expired).
    pub miss: i64,

    /// Number of put operations which reached this node as owner.
    pub put: i64,

    /// Number of evict operations, counted per key.
    pub evict: i64,

    /// Number of procedure invocations, keyed by procedure name.
    pub calls: HashMap<String, i64>,
}

/// The live, internally mutable counter set.
#[derive(Default)]
pub(crate) struct Counters {
    get: AtomicI64,
    miss: AtomicI64,
    put: AtomicI64,
    evict: AtomicI64,
    calls: RwLock<HashMap<String, i64>>,
}

impl Counters {
    pub fn inc_get(&self) {
        let _ = self.get.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_miss(&self) {
        let _ = self.miss.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_put(&self) {
        let _ = self.put.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_evict(&self, keys: i64) {
        let _ = self.evict.fetch_add(keys, Ordering::Relaxed);
    }

    pub fn inc_call(&self, procedure: &str) {
        let mut calls = self.calls.write().unwrap();
        *calls.entry(procedure.to_owned()).or_insert(0) += 1;
    }

    /// Produces a copy of the current counter values.
    pub fn snapshot(&self) -> Metrics {
        Metrics {
            get: self.get.load(Ordering::Relaxed),
            miss: self.miss.load(Ordering::Relaxed),
            put: self.put.load(Ordering::Relaxed),
            evict: self.evict.load(Ordering::Relaxed),
            calls: self.calls.read().unwrap().clone(),
        }
    }
}
