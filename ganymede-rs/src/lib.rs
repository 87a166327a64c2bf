//! Ganymede is an embedded, distributed, in-process key-value cache.
//!
//! # Introduction
//! A process links **ganymede** as a library and joins a fixed cluster of peers.
//! Each peer is authoritative for a deterministic subset of keys, chosen by
//! consistent hashing over the shared membership: every node answers the full cache
//! API locally and silently forwards operations on non-local keys to the peer that
//! owns them. There is no coordinator and no discovery: the membership is handed
//! in (and can be replaced at runtime), and everything else follows from the ring.
//!
//! Values are typed per [table](crate::table): a pluggable [codec](crate::codec)
//! translates them to the bytes which storage, wire and hot cache operate on, so
//! the concurrent core is completely free of generics.
//!
//! # Features
//! * **Consistent-hash ring** with virtual nodes and atomic, copy-on-write
//!   membership replacement; lookups stay lock free ([crate::ring]).
//! * **Per-key concurrency control**: operations on distinct keys never contend;
//!   mutations and cache-aside fills serialize per key ([crate::keyed_lock],
//!   [crate::store]).
//! * **Pluggable eviction**: unbounded, LRU or LFU-with-LRU-tiebreak storage
//!   engines, applied synchronously on write ([crate::storage]).
//! * **Thundering-herd protection**: duplicate in-flight gets and evicts collapse
//!   into one execution ([crate::single_flight]).
//! * **Cache-aside loading**: a table-level getter fills misses on the owner, at
//!   most once per key at a time ([crate::table]).
//! * **Procedures**: named mutators executed on the owner under the key's write
//!   lock, giving atomic read-modify-write across the cluster ([crate::table]).
//! * **Hot cache**: an optional, owner-blind mirror of remotely fetched values for
//!   network-free reads ([crate::table]).
//! * **Simple wire protocol**: RESP-style framing over plain TCP with an
//!   allocation-conscious parser; every remote call is bounded by a configurable
//!   deadline ([crate::request], [crate::response]).
//!
//! # Getting started
//! ```no_run
//! use ganymede::cache::{Cache, CacheOptions};
//! use ganymede::member::Member;
//! use ganymede::storage;
//! use ganymede::table::TableBuilder;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ganymede::cache::Error> {
//!     let this = Member::new("node-1", "0.0.0.0:2410");
//!     let peers = vec![
//!         Member::new("node-2", "10.0.0.2:2410"),
//!         Member::new("node-3", "10.0.0.3:2410"),
//!     ];
//!
//!     let cache = Cache::new(this, peers, CacheOptions::default())?;
//!
//!     // Serve remote peers in the background...
//!     let server = cache.clone();
//!     tokio::spawn(async move { server.serve().await });
//!
//!     // A table of strings with an LRU bound and a loader for misses...
//!     let table = TableBuilder::<String>::new("greetings")
//!         .with_storage(storage::lru(65_536))
//!         .with_getter(|key| async move {
//!             Ok((format!("Hello {}!", key), Duration::from_secs(60)))
//!         })
//!         .build(&cache)?;
//!
//!     // ...used like a local map, wherever the key actually lives.
//!     let greeting = table.get("crater").await?;
//!     assert_eq!(greeting, "Hello crater!");
//!     Ok(())
//! }
//! ```
#![deny(
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces
)]
use simplelog::{format_description, ConfigBuilder, LevelFilter, SimpleLogger};
use std::sync::Once;

pub mod average;
pub mod cache;
mod client;
pub mod codec;
pub mod fmt;
pub mod item;
pub mod keyed_lock;
pub mod member;
pub mod metrics;
pub mod request;
pub mod response;
pub mod ring;
mod server;
pub mod single_flight;
pub mod storage;
pub mod store;
pub mod table;

/// Contains the version of the ganymede library.
pub const GANYMEDE_VERSION: &str = "DEVELOPMENT-SNAPSHOT";

/// Contains the git commit hash of the ganymede build being used.
pub const GANYMEDE_REVISION: &str = "NO-REVISION";

/// Initializes the logging system.
///
/// Logs to stdout with a timestamp format digestible by common log shippers. Safe to
/// call several times (only the first call installs the logger, which matters for
/// integration tests).
pub fn init_logging() {
    static INIT_LOGGING: Once = Once::new();

    INIT_LOGGING.call_once(|| {
        if let Err(error) = SimpleLogger::init(
            LevelFilter::Debug,
            ConfigBuilder::new()
                .set_time_format_custom(format_description!(
                    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]"
                ))
                .set_thread_level(LevelFilter::Trace)
                .set_target_level(LevelFilter::Error)
                .set_location_level(LevelFilter::Trace)
                .build(),
        ) {
            panic!("Failed to initialize logging system: {}", error);
        }
    });
}

/// Provides a simple macro to execute an async lambda within `tokio::spawn`.
///
/// Note that this also applies std::mem::drop on the returned join handle to make
/// clippy happy.
///
/// # Example
/// ```rust
/// # #[macro_use] extern crate ganymede;
/// # #[tokio::main]
/// # async fn main() {
/// spawn!(async move {
///     // perform some async stuff here...
/// });
/// # }
/// ```
#[macro_export]
macro_rules! spawn {
    ($e:expr) => {{
        std::mem::drop(tokio::spawn($e));
    }};
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::cache::Cache;
    use std::sync::atomic::{AtomicU16, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::time::Duration;

    lazy_static::lazy_static! {
        /// Guards resources shared between tests, most notably the fixed port on
        /// which the wire level integration test starts its server. Tests touching
        /// those acquire this lock; everything else runs in parallel.
        pub static ref SHARED_TEST_RESOURCES: Mutex<()> = Mutex::new(());
    }

    /// The fixed address used by the wire level integration test.
    pub const TEST_SERVER_ADDR: &str = "127.0.0.1:1611";

    /// Hands out process-unique loopback addresses for multi-node tests.
    pub fn unique_addr() -> String {
        static NEXT_PORT: AtomicU16 = AtomicU16::new(51000);
        format!("127.0.0.1:{}", NEXT_PORT.fetch_add(1, Ordering::SeqCst))
    }

    /// Executes async code within a single threaded tokio runtime.
    pub fn test_async<F: std::future::Future>(future: F) {
        use tokio::runtime;

        let rt = runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let _ = rt.block_on(future);
    }

    /// Waits until all peers of the given cache answer health checks.
    pub async fn wait_for_server(cache: &Arc<Cache>) {
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            if cache.health_check_peers().await.is_ok() {
                return;
            }
            if std::time::Instant::now() > deadline {
                panic!("peers did not become healthy within 5s");
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Executes a blocking redis query against the test server asynchronously.
    ///
    /// The redis client is only used as an independent wire-level probe. We must
    /// not block the runtime, hence `spawn_blocking`.
    pub async fn query_redis_async<T, Q>(query: Q) -> Option<T>
    where
        Q: FnOnce(&mut redis::Connection) -> Result<T, redis::RedisError> + Send + Sync + 'static,
        T: Send + 'static,
    {
        let result = tokio::task::spawn_blocking(|| {
            let client = redis::Client::open(format!("redis://{}", TEST_SERVER_ADDR)).unwrap();
            let mut con = client
                .get_connection_with_timeout(Duration::from_secs(5))
                .unwrap();
            query(&mut con)
        })
        .await;

        match result {
            Ok(Ok(result)) => Some(result),
            _ => None,
        }
    }
}
