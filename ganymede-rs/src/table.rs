//! The typed, distributed table facade, i.e. the router of the cache.
//!
//! A [Table] is a named namespace over the shared cluster. Every operation first asks
//! the ring who owns the key: local keys run against the table's own
//! [Store](crate::store::Store), remote keys are forwarded to the owner through its
//! peer client. Both the get and the evict path are wrapped in a
//! [SingleFlight](crate::single_flight::SingleFlight) group per table, so a thundering
//! herd on one key collapses into a single store lookup or a single remote call.
//!
//! Values are typed at this boundary only: a [Codec] encodes them into the bytes that
//! storage, wire and hot cache operate on. Tables can further register named
//! *procedures*: mutators which the owner executes under the key's write lock, which
//! is what gives [Table::call] its at-most-one-concurrent-mutation-per-key guarantee.
//!
//! When a table is built with a hot cache, values obtained from *other* owners are
//! mirrored into a second, local-only store. [Table::get_hot] reads that mirror
//! without touching the network; the copy is owner-blind and best-effort (a put or
//! evict on the owner does not invalidate other peers' hot entries).
//!
//! Metrics discipline: counters are incremented in the `*_locally` methods and only
//! there, so every operation is accounted exactly once, on the owning node.
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::cache::{Cache, Error};
use crate::codec::{Codec, JsonCodec};
use crate::item::Item;
use crate::metrics::{Counters, Metrics};
use crate::single_flight::SingleFlight;
use crate::storage::Storage;
use crate::store::Store;

/// A registered mutator: receives the current value and the caller's arguments,
/// returns the replacement value and its TTL.
pub type Procedure<T> = Arc<
    dyn Fn(T, Bytes) -> Pin<Box<dyn Future<Output = Result<(T, Duration), Error>> + Send>>
        + Send
        + Sync,
>;

type TypedGetter<T> = Arc<
    dyn Fn(String) -> Pin<Box<dyn Future<Output = Result<(T, Duration), Error>> + Send>>
        + Send
        + Sync,
>;

/// The byte-level view of a table, used by the server to dispatch remote requests
/// without knowing the value type.
#[async_trait]
pub(crate) trait LocalTable: Send + Sync {
    fn name(&self) -> &str;

    fn metrics(&self) -> Metrics;

    async fn get_locally(&self, key: &str) -> Result<Item, Error>;

    async fn put_locally(&self, item: Item);

    async fn evict_locally(&self, key: &str);

    async fn evict_all_locally(&self, keys: Vec<String>);

    async fn call_locally(&self, key: &str, procedure: &str, args: Bytes)
        -> Result<Item, Error>;
}

struct TableInner<T, C> {
    name: String,
    cache: Weak<Cache>,
    counters: Arc<Counters>,
    cache_counters: Arc<Counters>,
    store: Store,
    hot_store: Option<Store>,
    procedures: HashMap<String, Procedure<T>>,
    get_flight: SingleFlight<Result<Item, Error>>,
    evict_flight: SingleFlight<Result<(), Error>>,
    codec: Arc<C>,
}

impl<T, C> TableInner<T, C>
where
    T: Default + Send + Sync + 'static,
    C: Codec<T>,
{
    async fn get_locally_impl(&self, key: &str) -> Result<Item, Error> {
        self.counters.inc_get();
        self.cache_counters.inc_get();

        self.get_flight
            .work(key, || async move {
                let (item, hit) = self.store.get(key).await?;
                if !hit {
                    self.counters.inc_miss();
                    self.cache_counters.inc_miss();
                }
                Ok(item)
            })
            .await
    }

    async fn put_locally_impl(&self, item: Item) {
        self.counters.inc_put();
        self.cache_counters.inc_put();

        let key = item.key.clone();
        self.store.put(&key, item).await;
    }

    async fn evict_locally_impl(&self, key: &str) {
        self.counters.inc_evict(1);
        self.cache_counters.inc_evict(1);

        let _ = self
            .evict_flight
            .work(key, || async move {
                let _ = self.store.evict(key).await;
                Ok(())
            })
            .await;
    }

    async fn evict_all_locally_impl(&self, keys: Vec<String>) {
        self.counters.inc_evict(keys.len() as i64);
        self.cache_counters.inc_evict(keys.len() as i64);

        self.store.evict_all(&keys).await;
    }

    async fn call_locally_impl(
        &self,
        key: &str,
        procedure: &str,
        args: Bytes,
    ) -> Result<Item, Error> {
        self.counters.inc_call(procedure);
        self.cache_counters.inc_call(procedure);

        let apply = self
            .procedures
            .get(procedure)
            .cloned()
            .ok_or(Error::ProcedureNotFound)?;
        let codec = self.codec.clone();

        self.store
            .update(key, |current| async move {
                let value = if current.is_empty() {
                    T::default()
                } else {
                    codec.decode(&current)?
                };

                let (next, ttl) = (apply)(value, args).await?;
                let bytes = codec.encode(&next)?;

                Ok((Bytes::from(bytes), ttl))
            })
            .await
    }
}

#[async_trait]
impl<T, C> LocalTable for TableInner<T, C>
where
    T: Default + Send + Sync + 'static,
    C: Codec<T>,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn metrics(&self) -> Metrics {
        self.counters.snapshot()
    }

    async fn get_locally(&self, key: &str) -> Result<Item, Error> {
        self.get_locally_impl(key).await
    }

    async fn put_locally(&self, item: Item) {
        self.put_locally_impl(item).await;
    }

    async fn evict_locally(&self, key: &str) {
        self.evict_locally_impl(key).await;
    }

    async fn evict_all_locally(&self, keys: Vec<String>) {
        self.evict_all_locally_impl(keys).await;
    }

    async fn call_locally(
        &self,
        key: &str,
        procedure: &str,
        args: Bytes,
    ) -> Result<Item, Error> {
        self.call_locally_impl(key, procedure, args).await
    }
}

/// The user-facing handle of a distributed table.
///
/// Cloning is cheap; all clones address the same table.
pub struct Table<T, C = JsonCodec<T>> {
    inner: Arc<TableInner<T, C>>,
}

impl<T, C> Clone for Table<T, C> {
    fn clone(&self) -> Self {
        Table {
            inner: self.inner.clone(),
        }
    }
}

impl<T, C> Table<T, C>
where
    T: Default + Send + Sync + 'static,
    C: Codec<T>,
{
    /// Returns the table name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns a snapshot of this table's counters.
    pub fn metrics(&self) -> Result<Metrics, Error> {
        let _ = self.cache()?;
        Ok(self.inner.counters.snapshot())
    }

    /// Fetches the value for `key`, wherever it lives.
    ///
    /// On the owner this consults the local store (filling through the table's getter
    /// on a miss); on any other node the request is forwarded to the owner. A genuine
    /// absence surfaces as [Error::KeyNotFound]; with a getter configured this only
    /// happens if the getter itself yields nothing.
    pub async fn get(&self, key: &str) -> Result<T, Error> {
        let cache = self.cache()?;
        let owner = cache.owner_of(key)?;

        let item = if cache.is_self(&owner) {
            self.inner.get_locally_impl(key).await?
        } else {
            let client = cache.client(&owner.id)?;
            self.inner
                .get_flight
                .work(key, || async move {
                    let (item, _hit) = client.get(&self.inner.name, key).await?;
                    self.mirror_hot(key, &item).await;
                    Ok(item)
                })
                .await?
        };

        if item.is_zero() {
            return Err(Error::KeyNotFound);
        }
        self.decode(&item)
    }

    /// Stores `value` under `key` on the owning node.
    ///
    /// A zero `ttl` stores the value without expiry.
    pub async fn put(&self, key: &str, value: T, ttl: Duration) -> Result<(), Error> {
        let cache = self.cache()?;

        let bytes = self.inner.codec.encode(&value)?;
        let item = Item::new(key, Bytes::from(bytes), ttl);

        let owner = cache.owner_of(key)?;
        if cache.is_self(&owner) {
            self.inner.put_locally_impl(item).await;
        } else {
            let client = cache.client(&owner.id)?;
            client.put(&self.inner.name, &item).await?;
            self.mirror_hot(key, &item).await;
        }

        Ok(())
    }

    /// Drops `key` on the owning node.
    pub async fn evict(&self, key: &str) -> Result<(), Error> {
        let cache = self.cache()?;
        let owner = cache.owner_of(key)?;

        if cache.is_self(&owner) {
            self.inner.evict_locally_impl(key).await;
            Ok(())
        } else {
            let client = cache.client(&owner.id)?;
            self.inner
                .evict_flight
                .work(key, || async move {
                    client.evict(&self.inner.name, key).await?;
                    if let Some(hot) = &self.inner.hot_store {
                        let _ = hot.evict(key).await;
                    }
                    Ok(())
                })
                .await
        }
    }

    /// Drops many keys at once, batching per owner.
    ///
    /// Local keys are evicted directly; one request per remote owner is issued in
    /// parallel. Failures are collected into [Error::PartialEviction], which names
    /// every key owned by a failed peer. Some of those may nevertheless have been
    /// evicted, so a retry is the appropriate reaction.
    pub async fn evict_all(&self, keys: &[String]) -> Result<(), Error> {
        let cache = self.cache()?;

        let mut local = Vec::new();
        let mut by_owner: HashMap<String, Vec<String>> = HashMap::new();
        for key in keys {
            let owner = cache.owner_of(key)?;
            if cache.is_self(&owner) {
                local.push(key.clone());
            } else {
                by_owner.entry(owner.id).or_default().push(key.clone());
            }
        }

        if !local.is_empty() {
            self.inner.evict_all_locally_impl(local).await;
        }

        let mut failed = Vec::new();
        let mut pending = Vec::new();
        for (owner_id, owner_keys) in by_owner {
            match cache.client(&owner_id) {
                Ok(client) => {
                    let table = self.inner.name.clone();
                    let request_keys = owner_keys.clone();
                    pending.push((
                        owner_keys,
                        tokio::spawn(async move {
                            client.evict_all(&table, &request_keys).await
                        }),
                    ));
                }
                Err(_) => failed.extend(owner_keys),
            }
        }

        for (owner_keys, handle) in pending {
            match handle.await {
                Ok(Ok(())) => (),
                _ => failed.extend(owner_keys),
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(Error::PartialEviction { keys: failed })
        }
    }

    /// Invokes the registered procedure `procedure` on the value stored for `key`.
    ///
    /// The owner runs the mutation under the key's write lock: read current value
    /// (filling through the getter on a miss), apply, store. No two mutations of one
    /// key ever run concurrently. The mutated value is returned.
    pub async fn call(&self, key: &str, procedure: &str, args: &[u8]) -> Result<T, Error> {
        let cache = self.cache()?;
        let owner = cache.owner_of(key)?;

        let item = if cache.is_self(&owner) {
            self.inner
                .call_locally_impl(key, procedure, Bytes::copy_from_slice(args))
                .await?
        } else {
            let client = cache.client(&owner.id)?;
            let item = client
                .call(&self.inner.name, key, procedure, args)
                .await?;
            self.mirror_hot(key, &item).await;
            item
        };

        self.decode(&item)
    }

    /// Reads a value without any network traffic.
    ///
    /// On the owner this peeks into the primary store (no getter, no metrics, no
    /// policy accounting); elsewhere it reads the hot cache, which never auto-fills.
    /// Absence surfaces as [Error::KeyNotFound].
    pub async fn get_hot(&self, key: &str) -> Result<T, Error> {
        let cache = self.cache()?;
        let owner = cache.owner_of(key)?;

        let item = if cache.is_self(&owner) {
            self.inner.store.peek(key).await
        } else {
            match &self.inner.hot_store {
                Some(hot) => {
                    let (item, hit) = hot.get(key).await?;
                    hit.then_some(item)
                }
                None => None,
            }
        };

        match item {
            Some(item) if !item.is_zero() => self.decode(&item),
            _ => Err(Error::KeyNotFound),
        }
    }

    fn cache(&self) -> Result<Arc<Cache>, Error> {
        match self.inner.cache.upgrade() {
            Some(cache) if !cache.is_destroyed() => Ok(cache),
            _ => Err(Error::CacheDestroyed),
        }
    }

    fn decode(&self, item: &Item) -> Result<T, Error> {
        if item.value.is_empty() {
            Ok(T::default())
        } else {
            self.inner.codec.decode(&item.value)
        }
    }

    /// Mirrors a remotely obtained item into the hot store, keyed by the *request*
    /// key. Responses for misses carry an empty key and are not cached.
    async fn mirror_hot(&self, key: &str, item: &Item) {
        if let Some(hot) = &self.inner.hot_store {
            if !item.is_zero() {
                let mirrored = Item {
                    key: key.to_owned(),
                    value: item.value.clone(),
                    expire: item.expire,
                };
                hot.put(key, mirrored).await;
            }
        }
    }
}

/// Assembles a [Table] and registers it on a [Cache].
///
/// # Example
///
/// ```no_run
/// # use ganymede::cache::{Cache, CacheOptions};
/// # use ganymede::member::Member;
/// # use ganymede::storage;
/// # use ganymede::table::TableBuilder;
/// # use std::time::Duration;
/// # #[tokio::main]
/// # async fn main() -> Result<(), ganymede::cache::Error> {
/// # let cache = Cache::new(Member::new("1", "127.0.0.1:2410"),
/// #                        vec![Member::new("1", "127.0.0.1:2410")], CacheOptions::default())?;
/// let table = TableBuilder::<u64>::new("counters")
///     .with_storage(storage::lru(10_000))
///     .with_getter(|_key| async { Ok((0, Duration::ZERO)) })
///     .with_procedure("add", |value, args: bytes::Bytes| async move {
///         let delta: u64 = String::from_utf8_lossy(&args).parse().unwrap_or(0);
///         Ok((value + delta, Duration::ZERO))
///     })
///     .build(&cache)?;
///
/// let visits = table.call("page-1", "add", b"1").await?;
/// # let _ = visits;
/// # Ok(())
/// # }
/// ```
pub struct TableBuilder<T, C = JsonCodec<T>> {
    name: String,
    storage: Option<Box<dyn Storage>>,
    hot_storage: Option<Box<dyn Storage>>,
    getter: Option<TypedGetter<T>>,
    procedures: HashMap<String, Procedure<T>>,
    codec: C,
}

impl<T> TableBuilder<T, JsonCodec<T>> {
    /// Starts building a table with the given name and the default JSON codec.
    pub fn new(name: impl Into<String>) -> Self {
        TableBuilder {
            name: name.into(),
            storage: None,
            hot_storage: None,
            getter: None,
            procedures: HashMap::new(),
            codec: JsonCodec::default(),
        }
    }
}

impl<T, C> TableBuilder<T, C>
where
    T: Default + Send + Sync + 'static,
    C: Codec<T>,
{
    /// Sets the cache-aside loader invoked for misses on the owner.
    pub fn with_getter<F, Fut>(mut self, getter: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(T, Duration), Error>> + Send + 'static,
    {
        self.getter = Some(Arc::new(move |key| Box::pin(getter(key))));
        self
    }

    /// Sets the storage policy of the primary store.
    ///
    /// One of [storage::lru](crate::storage::lru), [storage::lfu](crate::storage::lfu)
    /// or the default unbounded map.
    pub fn with_storage(mut self, storage: Box<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Enables the hot cache, backed by the given storage policy.
    ///
    /// The hot cache holds values this node fetched from *other* owners and is read
    /// exclusively through [Table::get_hot]. It is owner-blind: remote puts and
    /// evictions do not invalidate it.
    pub fn with_hot_cache(mut self, storage: Box<dyn Storage>) -> Self {
        self.hot_storage = Some(storage);
        self
    }

    /// Registers a procedure which [Table::call] can invoke by name.
    pub fn with_procedure<F, Fut>(mut self, name: impl Into<String>, procedure: F) -> Self
    where
        F: Fn(T, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(T, Duration), Error>> + Send + 'static,
    {
        let _ = self.procedures.insert(
            name.into(),
            Arc::new(move |value, args| Box::pin(procedure(value, args))),
        );
        self
    }

    /// Replaces the codec used to translate values into stored bytes.
    pub fn with_codec<C2: Codec<T>>(self, codec: C2) -> TableBuilder<T, C2> {
        TableBuilder {
            name: self.name,
            storage: self.storage,
            hot_storage: self.hot_storage,
            getter: self.getter,
            procedures: self.procedures,
            codec,
        }
    }

    /// Builds the table and registers it on the given cache.
    ///
    /// The same table (same name, same configuration) has to be built on every
    /// member of the cluster, as any of them may become the owner of its keys.
    pub fn build(self, cache: &Arc<Cache>) -> Result<Table<T, C>, Error> {
        cache.ensure_alive()?;

        let codec = Arc::new(self.codec);

        let getter = self.getter.map(|typed| {
            let codec = codec.clone();
            let getter: crate::store::Getter = Arc::new(move |key: String| {
                let typed = typed.clone();
                let codec = codec.clone();
                Box::pin(async move {
                    let (value, ttl) = (typed)(key).await?;
                    let bytes = codec.encode(&value)?;
                    Ok((Bytes::from(bytes), ttl))
                })
            });
            getter
        });

        let store = Store::new(
            self.storage.unwrap_or_else(crate::storage::unbounded),
            getter,
        );
        let hot_store = self.hot_storage.map(|storage| Store::new(storage, None));

        let inner = Arc::new(TableInner {
            name: self.name,
            cache: Arc::downgrade(cache),
            counters: Arc::new(Counters::default()),
            cache_counters: cache.counters(),
            store,
            hot_store,
            procedures: self.procedures,
            get_flight: SingleFlight::new(),
            evict_flight: SingleFlight::new(),
            codec,
        });

        cache.register_table(inner.clone());

        Ok(Table { inner })
    }
}
