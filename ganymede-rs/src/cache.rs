//! The process-wide cache root: membership, peer clients, tables and metrics.
//!
//! A [Cache] is created once per process. It owns the consistent-hash [Ring], one
//! [Client](crate::client::Client) per peer, the registry of named tables and the
//! cache-wide counters. Tables are created through
//! [TableBuilder](crate::table::TableBuilder) and hold a non-owning reference back to
//! their cache; the cache in turn keeps a type-erased handle per table so the server
//! can dispatch remote requests onto it. This arena-style indirection is what breaks
//! the ownership cycle between the two.
//!
//! Membership is fixed but replaceable: [Cache::set_peers] validates the new set,
//! swaps the ring atomically and reconciles the client pool: clients of vanished
//! peers are closed, new peers get fresh clients, surviving ones are left alone, so
//! repeating a `set_peers` with the current membership is a no-op.
//!
//! After [Cache::tear_down] every operation on the cache or any of its tables fails
//! with [Error::CacheDestroyed].
//!
//! # Example
//!
//! ```no_run
//! # use ganymede::cache::{Cache, CacheOptions};
//! # use ganymede::member::Member;
//! # use ganymede::table::TableBuilder;
//! # #[tokio::main]
//! # async fn main() -> Result<(), ganymede::cache::Error> {
//! let this = Member::new("node-1", "127.0.0.1:2410");
//! let cache = Cache::new(this, vec![Member::new("node-2", "127.0.0.1:2411")],
//!                        CacheOptions::default())?;
//!
//! let table: ganymede::table::Table<String, _> =
//!     TableBuilder::new("sessions").build(&cache)?;
//!
//! // Serve remote peers in the background...
//! let server = cache.clone();
//! tokio::spawn(async move { server.serve().await });
//!
//! table.put("alice", "logged-in".to_owned(), std::time::Duration::ZERO).await?;
//! # Ok(())
//! # }
//! ```
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::client::Client;
use crate::member::{validate_members, Member};
use crate::metrics::{Counters, Metrics};
use crate::ring::{default_hash_fn, HashFn, Ring};
use crate::server::Server;
use crate::table::LocalTable;

/// Enumerates the errors surfaced by the cache and its tables.
///
/// The type is cheap to clone so that a failure can be fanned out to every caller
/// joined onto the same in-flight operation.
#[derive(Clone, Debug)]
pub enum Error {
    /// The requested key is not present (and no loader could supply it).
    KeyNotFound,

    /// The invoked procedure was never registered on this table.
    ProcedureNotFound,

    /// The addressed table is unknown on the receiving node.
    TableNotFound,

    /// Two members of a membership set share an id or an address.
    DuplicatePeer(String),

    /// A membership set without any members was supplied.
    MissingMembers,

    /// A member's address does not parse as `host:port`.
    InvalidPeerAddr(String),

    /// The cache (or the table's cache) has been torn down.
    CacheDestroyed,

    /// A batched eviction failed for some owners.
    ///
    /// Carries every key owned by a peer whose request failed. Those keys *may* in
    /// fact have been evicted; the surface is deliberately conservative, and
    /// retrying the eviction is idempotent.
    PartialEviction {
        /// The keys whose eviction state is unknown.
        keys: Vec<String>,
    },

    /// A transport, codec or loader failure; the underlying error is preserved.
    Internal(Arc<anyhow::Error>),
}

impl Error {
    /// Wraps an arbitrary failure as [Error::Internal].
    pub(crate) fn internal(err: impl Into<anyhow::Error>) -> Error {
        Error::Internal(Arc::new(err.into()))
    }

    /// Returns the code word this error travels under in protocol error replies.
    pub(crate) fn wire_code(&self) -> &'static str {
        match self {
            Error::KeyNotFound => "KEY_NOT_FOUND",
            Error::ProcedureNotFound => "PROCEDURE_NOT_FOUND",
            Error::TableNotFound => "TABLE_NOT_FOUND",
            Error::CacheDestroyed => "CACHE_DESTROYED",
            _ => "SERVER",
        }
    }

    /// Reconstructs an error from a protocol error reply.
    ///
    /// The typed sentinels survive the round trip; everything else comes back as
    /// [Error::Internal] carrying the peer's message.
    pub(crate) fn from_wire(message: &str) -> Error {
        let code = message.split(' ').next().unwrap_or("");
        match code {
            "KEY_NOT_FOUND" => Error::KeyNotFound,
            "PROCEDURE_NOT_FOUND" => Error::ProcedureNotFound,
            "TABLE_NOT_FOUND" => Error::TableNotFound,
            "CACHE_DESTROYED" => Error::CacheDestroyed,
            _ => Error::internal(anyhow::anyhow!("peer replied with an error: {}", message)),
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::KeyNotFound => write!(f, "key not found"),
            Error::ProcedureNotFound => write!(f, "procedure not found"),
            Error::TableNotFound => write!(f, "table not found"),
            Error::DuplicatePeer(what) => write!(f, "duplicate peer detected for {}", what),
            Error::MissingMembers => write!(f, "peers must contain at least one member"),
            Error::InvalidPeerAddr(addr) => write!(f, "invalid peer address '{}'", addr),
            Error::CacheDestroyed => write!(f, "cache has been torn down"),
            Error::PartialEviction { keys } => {
                write!(f, "eviction may be incomplete for {} key(s)", keys.len())
            }
            Error::Internal(err) => write!(f, "{:#}", err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Internal(err) => {
                let source: &(dyn std::error::Error + Send + Sync + 'static) =
                    err.as_ref().as_ref();
                Some(source)
            }
            _ => None,
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::internal(err)
    }
}

/// Tunables applied when creating a [Cache].
pub struct CacheOptions {
    virtual_nodes: usize,
    timeout: Duration,
    hash_fn: Option<HashFn>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        CacheOptions {
            virtual_nodes: 32,
            timeout: Duration::from_secs(3),
            hash_fn: None,
        }
    }
}

impl CacheOptions {
    /// Sets the number of ring points per member. Defaults to 32.
    pub fn with_virtual_nodes(mut self, virtual_nodes: usize) -> Self {
        self.virtual_nodes = virtual_nodes;
        self
    }

    /// Sets the per-call deadline for requests to other peers. Defaults to 3s.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Replaces the ring hash function. Defaults to [default_hash_fn].
    pub fn with_hash_fn(mut self, hash_fn: HashFn) -> Self {
        self.hash_fn = Some(hash_fn);
        self
    }
}

/// The root object owning everything a node contributes to the cluster.
pub struct Cache {
    this: Member,
    ring: Ring,
    clients: Mutex<HashMap<String, Arc<Client>>>,
    tables: Mutex<HashMap<String, Arc<dyn LocalTable>>>,
    counters: Arc<Counters>,
    timeout: Duration,
    server: Server,
    destroyed: AtomicBool,
}

impl Cache {
    /// Creates a new cache node.
    ///
    /// `this` is the local member; it is added to `peers` if missing. The membership
    /// set is validated as described in [crate::member]. Note that this does not yet
    /// serve remote requests; spawn [Cache::serve] for that.
    pub fn new(
        this: Member,
        peers: Vec<Member>,
        options: CacheOptions,
    ) -> Result<Arc<Cache>, Error> {
        let members = validate_members(&this, &peers)?;
        let hash_fn = options.hash_fn.unwrap_or_else(default_hash_fn);
        let ring = Ring::new(members.clone(), options.virtual_nodes, hash_fn)?;

        let cache = Arc::new_cyclic(|weak: &Weak<Cache>| Cache {
            server: Server::new(weak.clone(), this.addr.clone()),
            this,
            ring,
            clients: Mutex::new(HashMap::new()),
            tables: Mutex::new(HashMap::new()),
            counters: Arc::new(Counters::default()),
            timeout: options.timeout,
            destroyed: AtomicBool::new(false),
        });

        cache.reconcile_clients(&members);

        Ok(cache)
    }

    /// Replaces the cluster membership.
    ///
    /// Validates the new set, swaps the ring atomically and reconciles the peer
    /// client pool. Calling this with the current membership is a no-op, so it is
    /// safe to invoke from a periodic config refresh.
    pub fn set_peers(&self, peers: Vec<Member>) -> Result<(), Error> {
        self.ensure_alive()?;

        let members = validate_members(&self.this, &peers)?;
        self.ring.set_members(members.clone())?;
        self.reconcile_clients(&members);

        Ok(())
    }

    /// Serves the cache protocol for remote peers until the cache is torn down.
    ///
    /// Most callers spawn this right after creating the cache.
    pub async fn serve(self: &Arc<Cache>) -> Result<(), Error> {
        self.ensure_alive()?;
        self.server.event_loop().await;
        Ok(())
    }

    /// Tears the cache down.
    ///
    /// Stops the server, closes every peer client and drops all tables. Afterwards
    /// every operation on this cache or any table built on it fails with
    /// [Error::CacheDestroyed].
    pub fn tear_down(&self) -> Result<(), Error> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Err(Error::CacheDestroyed);
        }

        self.server.stop();
        for (_, client) in self.clients.lock().unwrap().drain() {
            client.close();
        }
        self.tables.lock().unwrap().clear();

        Ok(())
    }

    /// Pings every peer (including the local server) and joins the failures.
    ///
    /// Useful to await cluster readiness after startup.
    pub async fn health_check_peers(&self) -> Result<(), Error> {
        self.ensure_alive()?;

        let clients: Vec<Arc<Client>> = self.clients.lock().unwrap().values().cloned().collect();

        let mut failures = Vec::new();
        for client in clients {
            if let Err(err) = client.ping().await {
                failures.push(err.to_string());
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::internal(anyhow::anyhow!(
                "peer health check failed: {}",
                failures.join("; ")
            )))
        }
    }

    /// Returns a snapshot of the cache-wide counters (the sum over all tables).
    pub fn metrics(&self) -> Result<Metrics, Error> {
        self.ensure_alive()?;
        Ok(self.counters.snapshot())
    }

    /// Returns the local member.
    pub fn self_member(&self) -> &Member {
        &self.this
    }

    /// Returns the current membership, sorted by id.
    pub fn members(&self) -> Vec<Member> {
        self.ring.members()
    }

    pub(crate) fn ensure_alive(&self) -> Result<(), Error> {
        if self.is_destroyed() {
            Err(Error::CacheDestroyed)
        } else {
            Ok(())
        }
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub(crate) fn owner_of(&self, key: &str) -> Result<Member, Error> {
        self.ring.get_owner(key)
    }

    pub(crate) fn is_self(&self, member: &Member) -> bool {
        member.id == self.this.id
    }

    pub(crate) fn client(&self, member_id: &str) -> Result<Arc<Client>, Error> {
        self.clients
            .lock()
            .unwrap()
            .get(member_id)
            .cloned()
            .ok_or_else(|| {
                Error::internal(anyhow::anyhow!(
                    "no peer client for member id {}",
                    member_id
                ))
            })
    }

    pub(crate) fn get_table(&self, name: &str) -> Result<Arc<dyn LocalTable>, Error> {
        self.tables
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or(Error::TableNotFound)
    }

    pub(crate) fn register_table(&self, table: Arc<dyn LocalTable>) {
        log::debug!("Registering table {}...", table.name());
        let _ = self
            .tables
            .lock()
            .unwrap()
            .insert(table.name().to_owned(), table);
    }

    pub(crate) fn tables(&self) -> Vec<Arc<dyn LocalTable>> {
        self.tables.lock().unwrap().values().cloned().collect()
    }

    pub(crate) fn counters(&self) -> Arc<Counters> {
        self.counters.clone()
    }

    pub(crate) fn server(&self) -> &Server {
        &self.server
    }

    /// Closes clients whose members vanished and opens clients for new members.
    ///
    /// Existing clients are kept as-is so that a membership update never severs
    /// connections which are still needed.
    fn reconcile_clients(&self, members: &[Member]) {
        let mut clients = self.clients.lock().unwrap();

        let ids: HashMap<&str, &Member> =
            members.iter().map(|m| (m.id.as_str(), m)).collect();

        let stale: Vec<String> = clients
            .keys()
            .filter(|id| !ids.contains_key(id.as_str()))
            .cloned()
            .collect();
        for id in stale {
            if let Some(client) = clients.remove(&id) {
                log::debug!("Closing client for removed peer {}...", id);
                client.close();
            }
        }

        for (id, member) in ids {
            if !clients.contains_key(id) {
                log::debug!("Opening client for peer {} at {}...", id, member.addr);
                let _ = clients.insert(
                    id.to_owned(),
                    Arc::new(Client::new(member.addr.clone(), self.timeout)),
                );
            }
        }
    }
}
