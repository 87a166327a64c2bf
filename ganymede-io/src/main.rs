use std::panic::{set_hook, take_hook};
use std::time::Duration;

use anyhow::Context;
use ganymede::cache::{Cache, CacheOptions};
use ganymede::codec::StringCodec;
use ganymede::member::Member;
use ganymede::storage;
use ganymede::table::TableBuilder;
use ganymede::{GANYMEDE_REVISION, GANYMEDE_VERSION};

/// Reads the fixed cluster membership from `GANYMEDE_PEERS`.
///
/// The format is a comma separated list of `id=host:port` entries, e.g.
/// `1=10.0.0.1:2410,2=10.0.0.2:2410`. The local node (as given via `GANYMEDE_ID` /
/// `GANYMEDE_ADDR`) may be listed or omitted.
fn peers_from_env() -> anyhow::Result<Vec<Member>> {
    let raw = std::env::var("GANYMEDE_PEERS").unwrap_or_default();

    let mut peers = Vec::new();
    for entry in raw.split(',').filter(|entry| !entry.trim().is_empty()) {
        let (id, addr) = entry
            .trim()
            .split_once('=')
            .with_context(|| format!("malformed peer entry '{}', expected id=host:port", entry))?;
        peers.push(Member::new(id, addr));
    }

    Ok(peers)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Installs a panic handler which crashes the whole process instead of trying to
    // survive with a missing tokio background thread. A half-dead node looks healthy
    // from the outside but silently stops answering its share of the keyspace, so we
    // crash on purpose and let the watchdog (docker, systemd, ...) restart us into a
    // consistent state.
    let original_panic_handler = take_hook();
    set_hook(Box::new(move |panic_info| {
        original_panic_handler(panic_info);
        eprintln!("PROGRAM ALARM: A panic occurred in a thread. Crashing the whole process to enable a clean restart...");
        std::process::exit(-1);
    }));

    ganymede::init_logging();
    log::info!(
        "||. GANYMEDE (v {} - rev {})",
        GANYMEDE_VERSION,
        GANYMEDE_REVISION
    );

    let id = std::env::var("GANYMEDE_ID").unwrap_or_else(|_| "node-1".to_owned());
    let addr = std::env::var("GANYMEDE_ADDR").unwrap_or_else(|_| "0.0.0.0:2410".to_owned());
    let this = Member::new(id, addr);

    let mut peers = peers_from_env()?;
    if peers.is_empty() {
        peers.push(this.clone());
    }

    let cache = Cache::new(this, peers, CacheOptions::default())?;

    // A general purpose string table with an LRU bound; embedders of the library
    // would define their own tables here.
    let _table = TableBuilder::<String>::new("cache")
        .with_codec(StringCodec)
        .with_storage(storage::lru(65_536))
        .with_hot_cache(storage::lru(16_384))
        .build(&cache)?;

    let _sessions = TableBuilder::<String>::new("sessions")
        .with_codec(StringCodec)
        .with_storage(storage::lfu(16_384))
        .with_getter(|_key| async { Ok((String::new(), Duration::from_secs(300))) })
        .build(&cache)?;

    cache.serve().await?;
    Ok(())
}
