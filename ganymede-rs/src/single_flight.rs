//! Collapses duplicate concurrent operations on the same key into one execution.
//!
//! The first caller for a key becomes the *leader* and runs the actual operation.
//! Callers arriving while the leader is still running become *followers*: they
//! subscribe to the leader's result channel and share whatever the leader produces.
//! Once the leader finishes, the slot is released, so only in-flight work is
//! deduplicated, never historical results.
//!
//! If a leader is cancelled before publishing (its future is dropped, e.g. because
//! the surrounding request timed out), the result channel closes and each follower
//! retries. The first retrying follower finds the slot empty and is promoted to
//! leader with its own closure, so a cancelled leader never strands its followers.
//!
//! The router keeps one group per operation kind per table, which keys the
//! deduplication off (table, kind, key) without any string mangling.
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

type Slots<T> = Arc<Mutex<HashMap<String, broadcast::Sender<T>>>>;

/// A deduplication group for one kind of operation.
///
/// Results must be `Clone` as every follower receives its own copy.
pub struct SingleFlight<T> {
    slots: Slots<T>,
}

impl<T> Default for SingleFlight<T> {
    fn default() -> Self {
        SingleFlight {
            slots: Arc::default(),
        }
    }
}

/// Releases a leader's slot once the leader is done (or dropped mid-flight).
struct SlotGuard<T> {
    slots: Slots<T>,
    key: String,
}

impl<T> Drop for SlotGuard<T> {
    fn drop(&mut self) {
        let _ = self.slots.lock().unwrap().remove(&self.key);
    }
}

enum Role<T> {
    Leader(broadcast::Sender<T>),
    Follower(broadcast::Receiver<T>),
}

impl<T: Clone + Send + 'static> SingleFlight<T> {
    /// Creates a new group.
    pub fn new() -> Self {
        SingleFlight::default()
    }

    /// Runs `func` for the given key, unless an identical call is already in flight,
    /// in which case the in-flight call's result is shared.
    pub async fn work<F, Fut>(&self, key: &str, func: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let mut func = Some(func);

        loop {
            let role = {
                let mut slots = self.slots.lock().unwrap();
                match slots.get(key) {
                    Some(sender) => Role::Follower(sender.subscribe()),
                    None => {
                        let (sender, _) = broadcast::channel(1);
                        let _ = slots.insert(key.to_owned(), sender.clone());
                        Role::Leader(sender)
                    }
                }
            };

            match role {
                Role::Follower(mut receiver) => match receiver.recv().await {
                    Ok(value) => return value,
                    // The leader vanished without publishing; loop around and either
                    // join its successor or take over ourselves.
                    Err(_) => continue,
                },
                Role::Leader(sender) => {
                    let _slot = SlotGuard {
                        slots: self.slots.clone(),
                        key: key.to_owned(),
                    };

                    let func = match func.take() {
                        Some(func) => func,
                        None => unreachable!("a caller can only lead once per invocation"),
                    };

                    let value = func().await;
                    let _ = sender.send(value.clone());
                    return value;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Duration;

    #[tokio::test]
    async fn concurrent_calls_share_one_execution() {
        let flight = Arc::new(SingleFlight::new());
        let executions = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let flight = flight.clone();
            let executions = executions.clone();
            handles.push(tokio::spawn(async move {
                flight
                    .work("key", || async move {
                        let _ = executions.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        "result".to_owned()
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), "result");
        }
        assert_eq!(executions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sequential_calls_are_not_deduplicated() {
        let flight: SingleFlight<usize> = SingleFlight::new();
        let executions = AtomicUsize::new(0);

        let executions = &executions;
        for _ in 0..3 {
            let _ = flight
                .work("key", || async move { executions.fetch_add(1, Ordering::SeqCst) })
                .await;
        }

        assert_eq!(executions.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn distinct_keys_run_independently() {
        let flight = Arc::new(SingleFlight::new());

        let left = {
            let flight = flight.clone();
            tokio::spawn(async move { flight.work("left", || async { 1 }).await })
        };
        let right = {
            let flight = flight.clone();
            tokio::spawn(async move { flight.work("right", || async { 2 }).await })
        };

        assert_eq!(left.await.unwrap(), 1);
        assert_eq!(right.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn a_cancelled_leader_promotes_a_follower() {
        let flight = Arc::new(SingleFlight::new());

        let leader = {
            let flight = flight.clone();
            tokio::spawn(async move {
                flight
                    .work("key", || async {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        "leader".to_owned()
                    })
                    .await
            })
        };

        // Give the leader time to claim the slot, then let a follower join...
        tokio::time::sleep(Duration::from_millis(20)).await;
        let follower = {
            let flight = flight.clone();
            tokio::spawn(async move {
                flight.work("key", || async { "follower".to_owned() }).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Killing the leader must not strand the follower: it takes over and runs
        // its own closure.
        leader.abort();
        let result = tokio::time::timeout(Duration::from_secs(5), follower)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, "follower");
    }
}
