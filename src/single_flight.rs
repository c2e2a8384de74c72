//! Collapses concurrent identical computations into one.
//!
//! The first caller for a key publishes a shared future; later callers for the
//! same key await that future instead of starting their own. The registry only
//! keeps a weak handle: once every waiter has gone away (timeout, client
//! disconnect) the computation is dropped and the next caller starts afresh.

use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type SharedCall<V> = Shared<BoxFuture<'static, V>>;

struct Call<V> {
    id: u64,
    handle: WeakShared<BoxFuture<'static, V>>,
}

type Calls<K, V> = Arc<Mutex<HashMap<K, Call<V>>>>;

pub struct SingleFlight<K, V> {
    calls: Calls<K, V>,
    next_id: AtomicU64,
}

/// Clears the registry slot when the computation finishes or is dropped.
struct FlightGuard<K: Hash + Eq, V> {
    calls: Calls<K, V>,
    key: K,
    id: u64,
}

impl<K: Hash + Eq, V> Drop for FlightGuard<K, V> {
    fn drop(&mut self) {
        let mut calls = lock(&self.calls);
        if calls.get(&self.key).is_some_and(|call| call.id == self.id) {
            calls.remove(&self.key);
        }
    }
}

fn lock<K, V>(calls: &Mutex<HashMap<K, Call<V>>>) -> MutexGuard<'_, HashMap<K, Call<V>>> {
    calls.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<K, V> SingleFlight<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Runs `work` unless a computation for `key` is already in flight, in
    /// which case `work` is discarded and the in-flight result is awaited.
    ///
    /// The returned flag is `true` when this caller joined an existing flight.
    pub async fn run<F>(&self, key: K, work: F) -> (V, bool)
    where
        F: Future<Output = V> + Send + 'static,
    {
        let (call, joined) = self.join_or_start(key, work);
        (call.await, joined)
    }

    fn join_or_start<F>(&self, key: K, work: F) -> (SharedCall<V>, bool)
    where
        F: Future<Output = V> + Send + 'static,
    {
        let mut calls = lock(&self.calls);
        if let Some(existing) = calls.get(&key).and_then(|call| call.handle.upgrade()) {
            return (existing, true);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let guard = FlightGuard {
            calls: Arc::clone(&self.calls),
            key: key.clone(),
            id,
        };
        let call = async move {
            let _guard = guard;
            work.await
        }
        .boxed()
        .shared();

        // A freshly created shared future is always pending, so it downgrades
        if let Some(handle) = call.downgrade() {
            calls.insert(key, Call { id, handle });
        }
        (call, false)
    }

    /// Number of computations currently registered.
    pub fn in_flight(&self) -> usize {
        lock(&self.calls).len()
    }
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_one_execution() {
        let flights: Arc<SingleFlight<String, u64>> = Arc::new(SingleFlight::new());
        let executions = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let flights = flights.clone();
            let executions = executions.clone();
            handles.push(tokio::spawn(async move {
                flights
                    .run("app.js".to_string(), async move {
                        executions.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        42
                    })
                    .await
            }));
        }

        let mut joined = 0;
        for handle in handles {
            let (value, was_joined) = handle.await.unwrap();
            assert_eq!(value, 42);
            if was_joined {
                joined += 1;
            }
        }

        assert_eq!(executions.load(Ordering::SeqCst), 1);
        assert_eq!(joined, 15);
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_distinct_keys_run_independently() {
        let flights: SingleFlight<&'static str, usize> = SingleFlight::new();
        let (a, _) = flights.run("a", async { 1 }).await;
        let (b, _) = flights.run("b", async { 2 }).await;
        assert_eq!((a, b), (1, 2));
    }

    #[tokio::test]
    async fn test_abandoned_flight_is_not_poisoned() {
        let flights: SingleFlight<&'static str, &'static str> = SingleFlight::new();

        let slow = flights.run("k", async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            "stale"
        });
        assert!(tokio::time::timeout(Duration::from_millis(20), slow).await.is_err());

        // The timed-out waiter was the only holder, so the slot is free again
        assert_eq!(flights.in_flight(), 0);
        let (value, joined) = flights.run("k", async { "fresh" }).await;
        assert_eq!(value, "fresh");
        assert!(!joined);
    }
}
