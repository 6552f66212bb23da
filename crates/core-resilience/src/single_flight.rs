//! Per-key de-duplication of concurrent calls
//!
//! The first caller for a key becomes the leader and runs the call; callers
//! arriving while it is in flight await the leader's result instead of running
//! their own. The key is released as soon as the leader finishes, fails, panics
//! or is cancelled, so a later call always starts fresh.

use super::error::ResilienceError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::channel::oneshot;
use futures::future::{FutureExt, Shared};
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use tracing::trace;

type Pending<V> = Shared<oneshot::Receiver<V>>;

/// Registry of in-flight calls keyed by `K`
pub struct SingleFlight<K, V>
where
    K: Eq + Hash,
{
    inflight: Arc<DashMap<K, Pending<V>>>,
}

impl<K, V> Clone for SingleFlight<K, V>
where
    K: Eq + Hash,
{
    fn clone(&self) -> Self {
        Self {
            inflight: Arc::clone(&self.inflight),
        }
    }
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of joining a key
pub enum Flight<K, V>
where
    K: Eq + Hash,
{
    /// No call was in flight; this caller must run it
    Leader(FlightLeader<K, V>),
    /// Another caller is running the call
    Follower(FlightFollower<V>),
}

/// Held by the caller that runs the call.
///
/// Dropping it without [`complete`](Self::complete) releases the key and
/// wakes followers with [`ResilienceError::FlightAbandoned`].
pub struct FlightLeader<K, V>
where
    K: Eq + Hash,
{
    key: Option<K>,
    tx: Option<oneshot::Sender<V>>,
    inflight: Arc<DashMap<K, Pending<V>>>,
}

impl<K, V> FlightLeader<K, V>
where
    K: Eq + Hash,
{
    /// Release the key and hand `value` to every follower
    pub fn complete(mut self, value: V) {
        self.release();
        if let Some(tx) = self.tx.take() {
            // No followers is fine
            let _ = tx.send(value);
        }
    }

    fn release(&mut self) {
        if let Some(key) = self.key.take() {
            self.inflight.remove(&key);
        }
    }
}

impl<K, V> Drop for FlightLeader<K, V>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        if self.key.is_some() {
            trace!("In-flight call dropped before completing");
        }
        self.release();
    }
}

/// Held by a caller waiting on someone else's call
pub struct FlightFollower<V> {
    pending: Pending<V>,
}

impl<V: Clone> FlightFollower<V> {
    /// Wait for the leader's result
    pub async fn wait(self) -> Result<V, ResilienceError> {
        self.pending
            .await
            .map_err(|_| ResilienceError::FlightAbandoned)
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            inflight: Arc::new(DashMap::new()),
        }
    }

    /// Atomically join the call for `key`, becoming its leader if none is in flight
    pub fn join(&self, key: K) -> Flight<K, V> {
        match self.inflight.entry(key.clone()) {
            Entry::Occupied(entry) => Flight::Follower(FlightFollower {
                pending: entry.get().clone(),
            }),
            Entry::Vacant(entry) => {
                let (tx, rx) = oneshot::channel();
                entry.insert(rx.shared());
                Flight::Leader(FlightLeader {
                    key: Some(key),
                    tx: Some(tx),
                    inflight: Arc::clone(&self.inflight),
                })
            }
        }
    }

    /// Run `call` for `key`, or share the result of the call already running.
    ///
    /// The leader runs `call` on the current task. Followers get
    /// [`ResilienceError::FlightAbandoned`] if the leader is cancelled.
    pub async fn run<F, Fut>(&self, key: K, call: F) -> Result<V, ResilienceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        match self.join(key) {
            Flight::Leader(leader) => {
                let value = call().await;
                leader.complete(value.clone());
                Ok(value)
            }
            Flight::Follower(follower) => follower.wait().await,
        }
    }

    /// Whether a call for `key` is currently in flight
    pub fn is_in_flight(&self, key: &K) -> bool {
        self.inflight.contains_key(key)
    }

    /// Number of keys with a call in flight
    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_call() {
        let flights: SingleFlight<&'static str, u32> = SingleFlight::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());

        let mut handles = Vec::new();
        for _ in 0..5 {
            let flights = flights.clone();
            let calls = calls.clone();
            let gate = gate.clone();
            handles.push(tokio::spawn(async move {
                flights
                    .run("k", || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        gate.notified().await;
                        42
                    })
                    .await
            }));
        }

        while !flights.is_in_flight(&"k") {
            tokio::task::yield_now().await;
        }
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        gate.notify_one();

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_different_keys_do_not_share() {
        let flights: SingleFlight<u8, u8> = SingleFlight::new();

        let a = flights.join(1);
        let b = flights.join(2);
        assert!(matches!(a, Flight::Leader(_)));
        assert!(matches!(b, Flight::Leader(_)));
        assert_eq!(flights.in_flight(), 2);
    }

    #[tokio::test]
    async fn test_key_released_after_completion() {
        let flights: SingleFlight<u8, u8> = SingleFlight::new();

        assert_eq!(flights.run(1, || async { 1 }).await.unwrap(), 1);
        assert!(!flights.is_in_flight(&1));
        assert_eq!(flights.run(1, || async { 2 }).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_follower_receives_leader_value() {
        let flights: SingleFlight<u8, String> = SingleFlight::new();

        let Flight::Leader(leader) = flights.join(7) else {
            panic!("first join must lead");
        };
        let Flight::Follower(follower) = flights.join(7) else {
            panic!("second join must follow");
        };

        leader.complete("done".to_string());
        assert!(!flights.is_in_flight(&7));
        assert_eq!(follower.wait().await.unwrap(), "done");
    }

    #[tokio::test]
    async fn test_dropped_leader_abandons_followers() {
        let flights: SingleFlight<u8, u8> = SingleFlight::new();

        let leader = flights.join(3);
        let Flight::Follower(follower) = flights.join(3) else {
            panic!("second join must follow");
        };

        drop(leader);
        assert!(!flights.is_in_flight(&3));
        assert!(matches!(
            follower.wait().await,
            Err(ResilienceError::FlightAbandoned)
        ));
    }

    #[tokio::test]
    async fn test_cancelled_leader_releases_key() {
        let flights: SingleFlight<u8, u8> = SingleFlight::new();

        let slow = flights.run(9, || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            1
        });
        assert!(tokio::time::timeout(Duration::from_millis(10), slow)
            .await
            .is_err());

        assert!(!flights.is_in_flight(&9));
        assert_eq!(flights.run(9, || async { 2 }).await.unwrap(), 2);
    }
}
