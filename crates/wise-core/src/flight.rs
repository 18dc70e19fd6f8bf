//! Single-flight request collapsing
//!
//! The first caller for a key spawns the work and publishes the result on a
//! `watch` channel. Later callers subscribe to the same channel. The work
//! runs on its own task, so a caller that stops waiting never cancels it.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

type FlightSender<V> = Arc<watch::Sender<Option<V>>>;

/// The fetch task went away without publishing
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("in-flight fetch abandoned")]
pub struct FlightAbandoned;

/// Result of joining a flight
#[derive(Debug, Clone)]
pub struct Flight<V> {
    /// Published value
    pub value: V,
    /// False for the caller that started the fetch
    pub joined: bool,
}

/// Map from key to the channel of its outstanding fetch
pub struct SingleFlight<K, V> {
    in_flight: Arc<DashMap<K, FlightSender<V>>>,
}

/// Removes the entry when the fetch task ends, published or not
struct FlightGuard<K: Eq + Hash, V> {
    key: K,
    map: Arc<DashMap<K, FlightSender<V>>>,
    tx: FlightSender<V>,
    finished: bool,
}

impl<K: Eq + Hash, V> FlightGuard<K, V> {
    fn finish(mut self, value: V) {
        // Publish before removal so late subscribers still see the value
        let _ = self.tx.send(Some(value));
        self.map.remove(&self.key);
        self.finished = true;
    }
}

impl<K: Eq + Hash, V> Drop for FlightGuard<K, V> {
    fn drop(&mut self) {
        if !self.finished {
            self.map.remove(&self.key);
        }
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create empty table
    pub fn new() -> Self {
        Self {
            in_flight: Arc::new(DashMap::new()),
        }
    }

    /// Run `make()` for `key` unless a run is already outstanding, then wait
    /// for the shared result.
    ///
    /// `make` is only called by the caller that starts the fetch.
    pub async fn run<F, Fut>(&self, key: K, make: F) -> Result<Flight<V>, FlightAbandoned>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let (mut rx, joined) = match self.in_flight.entry(key.clone()) {
            Entry::Occupied(e) => (e.get().subscribe(), true),
            Entry::Vacant(e) => {
                let (tx, rx) = watch::channel(None);
                let tx = Arc::new(tx);
                e.insert(tx.clone());
                let guard = FlightGuard {
                    key,
                    map: self.in_flight.clone(),
                    tx,
                    finished: false,
                };
                let fut = make();
                tokio::spawn(async move {
                    let value = fut.await;
                    guard.finish(value);
                });
                (rx, false)
            }
        };

        let value = rx
            .wait_for(|v| v.is_some())
            .await
            .map_err(|_| FlightAbandoned)?
            .clone();
        value.map(|value| Flight { value, joined }).ok_or(FlightAbandoned)
    }

    /// Number of outstanding fetches
    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    /// Check if nothing is outstanding
    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
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
