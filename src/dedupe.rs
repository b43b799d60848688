//! Fetch deduplication
//!
//! At most one fetch per key is in flight at any time. The first caller
//! starts the fetch on a background task; everyone arriving while it runs
//! joins it and receives the same outcome through a `watch` channel. The
//! in-flight record is removed when the fetch settles, whatever the outcome.

use futures::FutureExt;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};
use tokio::sync::{Notify, watch};
use tracing::{debug, warn};

use crate::{CacheKey, FetchError};

/// Result of a settled fetch
pub type FetchOutcome<V> = Result<Arc<V>, FetchError>;

type OutcomeSender<V> = watch::Sender<Option<FetchOutcome<V>>>;
type OutcomeReceiver<V> = watch::Receiver<Option<FetchOutcome<V>>>;
type InFlightMap<V> = Arc<Mutex<HashMap<CacheKey, InFlightRequest<V>>>>;

struct InFlightRequest<V> {
    rx: OutcomeReceiver<V>,
    /// Callers currently holding a handle to this fetch
    joined: Arc<AtomicUsize>,
    /// Wakes a fetch that is waiting out a retry delay
    wake: Arc<Notify>,
}

/// Guard that ensures the in-flight record is cleaned up even on panic/abort.
///
/// When dropped without [`InFlightGuard::complete`], waiters are resolved
/// with [`FetchError::Cancelled`].
struct InFlightGuard<V> {
    key: CacheKey,
    in_flight: InFlightMap<V>,
    tx: Option<OutcomeSender<V>>,
}

impl<V> InFlightGuard<V> {
    /// Remove the record, then hand the outcome to every waiter.
    fn complete(mut self, outcome: FetchOutcome<V>) {
        self.in_flight.lock().remove(&self.key);
        if let Some(tx) = self.tx.take() {
            tx.send_replace(Some(outcome));
        }
    }
}

impl<V> Drop for InFlightGuard<V> {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            warn!("In-flight fetch for key {} ended without a result", self.key);
            self.in_flight.lock().remove(&self.key);
            tx.send_replace(Some(Err(FetchError::Cancelled)));
        }
    }
}

/// A caller's share of an in-flight fetch
#[must_use = "an InFlightFetch does nothing unless waited on"]
pub struct InFlightFetch<V> {
    key: CacheKey,
    rx: OutcomeReceiver<V>,
    joined: Arc<AtomicUsize>,
}

impl<V> InFlightFetch<V> {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Wait for the shared fetch to settle.
    pub async fn wait(mut self) -> FetchOutcome<V> {
        loop {
            if let Some(outcome) = self.rx.borrow_and_update().as_ref() {
                return outcome.clone();
            }
            if self.rx.changed().await.is_err() {
                return Err(FetchError::Cancelled);
            }
        }
    }
}

impl<V> Drop for InFlightFetch<V> {
    fn drop(&mut self) {
        self.joined.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Process-wide registry of in-flight fetches for one value type
pub struct Deduplicator<V> {
    in_flight: InFlightMap<V>,
}

impl<V> Clone for Deduplicator<V> {
    fn clone(&self) -> Self {
        Self {
            in_flight: Arc::clone(&self.in_flight),
        }
    }
}

impl<V: Send + Sync + 'static> Default for Deduplicator<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Send + Sync + 'static> Deduplicator<V> {
    pub fn new() -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Join the fetch in flight for `key`, or start one with `start`.
    ///
    /// `start` runs only when nothing is in flight; the future it returns is
    /// driven on its own task, so it completes even if every caller goes
    /// away. It receives a [`Notify`] that is signalled when a caller asks
    /// to `expedite`, used to cut a pending retry delay short.
    pub fn fetch<F, Fut>(&self, key: &CacheKey, expedite: bool, start: F) -> InFlightFetch<V>
    where
        F: FnOnce(Arc<Notify>) -> Fut,
        Fut: Future<Output = FetchOutcome<V>> + Send + 'static,
    {
        let (tx, rx, joined, wake) = {
            let mut in_flight = self.in_flight.lock();
            if let Some(request) = in_flight.get(key) {
                request.joined.fetch_add(1, Ordering::AcqRel);
                if expedite {
                    // No stored permit: only a fetch already waiting out a
                    // retry delay is woken.
                    request.wake.notify_waiters();
                }
                debug!("Joining in-flight fetch for key: {}", key);
                return InFlightFetch {
                    key: key.clone(),
                    rx: request.rx.clone(),
                    joined: Arc::clone(&request.joined),
                };
            }

            let (tx, rx) = watch::channel(None);
            let joined = Arc::new(AtomicUsize::new(1));
            let wake = Arc::new(Notify::new());
            in_flight.insert(
                key.clone(),
                InFlightRequest {
                    rx: rx.clone(),
                    joined: Arc::clone(&joined),
                    wake: Arc::clone(&wake),
                },
            );
            (tx, rx, joined, wake)
        };

        debug!("Starting fetch for key: {}", key);
        let guard = InFlightGuard {
            key: key.clone(),
            in_flight: Arc::clone(&self.in_flight),
            tx: Some(tx),
        };
        let fut = start(wake);

        tokio::spawn(async move {
            match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(outcome) => guard.complete(outcome),
                // Dropping the guard resolves waiters with `Cancelled`.
                Err(_) => drop(guard),
            }
        });

        InFlightFetch {
            key: key.clone(),
            rx,
            joined,
        }
    }

    /// Whether a fetch for `key` is outstanding
    pub fn is_in_flight(&self, key: &CacheKey) -> bool {
        self.in_flight.lock().contains_key(key)
    }

    /// Number of keys with an outstanding fetch
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Number of callers holding a handle to the fetch for `key`
    pub fn joined(&self, key: &CacheKey) -> usize {
        self.in_flight
            .lock()
            .get(key)
            .map_or(0, |request| request.joined.load(Ordering::Acquire))
    }
}
