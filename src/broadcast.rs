//! Subscription broadcaster
//!
//! Keeps, per key, the callbacks that want to hear about entry changes. The
//! registry only holds weak references; the strong reference lives in the
//! [`Subscription`] handle returned to the caller, so a callback is released
//! as soon as its owner drops the handle.

use parking_lot::Mutex;
use std::{
    collections::HashMap,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
};
use tracing::{debug, error};

use crate::{CacheEntry, CacheKey};

type Callback<V> = dyn Fn(&CacheEntry<V>) + Send + Sync + 'static;

struct Registration<V> {
    id: u64,
    callback: Weak<Callback<V>>,
}

struct BroadcasterInner<V> {
    next_id: AtomicU64,
    registry: Mutex<HashMap<CacheKey, Vec<Registration<V>>>>,
}

impl<V> BroadcasterInner<V> {
    fn remove(&self, key: &CacheKey, id: u64) {
        let mut registry = self.registry.lock();
        if let Some(list) = registry.get_mut(key) {
            list.retain(|r| r.id != id);
            if list.is_empty() {
                registry.remove(key);
                debug!("Last subscriber left key: {}", key);
            }
        }
    }
}

/// Registry of per-key change callbacks
pub struct Broadcaster<V> {
    inner: Arc<BroadcasterInner<V>>,
}

impl<V> Clone for Broadcaster<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> Default for Broadcaster<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Broadcaster<V> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BroadcasterInner {
                next_id: AtomicU64::new(0),
                registry: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Register a callback for `key`. Dropping the returned handle deregisters it.
    pub fn subscribe(
        &self,
        key: CacheKey,
        callback: impl Fn(&CacheEntry<V>) + Send + Sync + 'static,
    ) -> Subscription<V> {
        let callback: Arc<Callback<V>> = Arc::new(callback);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        self.inner
            .registry
            .lock()
            .entry(key.clone())
            .or_default()
            .push(Registration {
                id,
                callback: Arc::downgrade(&callback),
            });

        Subscription {
            key,
            id,
            _callback: callback,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Invoke every callback registered for `key`, in registration order.
    ///
    /// The subscriber list is snapshotted before dispatch, so callbacks may
    /// subscribe or unsubscribe freely. Returns the number of callbacks run.
    pub fn notify(&self, key: &CacheKey, entry: &CacheEntry<V>) -> usize {
        let callbacks: Vec<Arc<Callback<V>>> = {
            let registry = self.inner.registry.lock();
            match registry.get(key) {
                Some(list) => list.iter().filter_map(|r| r.callback.upgrade()).collect(),
                None => return 0,
            }
        };

        for callback in &callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(entry))).is_err() {
                error!("Subscriber callback panicked for key: {}", key);
            }
        }

        callbacks.len()
    }

    /// Number of live subscriptions for `key`
    pub fn subscriber_count(&self, key: &CacheKey) -> usize {
        self.inner
            .registry
            .lock()
            .get(key)
            .map_or(0, |list| list.len())
    }
}

/// Handle for a registered callback; dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription<V> {
    key: CacheKey,
    id: u64,
    _callback: Arc<Callback<V>>,
    registry: Weak<BroadcasterInner<V>>,
}

impl<V> Subscription<V> {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }
}

impl<V> Drop for Subscription<V> {
    fn drop(&mut self) {
        if let Some(inner) = self.registry.upgrade() {
            inner.remove(&self.key, self.id);
        }
    }
}
