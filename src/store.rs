//! Cache store
//!
//! Single source of truth for every key of one value type. Entries are kept
//! as immutable snapshots; every write replaces the whole snapshot, stamps
//! it with a store-wide version and is followed by a broadcast of exactly
//! that snapshot to the key's subscribers.
//!
//! Unobserved entries live in a capacity-bounded Moka cache. While a key has
//! subscribers its entry is pinned outside of Moka, so capacity eviction can
//! never take it away from a mounted resource.

use moka::sync::Cache;
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};
use tokio::time::Instant;
use tracing::debug;

use crate::{Broadcaster, CacheConfig, CacheKey, EvictionPolicy, FetchError, Subscription};

/// The cached state of one resource
#[derive(Debug)]
pub struct CacheEntry<V> {
    pub key: CacheKey,
    /// Last successfully loaded value; kept while later fetches fail
    pub data: Option<Arc<V>>,
    /// Error of the last settled fetch, cleared by the next success
    pub error: Option<FetchError>,
    /// When the last fetch settled (or the data was last written)
    pub last_updated: Option<Instant>,
    /// A loader attempt is currently outstanding
    pub is_validating: bool,
    /// Retries scheduled in the current failure streak
    pub retry_count: u32,
    /// Store write sequence; a higher version is a newer snapshot. Zero for
    /// an entry that was never written.
    pub version: u64,
}

impl<V> Clone for CacheEntry<V> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            data: self.data.clone(),
            error: self.error.clone(),
            last_updated: self.last_updated,
            is_validating: self.is_validating,
            retry_count: self.retry_count,
            version: self.version,
        }
    }
}

impl<V> CacheEntry<V> {
    /// An entry that has never been fetched
    pub fn empty(key: CacheKey) -> Self {
        Self {
            key,
            data: None,
            error: None,
            last_updated: None,
            is_validating: false,
            retry_count: 0,
            version: 0,
        }
    }

    /// Whether nothing has been loaded or written for this key yet
    pub fn is_empty(&self) -> bool {
        self.data.is_none() && self.error.is_none()
    }

    /// Whether this snapshot was written after `other`
    pub fn is_newer_than(&self, other: &CacheEntry<V>) -> bool {
        self.version > other.version
    }

    /// Mark a successful fetch or local write.
    pub(crate) fn settle_success(&mut self, data: Arc<V>, now: Instant) {
        self.data = Some(data);
        self.error = None;
        self.last_updated = Some(now);
        self.is_validating = false;
        self.retry_count = 0;
    }

    /// Mark a terminal failure; stale data stays visible.
    pub(crate) fn settle_failure(&mut self, error: FetchError, now: Instant) {
        self.error = Some(error);
        self.last_updated = Some(now);
        self.is_validating = false;
    }
}

/// Entry of an observed key, kept out of capacity eviction
struct Pinned<V> {
    entry: Option<Arc<CacheEntry<V>>>,
    observers: usize,
}

struct StoreState<V> {
    pinned: HashMap<CacheKey, Pinned<V>>,
    version: u64,
    closed: bool,
}

struct StoreShared<V> {
    entries: Cache<CacheKey, Arc<CacheEntry<V>>>,
    eviction: EvictionPolicy,
    /// Serializes every write and every move between `pinned` and `entries`
    state: Mutex<StoreState<V>>,
}

impl<V: Send + Sync + 'static> StoreShared<V> {
    fn current(&self, state: &StoreState<V>, key: &CacheKey) -> Option<Arc<CacheEntry<V>>> {
        match state.pinned.get(key) {
            Some(pinned) => pinned.entry.clone(),
            None => self.entries.get(key),
        }
    }

    fn write(&self, state: &mut StoreState<V>, key: &CacheKey, entry: Option<Arc<CacheEntry<V>>>) {
        if let Some(pinned) = state.pinned.get_mut(key) {
            pinned.entry = entry;
            return;
        }
        match entry {
            Some(entry) => self.entries.insert(key.clone(), entry),
            None => self.entries.invalidate(key),
        }
    }

    fn observe(&self, key: &CacheKey) {
        let mut state = self.state.lock();
        if let Some(pinned) = state.pinned.get_mut(key) {
            pinned.observers += 1;
            return;
        }
        let entry = self.entries.remove(key);
        state.pinned.insert(
            key.clone(),
            Pinned {
                entry,
                observers: 1,
            },
        );
    }

    fn unobserve(&self, key: &CacheKey) {
        let mut state = self.state.lock();
        let Some(pinned) = state.pinned.get_mut(key) else {
            return;
        };
        pinned.observers -= 1;
        if pinned.observers > 0 {
            return;
        }

        let entry = state.pinned.remove(key).and_then(|pinned| pinned.entry);
        match self.eviction {
            EvictionPolicy::Retain => {
                if let Some(entry) = entry
                    && !state.closed
                {
                    self.entries.insert(key.clone(), entry);
                }
            }
            EvictionPolicy::OnLastUnsubscribe => {
                debug!("Evicting unobserved key: {}", key);
            }
        }
    }
}

/// Keeps an observed key pinned for as long as its callback is registered
struct ObserverGuard<V: Send + Sync + 'static> {
    key: CacheKey,
    shared: Arc<StoreShared<V>>,
}

impl<V: Send + Sync + 'static> Drop for ObserverGuard<V> {
    fn drop(&mut self) {
        self.shared.unobserve(&self.key);
    }
}

/// Process-wide store of cache entries for one value type
pub struct CacheStore<V> {
    shared: Arc<StoreShared<V>>,
    broadcaster: Broadcaster<V>,
}

impl<V: Send + Sync + 'static> CacheStore<V> {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            shared: Arc::new(StoreShared {
                entries: Cache::builder().max_capacity(config.max_capacity).build(),
                eviction: config.eviction,
                state: Mutex::new(StoreState {
                    pinned: HashMap::new(),
                    version: 0,
                    closed: false,
                }),
            }),
            broadcaster: Broadcaster::new(),
        }
    }

    /// Current snapshot for `key`
    pub fn get(&self, key: &CacheKey) -> Option<Arc<CacheEntry<V>>> {
        let state = self.shared.state.lock();
        self.shared.current(&state, key)
    }

    /// Current snapshot for `key`, or an empty entry
    pub fn snapshot(&self, key: &CacheKey) -> CacheEntry<V> {
        self.get(key)
            .map(|entry| (*entry).clone())
            .unwrap_or_else(|| CacheEntry::empty(key.clone()))
    }

    /// Replace the entry for its key and notify subscribers.
    ///
    /// Returns `None` once the store is closed.
    pub fn set(&self, entry: CacheEntry<V>) -> Option<Arc<CacheEntry<V>>> {
        let key = entry.key.clone();
        self.update(&key, move |current| *current = entry)
    }

    /// Derive a new entry from the current one and store it as a whole.
    ///
    /// Returns `None` once the store is closed.
    pub fn update(
        &self,
        key: &CacheKey,
        f: impl FnOnce(&mut CacheEntry<V>),
    ) -> Option<Arc<CacheEntry<V>>> {
        let next = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return None;
            }
            let mut next = self
                .shared
                .current(&state, key)
                .map(|entry| (*entry).clone())
                .unwrap_or_else(|| CacheEntry::empty(key.clone()));
            f(&mut next);
            state.version += 1;
            next.key = key.clone();
            next.version = state.version;
            let next = Arc::new(next);
            self.shared.write(&mut state, key, Some(Arc::clone(&next)));
            next
        };
        self.notify(key, &next);
        Some(next)
    }

    /// Drop the entry for `key` and notify subscribers with an empty entry.
    pub fn remove(&self, key: &CacheKey) {
        let empty = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return;
            }
            state.version += 1;
            let mut empty = CacheEntry::empty(key.clone());
            empty.version = state.version;
            self.shared.write(&mut state, key, None);
            empty
        };
        self.notify(key, &empty);
    }

    /// Drop every entry.
    pub fn clear(&self) {
        let mut state = self.shared.state.lock();
        Self::clear_locked(&self.shared, &mut state);
    }

    /// Drop every entry and reject all later writes.
    pub fn close(&self) {
        let mut state = self.shared.state.lock();
        state.closed = true;
        Self::clear_locked(&self.shared, &mut state);
    }

    fn clear_locked(shared: &StoreShared<V>, state: &mut StoreState<V>) {
        shared.entries.invalidate_all();
        for pinned in state.pinned.values_mut() {
            pinned.entry = None;
        }
    }

    /// Observe changes of `key`. The entry is exempt from capacity eviction
    /// until the subscription is dropped.
    pub fn subscribe_key(
        &self,
        key: CacheKey,
        callback: impl Fn(&CacheEntry<V>) + Send + Sync + 'static,
    ) -> Subscription<V> {
        self.shared.observe(&key);
        let guard = ObserverGuard {
            key: key.clone(),
            shared: Arc::clone(&self.shared),
        };
        self.broadcaster.subscribe(key, move |entry| {
            let _observed = &guard;
            callback(entry)
        })
    }

    /// Stop observing; equivalent to dropping the subscription.
    pub fn unsubscribe_key(&self, subscription: Subscription<V>) {
        drop(subscription);
    }

    pub fn subscriber_count(&self, key: &CacheKey) -> usize {
        self.broadcaster.subscriber_count(key)
    }

    /// Deliver the snapshot a write produced. Concurrent writers may deliver
    /// out of order; observers keep the entry with the highest `version`.
    fn notify(&self, key: &CacheKey, entry: &CacheEntry<V>) {
        let delivered = self.broadcaster.notify(key, entry);
        if delivered > 0 {
            debug!("Notified {} subscriber(s) for key: {}", delivered, key);
        }
    }
}
