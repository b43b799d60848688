//! Resource subscriptions
//!
//! A [`Resource`] is what a caller holds while it is interested in a key: a
//! reactive view of the key's entry plus a way to force a refresh. While it
//! lives it keeps a store subscription and a background task reacting to
//! polling ticks and focus/reconnect events. Dropping it stops both; a fetch
//! already in flight still completes and is cached.

use std::sync::Arc;
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, warn};

use crate::{
    CacheEntry, CacheError, CacheKey, FetchError, LifecycleEvent, Loader, Subscription, SwrCache,
    SwrOptions, Trigger,
};

/// A caller's live view of one cached resource
pub struct Resource<V> {
    cache: SwrCache<V>,
    key: Option<CacheKey>,
    loader: Arc<dyn Loader<V>>,
    options: SwrOptions,
    state: watch::Receiver<Option<CacheEntry<V>>>,
    _subscription: Option<Subscription<V>>,
    revalidator: Option<JoinHandle<()>>,
}

impl<V: Send + Sync + 'static> Resource<V> {
    pub(crate) fn mount(
        cache: SwrCache<V>,
        key: CacheKey,
        loader: Arc<dyn Loader<V>>,
        options: SwrOptions,
    ) -> Self {
        let (tx, state) = watch::channel(Some(cache.store().snapshot(&key)));
        let tx = Arc::new(tx);
        let subscription = {
            let tx = Arc::clone(&tx);
            cache
                .store()
                .subscribe_key(key.clone(), move |entry| publish(&tx, entry))
        };
        // Catch a write that landed before the subscription existed.
        publish(&tx, &cache.store().snapshot(&key));
        debug!("Mounted resource for key: {}", key);

        drop(cache.trigger(&key, &loader, &options, Trigger::Mount));

        let needs_revalidator = options.polls()
            || options.revalidate_on_focus
            || options.revalidate_on_reconnect;
        let revalidator = (needs_revalidator && !cache.is_shut_down()).then(|| {
            tokio::spawn(revalidate_loop(
                cache.clone(),
                key.clone(),
                Arc::clone(&loader),
                options.clone(),
                cache.lifecycle_events(),
                cache.shutdown_signal(),
            ))
        });

        Self {
            cache,
            key: Some(key),
            loader,
            options,
            state,
            _subscription: Some(subscription),
            revalidator,
        }
    }

    /// A resource bound to the no-op key: never fetches, never changes.
    pub(crate) fn idle(cache: SwrCache<V>, loader: Arc<dyn Loader<V>>, options: SwrOptions) -> Self {
        let (_, state) = watch::channel(None);
        Self {
            cache,
            key: None,
            loader,
            options,
            state,
            _subscription: None,
            revalidator: None,
        }
    }

    pub fn key(&self) -> Option<&CacheKey> {
        self.key.as_ref()
    }

    pub fn options(&self) -> &SwrOptions {
        &self.options
    }

    /// Latest entry snapshot, `None` for the no-op key
    pub fn entry(&self) -> Option<CacheEntry<V>> {
        self.state.borrow().clone()
    }

    /// Latest data, possibly stale
    pub fn data(&self) -> Option<Arc<V>> {
        self.state.borrow().as_ref().and_then(|e| e.data.clone())
    }

    /// Error of the last settled fetch
    pub fn error(&self) -> Option<FetchError> {
        self.state.borrow().as_ref().and_then(|e| e.error.clone())
    }

    /// Whether a loader attempt is outstanding for this key
    pub fn is_validating(&self) -> bool {
        self.state.borrow().as_ref().is_some_and(|e| e.is_validating)
    }

    /// Fetch now, bypassing the deduplication window but joining any fetch
    /// already in flight for the key.
    pub async fn refresh(&self) -> Result<Option<Arc<V>>, CacheError> {
        let Some(key) = &self.key else {
            return Ok(None);
        };
        self.cache
            .run_manual(key, &self.loader, &self.options)
            .await
            .map(Some)
    }

    /// Wait until the entry changes. Returns `false` if it never will.
    pub async fn changed(&mut self) -> bool {
        self.state.changed().await.is_ok()
    }
}

impl<V> Drop for Resource<V> {
    fn drop(&mut self) {
        if let Some(revalidator) = self.revalidator.take() {
            revalidator.abort();
        }
    }
}

/// Keep the newest snapshot; deliveries from racing writers may arrive out
/// of order.
fn publish<V>(tx: &watch::Sender<Option<CacheEntry<V>>>, entry: &CacheEntry<V>) {
    tx.send_if_modified(|current| {
        let stale = current
            .as_ref()
            .is_some_and(|seen| !entry.is_newer_than(seen));
        if stale {
            return false;
        }
        *current = Some(entry.clone());
        true
    });
}

/// Per-subscription revalidation: polling ticks plus focus/reconnect events.
///
/// Polling reschedules itself only after the previous tick's fetch settled.
async fn revalidate_loop<V: Send + Sync + 'static>(
    cache: SwrCache<V>,
    key: CacheKey,
    loader: Arc<dyn Loader<V>>,
    options: SwrOptions,
    mut events: broadcast::Receiver<LifecycleEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let polling = options.polls();
    let tick = tokio::time::sleep(options.refresh_interval);
    tokio::pin!(tick);
    let mut last_focus: Option<Instant> = None;

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            () = &mut tick, if polling => {
                if let Some(fetch) = cache.trigger(&key, &loader, &options, Trigger::Interval) {
                    let _ = fetch.wait().await;
                }
                tick.as_mut().reset(Instant::now() + options.refresh_interval);
            }
            event = events.recv() => match event {
                Ok(LifecycleEvent::Focus) => {
                    let throttled = last_focus
                        .is_some_and(|at| at.elapsed() < options.focus_throttle_interval);
                    if !throttled
                        && let Some(fetch) = cache.trigger(&key, &loader, &options, Trigger::Focus)
                    {
                        last_focus = Some(Instant::now());
                        drop(fetch);
                    }
                }
                Ok(LifecycleEvent::Reconnect) => {
                    drop(cache.trigger(&key, &loader, &options, Trigger::Reconnect));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Revalidator for key {} missed {} lifecycle events", key, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    debug!("Revalidator stopped for key: {}", key);
}
