//! Stale-while-revalidate cache
//!
//! [`SwrCache`] ties the pieces together:
//! - the [`CacheStore`] holding one snapshot per key
//! - the [`Deduplicator`] keeping a single fetch in flight per key
//! - the trigger rules deciding when a fetch is warranted
//! - the retry loop absorbing transient loader failures
//!
//! Errors never surface synchronously to subscribers; they land in the
//! entry's `error` field and reach observers with the next notification.

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::{
    collections::HashMap,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::{
    sync::{Notify, broadcast, watch},
    time::Instant,
};
use tracing::{debug, error, warn};

use crate::{
    CacheConfig, CacheEntry, CacheError, CacheKey, CacheStore, Decision, Deduplicator,
    Environment, FetchError, InFlightFetch, IntoCacheKey, LifecycleEvent, Loader, Resource,
    RetryDecision, RetryPolicy, RetryState, Subscription, SwrOptions, Trigger,
    retry::{Backoff, backoff},
    should_revalidate,
};

type SuccessHook<V> = Arc<dyn Fn(&Arc<V>, &CacheKey) + Send + Sync + 'static>;
type ErrorHook = Arc<dyn Fn(&FetchError, &CacheKey) + Send + Sync + 'static>;

struct Hooks<V> {
    on_success: Vec<SuccessHook<V>>,
    on_error: Vec<ErrorHook>,
}

struct SwrCacheInner<V> {
    store: CacheStore<V>,
    dedupe: Deduplicator<V>,
    config: CacheConfig,
    /// Most recently registered loader per key
    loaders: Mutex<HashMap<CacheKey, Arc<dyn Loader<V>>>>,
    hooks: RwLock<Hooks<V>>,
    focused: AtomicBool,
    online: AtomicBool,
    events: broadcast::Sender<LifecycleEvent>,
    shutdown: watch::Sender<bool>,
}

/// Shared stale-while-revalidate cache for values of type `V`
pub struct SwrCache<V> {
    inner: Arc<SwrCacheInner<V>>,
}

impl<V> Clone for SwrCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: Send + Sync + 'static> Default for SwrCache<V> {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl<V: Send + Sync + 'static> SwrCache<V> {
    /// Create an empty cache
    pub fn new(config: CacheConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (shutdown, _) = watch::channel(false);

        Self {
            inner: Arc::new(SwrCacheInner {
                store: CacheStore::new(&config),
                dedupe: Deduplicator::new(),
                config,
                loaders: Mutex::new(HashMap::new()),
                hooks: RwLock::new(Hooks {
                    on_success: Vec::new(),
                    on_error: Vec::new(),
                }),
                focused: AtomicBool::new(true),
                online: AtomicBool::new(true),
                events,
                shutdown,
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Options applied to resources that do not bring their own
    pub fn default_options(&self) -> &SwrOptions {
        &self.inner.config.defaults
    }

    /// Subscribe a resource to `key` with the default options.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn use_resource(
        &self,
        key: impl IntoCacheKey,
        loader: impl Loader<V>,
    ) -> Resource<V> {
        self.use_resource_with(key, loader, self.default_options().clone())
    }

    /// Subscribe a resource to `key` with per-call options.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn use_resource_with(
        &self,
        key: impl IntoCacheKey,
        loader: impl Loader<V>,
        options: SwrOptions,
    ) -> Resource<V> {
        let loader: Arc<dyn Loader<V>> = Arc::new(loader);
        match key.into_cache_key() {
            Some(key) => {
                self.register_loader(&key, &loader);
                Resource::mount(self.clone(), key, loader, options)
            }
            None => Resource::idle(self.clone(), loader, options),
        }
    }

    /// Observe entry changes for `key` without driving any fetches.
    pub fn subscribe(
        &self,
        key: impl IntoCacheKey,
        callback: impl Fn(&CacheEntry<V>) + Send + Sync + 'static,
    ) -> Option<Subscription<V>> {
        key.into_cache_key()
            .map(|key| self.inner.store.subscribe_key(key, callback))
    }

    /// Current snapshot for `key`
    pub fn get(&self, key: impl IntoCacheKey) -> Option<CacheEntry<V>> {
        key.into_cache_key()
            .and_then(|key| self.inner.store.get(&key))
            .map(|entry| (*entry).clone())
    }

    /// Fetch `key` now, joining a fetch already in flight for it.
    ///
    /// Bypasses the deduplication window. Returns `Ok(None)` for a no-op key.
    pub async fn fetch(
        &self,
        key: impl IntoCacheKey,
        loader: impl Loader<V>,
    ) -> Result<Option<Arc<V>>, CacheError> {
        let Some(key) = key.into_cache_key() else {
            return Ok(None);
        };
        let loader: Arc<dyn Loader<V>> = Arc::new(loader);
        self.register_loader(&key, &loader);
        let options = self.default_options().clone();
        self.run_manual(&key, &loader, &options).await.map(Some)
    }

    /// Re-run the most recently registered loader for `key`.
    pub async fn revalidate(&self, key: impl IntoCacheKey) -> Result<Option<Arc<V>>, CacheError> {
        let Some(key) = key.into_cache_key() else {
            return Ok(None);
        };
        if self.is_shut_down() {
            return Err(CacheError::ShutDown);
        }
        let loader = self
            .loader_for(&key)
            .ok_or_else(|| CacheError::NoLoader(key.clone()))?;
        let options = self.default_options().clone();
        self.run_manual(&key, &loader, &options).await.map(Some)
    }

    /// Write `data` for `key` locally, as if a fetch had just succeeded.
    ///
    /// Returns `None` for a no-op key or after [`SwrCache::shutdown`].
    pub fn mutate(&self, key: impl IntoCacheKey, data: V) -> Option<Arc<V>> {
        let key = key.into_cache_key()?;
        let data = Arc::new(data);
        debug!("Local mutation for key: {}", key);
        self.inner
            .store
            .update(&key, |entry| entry.settle_success(Arc::clone(&data), Instant::now()))?;
        Some(data)
    }

    /// Drop the cached entry for `key`; if it is still observed, refetch it
    /// in the background.
    pub fn invalidate(&self, key: impl IntoCacheKey) {
        let Some(key) = key.into_cache_key() else {
            return;
        };
        debug!("Invalidating cache for key: {}", key);
        self.inner.store.remove(&key);

        if self.inner.store.subscriber_count(&key) > 0
            && let Some(loader) = self.loader_for(&key)
        {
            let options = self.default_options().clone();
            drop(self.trigger(&key, &loader, &options, Trigger::Manual));
        }
    }

    /// Register a hook called with every successfully loaded value.
    pub fn on_success(&self, hook: impl Fn(&Arc<V>, &CacheKey) + Send + Sync + 'static) {
        self.inner.hooks.write().on_success.push(Arc::new(hook));
    }

    /// Register a hook called with every failed loader attempt.
    pub fn on_error(&self, hook: impl Fn(&FetchError, &CacheKey) + Send + Sync + 'static) {
        self.inner.hooks.write().on_error.push(Arc::new(hook));
    }

    /// Record focus changes; regaining focus triggers focus revalidation.
    pub fn set_focused(&self, focused: bool) {
        let was = self.inner.focused.swap(focused, Ordering::AcqRel);
        if focused && !was {
            self.notify_focus();
        }
    }

    /// Record connectivity changes; coming back online triggers reconnect
    /// revalidation.
    pub fn set_online(&self, online: bool) {
        let was = self.inner.online.swap(online, Ordering::AcqRel);
        if online && !was {
            self.notify_reconnect();
        }
    }

    pub fn notify_focus(&self) {
        debug!("Focus regained");
        let _ = self.inner.events.send(LifecycleEvent::Focus);
    }

    pub fn notify_reconnect(&self) {
        debug!("Network reconnected");
        let _ = self.inner.events.send(LifecycleEvent::Reconnect);
    }

    pub fn environment(&self) -> Environment {
        Environment {
            focused: self.inner.focused.load(Ordering::Acquire),
            online: self.inner.online.load(Ordering::Acquire),
        }
    }

    /// Number of live subscriptions for `key`
    pub fn subscriber_count(&self, key: impl IntoCacheKey) -> usize {
        key.into_cache_key()
            .map_or(0, |key| self.inner.store.subscriber_count(&key))
    }

    /// Number of keys with a fetch in flight
    pub fn in_flight_count(&self) -> usize {
        self.inner.dedupe.in_flight_count()
    }

    /// Drop every cached entry.
    pub fn clear(&self) {
        debug!("Clearing all cache entries");
        self.inner.store.clear();
    }

    /// Tear down: stop every timer, listener and pending retry, clear all
    /// entries and forget registered loaders. A loader attempt already
    /// running still resolves its waiters but no longer writes to the store.
    pub fn shutdown(&self) {
        debug!("Shutting down cache");
        self.inner.shutdown.send_replace(true);
        self.inner.store.close();
        self.inner.loaders.lock().clear();
    }

    pub fn is_shut_down(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    pub(crate) fn store(&self) -> &CacheStore<V> {
        &self.inner.store
    }

    pub(crate) fn lifecycle_events(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.inner.events.subscribe()
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.inner.shutdown.subscribe()
    }

    /// Apply the trigger rules for `key` and start (or join) a fetch if
    /// they call for one.
    pub(crate) fn trigger(
        &self,
        key: &CacheKey,
        loader: &Arc<dyn Loader<V>>,
        options: &SwrOptions,
        trigger: Trigger,
    ) -> Option<InFlightFetch<V>> {
        if self.is_shut_down() {
            return None;
        }

        let entry = self.inner.store.get(key);
        match should_revalidate(
            trigger,
            options,
            entry.as_deref(),
            self.environment(),
            Instant::now(),
        ) {
            Decision::Revalidate => {
                debug!("{:?} revalidation for key: {}", trigger, key);
                Some(self.start_fetch(key, loader, options, trigger == Trigger::Manual))
            }
            Decision::Skip(reason) => {
                debug!(
                    "Skipping {:?} revalidation for key {}: {:?}",
                    trigger, key, reason
                );
                None
            }
        }
    }

    pub(crate) async fn run_manual(
        &self,
        key: &CacheKey,
        loader: &Arc<dyn Loader<V>>,
        options: &SwrOptions,
    ) -> Result<Arc<V>, CacheError> {
        let fetch = self
            .trigger(key, loader, options, Trigger::Manual)
            .ok_or(CacheError::ShutDown)?;
        Ok(fetch.wait().await?)
    }

    fn start_fetch(
        &self,
        key: &CacheKey,
        loader: &Arc<dyn Loader<V>>,
        options: &SwrOptions,
        expedite: bool,
    ) -> InFlightFetch<V> {
        let inner = Arc::clone(&self.inner);
        let loader = Arc::clone(loader);
        let policy = RetryPolicy::from_options(options);
        let fetch_key = key.clone();

        self.inner.dedupe.fetch(key, expedite, move |wake| async move {
            inner.run_fetch(fetch_key, loader, policy, wake).await
        })
    }

    fn register_loader(&self, key: &CacheKey, loader: &Arc<dyn Loader<V>>) {
        self.inner
            .loaders
            .lock()
            .insert(key.clone(), Arc::clone(loader));
    }

    fn loader_for(&self, key: &CacheKey) -> Option<Arc<dyn Loader<V>>> {
        self.inner.loaders.lock().get(key).cloned()
    }
}

impl<V: Send + Sync + 'static> SwrCacheInner<V> {
    /// Run the loader for `key`, retrying failures per `policy`, and record
    /// the outcome in the store.
    async fn run_fetch(
        self: Arc<Self>,
        key: CacheKey,
        loader: Arc<dyn Loader<V>>,
        policy: RetryPolicy,
        wake: Arc<Notify>,
    ) -> Result<Arc<V>, FetchError> {
        let mut retry = RetryState::default();
        let mut shutdown = self.shutdown.subscribe();

        loop {
            if *shutdown.borrow() {
                return Err(FetchError::Cancelled);
            }
            self.store.update(&key, |entry| entry.is_validating = true);

            let result = match AssertUnwindSafe(loader.load(&key)).catch_unwind().await {
                Ok(result) => result,
                Err(_) => {
                    error!("Loader panicked for key: {}", key);
                    Err("loader panicked".into())
                }
            };

            match result {
                Ok(value) => {
                    let data = Arc::new(value);
                    debug!("Fetched fresh value for key: {}", key);
                    self.store.update(&key, |entry| {
                        entry.settle_success(Arc::clone(&data), Instant::now())
                    });
                    self.fire_success(&data, &key);
                    return Ok(data);
                }
                Err(e) => {
                    let cause: Arc<dyn std::error::Error + Send + Sync> = Arc::from(e);
                    let attempt_error = FetchError::Loader(Arc::clone(&cause));
                    self.fire_error(&attempt_error, &key);

                    let decision = if *self.shutdown.borrow() {
                        RetryDecision::GiveUp
                    } else {
                        retry.record_failure(&policy)
                    };

                    match decision {
                        RetryDecision::RetryAfter(delay) => {
                            warn!(
                                "Fetch for key {} failed ({}); retry {}/{} in {:?}",
                                key,
                                cause,
                                retry.retries(),
                                policy.max_retries,
                                delay
                            );
                            let retries = retry.retries();
                            self.store.update(&key, |entry| {
                                entry.is_validating = false;
                                entry.retry_count = retries;
                            });
                            match backoff(delay, &wake, &mut shutdown).await {
                                Backoff::Elapsed => {}
                                Backoff::Expedited => {
                                    debug!("Retry for key {} expedited", key);
                                }
                                Backoff::ShutDown => {
                                    debug!("Pending retry for key {} cancelled", key);
                                    return Err(FetchError::Cancelled);
                                }
                            }
                        }
                        RetryDecision::GiveUp => {
                            let fetch_error = if retry.retries() == 0 {
                                attempt_error
                            } else {
                                FetchError::ExhaustedRetries {
                                    retries: retry.retries(),
                                    source: cause,
                                }
                            };
                            error!("Fetch for key {} failed: {}", key, fetch_error);
                            let retries = retry.retries();
                            self.store.update(&key, |entry| {
                                entry.settle_failure(fetch_error.clone(), Instant::now());
                                entry.retry_count = retries;
                            });
                            return Err(fetch_error);
                        }
                    }
                }
            }
        }
    }

    fn fire_success(&self, data: &Arc<V>, key: &CacheKey) {
        let hooks = self.hooks.read().on_success.clone();
        for hook in hooks {
            if catch_unwind(AssertUnwindSafe(|| hook(data, key))).is_err() {
                error!("on_success hook panicked for key: {}", key);
            }
        }
    }

    fn fire_error(&self, err: &FetchError, key: &CacheKey) {
        let hooks = self.hooks.read().on_error.clone();
        for hook in hooks {
            if catch_unwind(AssertUnwindSafe(|| hook(err, key))).is_err() {
                error!("on_error hook panicked for key: {}", key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BoxError, EvictionPolicy, loader_fn};
    use std::{
        sync::atomic::{AtomicBool, AtomicUsize},
        time::Duration,
    };
    use tokio::time::sleep;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Season {
        id: u32,
        name: String,
    }

    fn spring() -> Vec<Season> {
        vec![Season {
            id: 1,
            name: "Spring".to_owned(),
        }]
    }

    /// Loader counting its invocations and resolving after `delay`
    fn counting_loader(
        calls: &Arc<AtomicUsize>,
        delay: Duration,
    ) -> impl Loader<Vec<Season>> + Clone {
        let calls = Arc::clone(calls);
        loader_fn(move || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                sleep(delay).await;
                Ok::<_, BoxError>(spring())
            }
        })
    }

    /// Loader that fails while `failing` is set and records call times
    fn flaky_loader(
        failing: &Arc<AtomicBool>,
        calls: &Arc<Mutex<Vec<Instant>>>,
    ) -> impl Loader<Vec<Season>> + Clone {
        let failing = Arc::clone(failing);
        let calls = Arc::clone(calls);
        loader_fn(move || {
            let failing = Arc::clone(&failing);
            let calls = Arc::clone(&calls);
            async move {
                calls.lock().push(Instant::now());
                if failing.load(Ordering::SeqCst) {
                    Err::<Vec<Season>, BoxError>("service unavailable".into())
                } else {
                    Ok(spring())
                }
            }
        })
    }

    fn quiet_options() -> SwrOptions {
        SwrOptions::default()
            .with_revalidate_on_focus(false)
            .with_revalidate_on_reconnect(false)
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_mounts_share_one_fetch() {
        let cache = SwrCache::<Vec<Season>>::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let loader = counting_loader(&calls, Duration::from_millis(100));
        let options = SwrOptions::default().with_deduping_interval(Duration::from_secs(2));

        let a = cache.use_resource_with("seasons", loader.clone(), options.clone());
        sleep(Duration::from_millis(50)).await;
        let b = cache.use_resource_with("seasons", loader, options);
        assert!(b.is_validating());

        sleep(Duration::from_millis(200)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let (a_data, b_data) = (a.data().expect("data"), b.data().expect("data"));
        assert!(Arc::ptr_eq(&a_data, &b_data));
        assert_eq!(*a_data, spring());
        assert!(!a.is_validating());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_fetches_call_loader_once() {
        let cache = SwrCache::<Vec<Season>>::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let loader = counting_loader(&calls, Duration::from_millis(200));
        let barrier = Arc::new(tokio::sync::Barrier::new(16));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let cache = cache.clone();
                let loader = loader.clone();
                let barrier = Arc::clone(&barrier);
                tokio::spawn(async move {
                    barrier.wait().await;
                    cache.fetch("seasons", loader).await
                })
            })
            .collect();

        let results = futures::future::join_all(tasks).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for result in results {
            let data = result.expect("task").expect("fetch").expect("data");
            assert_eq!(*data, spring());
        }
        assert_eq!(cache.in_flight_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_triggers_within_deduping_window_are_suppressed() {
        let cache = SwrCache::<Vec<Season>>::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let loader = counting_loader(&calls, Duration::ZERO);

        let _a = cache.use_resource("seasons", loader.clone());
        sleep(Duration::from_secs(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let _b = cache.use_resource("seasons", loader.clone());
        cache.notify_focus();
        cache.notify_reconnect();
        sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        sleep(Duration::from_secs(2)).await;
        cache.notify_focus();
        sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_joins_in_flight_fetch() {
        let cache = SwrCache::<Vec<Season>>::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let resource = cache.use_resource("seasons", counting_loader(&calls, Duration::from_secs(1)));

        let (a, b, c) = tokio::join!(resource.refresh(), resource.refresh(), resource.refresh());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for result in [a, b, c] {
            assert_eq!(*result.expect("refresh").expect("data"), spring());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_bypasses_deduping_window() {
        let cache = SwrCache::<Vec<Season>>::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let resource = cache.use_resource("seasons", counting_loader(&calls, Duration::ZERO));
        sleep(Duration::from_millis(10)).await;

        resource.refresh().await.expect("refresh");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_surfaces_error() {
        let cache = SwrCache::<Vec<Season>>::default();
        let failing = Arc::new(AtomicBool::new(true));
        let calls = Arc::new(Mutex::new(Vec::new()));
        let options = quiet_options().with_error_retry(2, Duration::from_secs(5));
        let start = Instant::now();

        let resource =
            cache.use_resource_with("seasons", flaky_loader(&failing, &calls), options);

        sleep(Duration::from_millis(1)).await;
        assert_eq!(calls.lock().len(), 1);
        assert!(resource.error().is_none());
        assert!(!resource.is_validating());
        assert_eq!(resource.entry().expect("entry").retry_count, 1);

        sleep(Duration::from_secs(5)).await;
        assert_eq!(calls.lock().len(), 2);
        assert!(resource.error().is_none());

        sleep(Duration::from_secs(5)).await;
        assert_eq!(calls.lock().len(), 3);
        let err = resource.error().expect("error surfaced");
        assert!(matches!(err, FetchError::ExhaustedRetries { retries: 2, .. }));
        assert_eq!(err.cause().map(|e| e.to_string()).as_deref(), Some("service unavailable"));
        assert!(!resource.is_validating());

        sleep(Duration::from_secs(60)).await;
        let calls = calls.lock();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0] - start, Duration::ZERO);
        assert_eq!(calls[1] - calls[0], Duration::from_secs(5));
        assert_eq!(calls[2] - calls[1], Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_keeps_stale_data_and_success_resets() {
        let cache = SwrCache::<Vec<Season>>::default();
        let failing = Arc::new(AtomicBool::new(false));
        let calls = Arc::new(Mutex::new(Vec::new()));
        let options = quiet_options().with_error_retry(1, Duration::from_secs(1));
        let resource =
            cache.use_resource_with("seasons", flaky_loader(&failing, &calls), options);
        sleep(Duration::from_millis(10)).await;
        assert_eq!(*resource.data().expect("data"), spring());

        failing.store(true, Ordering::SeqCst);
        let err = resource.refresh().await.expect_err("refresh fails");
        assert!(matches!(err, CacheError::Fetch(FetchError::ExhaustedRetries { retries: 1, .. })));
        assert_eq!(*resource.data().expect("stale data kept"), spring());
        assert!(resource.error().is_some());
        assert_eq!(resource.entry().expect("entry").retry_count, 1);

        failing.store(false, Ordering::SeqCst);
        resource.refresh().await.expect("refresh succeeds");
        assert!(resource.error().is_none());
        assert_eq!(resource.entry().expect("entry").retry_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_during_attempt_keeps_retry_spacing() {
        let cache = SwrCache::<Vec<Season>>::default();
        let attempts = Arc::new(Mutex::new(Vec::new()));
        let loader = {
            let attempts = Arc::clone(&attempts);
            loader_fn(move || {
                let attempts = Arc::clone(&attempts);
                async move {
                    attempts.lock().push(Instant::now());
                    sleep(Duration::from_secs(1)).await;
                    Err::<Vec<Season>, BoxError>("service unavailable".into())
                }
            })
        };
        let options = quiet_options().with_error_retry(2, Duration::from_secs(5));
        let start = Instant::now();
        let resource = cache.use_resource_with("seasons", loader, options);

        sleep(Duration::from_millis(100)).await;
        let err = resource.refresh().await.expect_err("fails");
        assert!(matches!(err, CacheError::Fetch(FetchError::ExhaustedRetries { retries: 2, .. })));

        let offsets: Vec<Duration> = attempts.lock().iter().map(|at| *at - start).collect();
        assert_eq!(
            offsets,
            vec![Duration::ZERO, Duration::from_secs(6), Duration::from_secs(12)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_during_backoff_retries_immediately() {
        let cache = SwrCache::<Vec<Season>>::default();
        let failing = Arc::new(AtomicBool::new(true));
        let calls = Arc::new(Mutex::new(Vec::new()));
        let options = quiet_options().with_error_retry(2, Duration::from_secs(5));
        let start = Instant::now();
        let resource =
            cache.use_resource_with("seasons", flaky_loader(&failing, &calls), options);

        sleep(Duration::from_secs(1)).await;
        assert_eq!(calls.lock().len(), 1);
        failing.store(false, Ordering::SeqCst);

        let data = resource.refresh().await.expect("refresh").expect("data");
        assert_eq!(*data, spring());
        let calls = calls.lock();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1] - start, Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_disabled_surfaces_first_error() {
        let cache = SwrCache::<Vec<Season>>::default();
        let failing = Arc::new(AtomicBool::new(true));
        let calls = Arc::new(Mutex::new(Vec::new()));
        let options = SwrOptions {
            should_retry_on_error: false,
            ..quiet_options()
        };

        let err = cache
            .fetch("seasons", flaky_loader(&failing, &calls))
            .await
            .expect_err("fails");
        assert!(matches!(err, CacheError::Fetch(FetchError::ExhaustedRetries { .. })));

        let resource = cache.use_resource_with("colors", flaky_loader(&failing, &calls), options);
        sleep(Duration::from_millis(10)).await;
        assert!(matches!(resource.error(), Some(FetchError::Loader(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_interval() {
        let cache = SwrCache::<Vec<Season>>::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let options = quiet_options().with_refresh_interval(Duration::from_secs(30));
        let _resource =
            cache.use_resource_with("seasons", counting_loader(&calls, Duration::ZERO), options);

        sleep(Duration::from_secs(65)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_stops_polling_and_resubscribe_restarts() {
        let cache = SwrCache::<Vec<Season>>::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let loader = counting_loader(&calls, Duration::ZERO);
        let options = quiet_options().with_refresh_interval(Duration::from_secs(30));

        let resource = cache.use_resource_with("seasons", loader.clone(), options.clone());
        sleep(Duration::from_secs(31)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        drop(resource);
        assert_eq!(cache.subscriber_count("seasons"), 0);
        sleep(Duration::from_secs(120)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let _resource = cache.use_resource_with("seasons", loader, options);
        sleep(Duration::from_secs(31)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_pauses_while_hidden() {
        let cache = SwrCache::<Vec<Season>>::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let options = quiet_options().with_refresh_interval(Duration::from_secs(10));
        let _resource =
            cache.use_resource_with("seasons", counting_loader(&calls, Duration::ZERO), options);
        sleep(Duration::from_millis(10)).await;

        cache.set_focused(false);
        sleep(Duration::from_secs(35)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_focus_and_reconnect_edges() {
        let cache = SwrCache::<Vec<Season>>::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let _resource = cache.use_resource("seasons", counting_loader(&calls, Duration::ZERO));
        sleep(Duration::from_secs(3)).await;

        cache.set_online(false);
        sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        cache.set_online(true);
        sleep(Duration::from_secs(3)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Already focused: no transition, no event.
        cache.set_focused(true);
        sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        cache.set_focused(false);
        cache.set_focused(true);
        sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // Throttled: a second focus shortly after the first is ignored.
        sleep(Duration::from_secs(3)).await;
        cache.notify_focus();
        sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_op_key_never_fetches() {
        let cache = SwrCache::<Vec<Season>>::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let resource = cache.use_resource(None::<&str>, counting_loader(&calls, Duration::ZERO));
        sleep(Duration::from_secs(10)).await;

        assert!(resource.key().is_none());
        assert!(resource.data().is_none());
        assert!(resource.refresh().await.expect("no-op").is_none());
        assert!(
            cache
                .fetch("", counting_loader(&calls, Duration::ZERO))
                .await
                .expect("no-op")
                .is_none()
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tuple_keys_share_an_entry() {
        let cache = SwrCache::<Vec<Season>>::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let loader = counting_loader(&calls, Duration::from_millis(100));

        let resource = cache.use_resource(("seasons", 2024), loader.clone());
        let fetched = cache.fetch(("seasons", 2024), loader).await.expect("fetch");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(
            &fetched.expect("data"),
            &resource.data().expect("data")
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hooks_observe_every_settle() {
        let config = CacheConfig {
            defaults: quiet_options().with_error_retry(1, Duration::from_secs(1)),
            ..CacheConfig::default()
        };
        let cache = SwrCache::<Vec<Season>>::new(config);
        let successes = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(AtomicUsize::new(0));

        cache.on_success(|_, _| panic!("telemetry bug"));
        {
            let successes = Arc::clone(&successes);
            cache.on_success(move |data, key| successes.lock().push((key.clone(), data.len())));
        }
        {
            let errors = Arc::clone(&errors);
            cache.on_error(move |_, _| {
                errors.fetch_add(1, Ordering::SeqCst);
            });
        }

        let calls = Arc::new(AtomicUsize::new(0));
        cache
            .fetch("seasons", counting_loader(&calls, Duration::ZERO))
            .await
            .expect("hook panics do not break the fetch");
        assert_eq!(
            *successes.lock(),
            vec![(CacheKey::new("seasons").expect("key"), 1)]
        );

        let failing = Arc::new(AtomicBool::new(true));
        let attempts = Arc::new(Mutex::new(Vec::new()));
        cache
            .fetch("colors", flaky_loader(&failing, &attempts))
            .await
            .expect_err("fails");
        assert_eq!(errors.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loader_panic_is_a_loader_error() {
        let cache = SwrCache::<u32>::default();
        let loader = loader_fn(|| async {
            let value: Option<u32> = None;
            Ok::<_, BoxError>(value.expect("broken loader"))
        });
        let options = SwrOptions {
            should_retry_on_error: false,
            ..quiet_options()
        };
        let resource = cache.use_resource_with("answer", loader, options);
        sleep(Duration::from_millis(10)).await;

        let err = resource.error().expect("error recorded");
        assert_eq!(err.to_string(), "loader panicked");
        assert!(!resource.is_validating());
    }

    #[tokio::test(start_paused = true)]
    async fn test_mutate_invalidate_and_revalidate() {
        let cache = SwrCache::<Vec<Season>>::default();
        let calls = Arc::new(AtomicUsize::new(0));

        assert!(matches!(
            cache.revalidate("seasons").await,
            Err(CacheError::NoLoader(_))
        ));

        let mut resource = cache.use_resource_with(
            "seasons",
            counting_loader(&calls, Duration::ZERO),
            quiet_options(),
        );
        sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let winter = vec![Season {
            id: 4,
            name: "Winter".to_owned(),
        }];
        cache.mutate("seasons", winter.clone());
        assert!(resource.changed().await);
        assert_eq!(*resource.data().expect("data"), winter);

        cache.invalidate("seasons");
        sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(*resource.data().expect("data"), spring());

        cache.revalidate("seasons").await.expect("revalidate");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_observes_without_fetching() {
        let cache = SwrCache::<u32>::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sub = {
            let seen = Arc::clone(&seen);
            cache
                .subscribe("counter", move |entry| {
                    seen.lock().push(entry.data.as_deref().copied());
                })
                .expect("subscribed")
        };
        assert_eq!(cache.subscriber_count("counter"), 1);

        cache.mutate("counter", 1);
        cache.mutate("counter", 2);
        assert_eq!(*seen.lock(), vec![Some(1), Some(2)]);

        drop(sub);
        cache.mutate("counter", 3);
        assert_eq!(seen.lock().len(), 2);
        assert_eq!(cache.get("counter").and_then(|e| e.data).as_deref(), Some(&3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_fetch_survives_unmount() {
        let config = CacheConfig {
            eviction: EvictionPolicy::OnLastUnsubscribe,
            ..CacheConfig::default()
        };
        let cache = SwrCache::<Vec<Season>>::new(config);
        let calls = Arc::new(AtomicUsize::new(0));
        let resource = cache.use_resource("seasons", counting_loader(&calls, Duration::from_secs(1)));
        sleep(Duration::from_millis(10)).await;
        drop(resource);

        sleep(Duration::from_secs(2)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let entry = cache.get("seasons").expect("settled fetch is cached");
        assert_eq!(*entry.data.expect("data"), spring());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_timers_and_clears() {
        let cache = SwrCache::<Vec<Season>>::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let options = quiet_options().with_refresh_interval(Duration::from_secs(5));
        let resource =
            cache.use_resource_with("seasons", counting_loader(&calls, Duration::ZERO), options);
        sleep(Duration::from_secs(6)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        cache.shutdown();
        sleep(Duration::from_secs(60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(cache.get("seasons").is_none());
        assert!(matches!(resource.refresh().await, Err(CacheError::ShutDown)));
        assert!(matches!(cache.revalidate("seasons").await, Err(CacheError::ShutDown)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_pending_retry() {
        let cache = SwrCache::<Vec<Season>>::default();
        let failing = Arc::new(AtomicBool::new(true));
        let calls = Arc::new(Mutex::new(Vec::new()));
        let options = quiet_options().with_error_retry(2, Duration::from_secs(5));
        let _resource =
            cache.use_resource_with("seasons", flaky_loader(&failing, &calls), options);

        sleep(Duration::from_secs(1)).await;
        assert_eq!(calls.lock().len(), 1);
        assert_eq!(cache.in_flight_count(), 1);

        // A retry would now succeed and refill the store.
        failing.store(false, Ordering::SeqCst);
        cache.shutdown();
        sleep(Duration::from_secs(30)).await;

        assert_eq!(calls.lock().len(), 1);
        assert!(cache.get("seasons").is_none());
        assert_eq!(cache.in_flight_count(), 0);
        assert!(cache.mutate("seasons", spring()).is_none());
        assert!(cache.get("seasons").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_mounted_entry_survives_capacity_pressure() {
        let config = CacheConfig {
            max_capacity: 1,
            ..CacheConfig::default()
        };
        let cache = SwrCache::<u32>::new(config);
        let resource = cache.use_resource_with(
            "observed",
            loader_fn(|| async { Ok::<_, BoxError>(1) }),
            quiet_options(),
        );
        sleep(Duration::from_millis(10)).await;

        for i in 0..50 {
            cache.mutate(format!("other-{i}"), i);
        }

        assert_eq!(cache.get("observed").and_then(|e| e.data).as_deref(), Some(&1));
        assert_eq!(resource.data().as_deref(), Some(&1));
    }
}
