//! swrcache - Stale-while-revalidate cache and subscription layer
//!
//! This library keeps asynchronously loaded resources in a shared cache:
//! - Cached data is served immediately, even while it is being refreshed
//! - Concurrent requests for the same key share a single loader call
//! - Background revalidation on mount, focus, reconnect, polling or demand
//! - Failed loads are retried with a fixed delay before the error surfaces
//! - Subscribers are notified whenever an entry changes
//!
//! Callers supply a key and a [`Loader`] and hold the returned [`Resource`]
//! for as long as they are interested in the value.

mod broadcast;
mod cache;
mod config;
mod dedupe;
mod error;
mod key;
mod loader;
mod resource;
mod retry;
mod store;
mod trigger;

pub use broadcast::{Broadcaster, Subscription};
pub use cache::SwrCache;
pub use config::{CacheConfig, EvictionPolicy, Preset, SwrOptions};
pub use dedupe::{Deduplicator, FetchOutcome, InFlightFetch};
pub use error::{BoxError, CacheError, FetchError};
pub use key::{CacheKey, IntoCacheKey};
pub use loader::{FnLoader, Loader, loader_fn};
pub use resource::Resource;
pub use retry::{RetryDecision, RetryPolicy, RetryState};
pub use store::{CacheEntry, CacheStore};
pub use trigger::{Decision, Environment, LifecycleEvent, SkipReason, Trigger, should_revalidate};

// Re-export async_trait for convenience
pub use async_trait::async_trait;
