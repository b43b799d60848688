//! Loader contract
//!
//! A loader produces the value for one key. It may perform I/O and may fail;
//! classifying failures (network, application, timeout) is up to the loader.

use async_trait::async_trait;
use std::future::Future;

use crate::{BoxError, CacheKey};

/// Trait for fetching the value of a resource.
///
/// The same key must always denote the same logical resource.
#[async_trait]
pub trait Loader<V>: Send + Sync + 'static {
    /// Load the current value for `key`
    async fn load(&self, key: &CacheKey) -> Result<V, BoxError>;
}

/// Adapter from a no-argument async closure to [`Loader`].
#[derive(Clone)]
pub struct FnLoader<F> {
    f: F,
}

/// Wrap a closure returning a future as a [`Loader`].
///
/// ```ignore
/// let loader = loader_fn(|| async { Ok(vec!["Spring".to_owned()]) });
/// ```
pub fn loader_fn<V, F, Fut>(f: F) -> FnLoader<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<V, BoxError>> + Send + 'static,
{
    FnLoader { f }
}

#[async_trait]
impl<V, F, Fut> Loader<V> for FnLoader<F>
where
    V: Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<V, BoxError>> + Send + 'static,
{
    async fn load(&self, _key: &CacheKey) -> Result<V, BoxError> {
        (self.f)().await
    }
}
