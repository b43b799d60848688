//! Cache error types

use std::error::Error;
use std::sync::Arc;

use crate::CacheKey;

/// Error type returned by loaders.
pub type BoxError = Box<dyn Error + Send + Sync>;

/// A loader failure as recorded in a cache entry.
///
/// Cloneable so the same failure can be handed to every joined caller and
/// kept in the entry snapshot delivered to subscribers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    /// The loader rejected; the message and cause are preserved verbatim.
    #[error(transparent)]
    Loader(Arc<dyn Error + Send + Sync>),

    /// The loader kept rejecting until the retry budget ran out.
    #[error("{source} (gave up after {retries} retries)")]
    ExhaustedRetries {
        retries: u32,
        #[source]
        source: Arc<dyn Error + Send + Sync>,
    },

    /// The fetch task was aborted or panicked before producing a result.
    #[error("Fetch was cancelled or panicked")]
    Cancelled,
}

impl FetchError {
    /// Wrap a loader error.
    pub fn from_loader(err: BoxError) -> Self {
        Self::Loader(Arc::from(err))
    }

    /// Number of retries performed before the error was surfaced.
    pub fn retries(&self) -> u32 {
        match self {
            Self::ExhaustedRetries { retries, .. } => *retries,
            _ => 0,
        }
    }

    /// The underlying loader error, if there is one.
    pub fn cause(&self) -> Option<&(dyn Error + Send + Sync + 'static)> {
        match self {
            Self::Loader(err) | Self::ExhaustedRetries { source: err, .. } => Some(err.as_ref()),
            Self::Cancelled => None,
        }
    }
}

/// Cache-related errors
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("No loader registered for key: {0}")]
    NoLoader(CacheKey),

    #[error("Cache has been shut down")]
    ShutDown,
}
