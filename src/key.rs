//! Resource key normalization
//!
//! Callers name resources with strings, tuples, or `None` when nothing should
//! be fetched yet. All of these reduce to a canonical [`CacheKey`]; two inputs
//! that reduce to the same key share one cache entry and one in-flight fetch.
//!
//! - `"seasons"` -> `seasons`
//! - `("outfits", 7)` -> `["outfits",7]`
//! - `None` or `""` -> no key, all work is skipped

use serde::Serialize;
use std::{borrow::Borrow, fmt, sync::Arc};
use tracing::warn;

use crate::CacheError;

/// Canonical, cheaply cloneable cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(Arc<str>);

impl CacheKey {
    /// Build a key from a plain string. Empty strings yield no key.
    pub fn new(key: impl Into<String>) -> Option<Self> {
        let key = key.into();
        if key.is_empty() {
            None
        } else {
            Some(Self(Arc::from(key)))
        }
    }

    /// Build a key from structured parts, canonicalized as compact JSON.
    pub fn from_parts<T: Serialize + ?Sized>(parts: &T) -> Result<Self, CacheError> {
        let json = serde_json::to_string(parts)?;
        Ok(Self(Arc::from(json)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for CacheKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Conversion from caller-supplied identifiers into a canonical key.
///
/// Returning `None` means "do not fetch".
pub trait IntoCacheKey {
    fn into_cache_key(self) -> Option<CacheKey>;
}

impl IntoCacheKey for CacheKey {
    fn into_cache_key(self) -> Option<CacheKey> {
        Some(self)
    }
}

impl IntoCacheKey for &CacheKey {
    fn into_cache_key(self) -> Option<CacheKey> {
        Some(self.clone())
    }
}

impl IntoCacheKey for &str {
    fn into_cache_key(self) -> Option<CacheKey> {
        CacheKey::new(self)
    }
}

impl IntoCacheKey for String {
    fn into_cache_key(self) -> Option<CacheKey> {
        CacheKey::new(self)
    }
}

impl IntoCacheKey for &String {
    fn into_cache_key(self) -> Option<CacheKey> {
        CacheKey::new(self.as_str())
    }
}

impl<K: IntoCacheKey> IntoCacheKey for Option<K> {
    fn into_cache_key(self) -> Option<CacheKey> {
        self.and_then(IntoCacheKey::into_cache_key)
    }
}

macro_rules! tuple_key {
    ($($part:ident),+) => {
        impl<$($part: Serialize),+> IntoCacheKey for ($($part,)+) {
            fn into_cache_key(self) -> Option<CacheKey> {
                match CacheKey::from_parts(&self) {
                    Ok(key) => Some(key),
                    Err(e) => {
                        warn!("Unable to normalize tuple key, skipping fetch: {}", e);
                        None
                    }
                }
            }
        }
    };
}

tuple_key!(A, B);
tuple_key!(A, B, C);
tuple_key!(A, B, C, D);
