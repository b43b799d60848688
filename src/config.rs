//! Cache configuration
//!
//! [`CacheConfig`] configures one cache instance; [`SwrOptions`] configures how
//! an individual resource is revalidated and retried. The cache carries a
//! default [`SwrOptions`] which callers may replace per resource, either with
//! a hand-built value or with one of the named [`Preset`]s.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Revalidation and retry options for a resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwrOptions {
    /// Triggers arriving within this window after the last update are ignored
    pub deduping_interval: Duration,
    /// Revalidate when the application regains focus
    pub revalidate_on_focus: bool,
    /// Revalidate when the network comes back
    pub revalidate_on_reconnect: bool,
    /// Polling period; `Duration::ZERO` disables polling
    pub refresh_interval: Duration,
    /// Revalidate when a subscriber mounts
    pub revalidate_on_mount: bool,
    /// Revalidate on mount even if cached data already exists
    pub revalidate_if_stale: bool,
    /// Keep polling while the application is unfocused
    pub refresh_when_hidden: bool,
    /// Keep polling while offline
    pub refresh_when_offline: bool,
    /// Minimum time between two focus revalidations of the same subscriber
    pub focus_throttle_interval: Duration,
    /// Retry failed fetches at all
    pub should_retry_on_error: bool,
    /// Maximum number of retries after the first failed attempt
    pub error_retry_count: u32,
    /// Fixed delay between retries
    pub error_retry_interval: Duration,
}

impl Default for SwrOptions {
    fn default() -> Self {
        Self {
            deduping_interval: Duration::from_secs(2),
            revalidate_on_focus: true,
            revalidate_on_reconnect: true,
            refresh_interval: Duration::ZERO,
            revalidate_on_mount: true,
            revalidate_if_stale: true,
            refresh_when_hidden: false,
            refresh_when_offline: false,
            focus_throttle_interval: Duration::from_secs(5),
            should_retry_on_error: true,
            error_retry_count: 3,
            error_retry_interval: Duration::from_secs(5),
        }
    }
}

impl SwrOptions {
    /// Profile for slow-changing reference data (categories, seasons, ...).
    ///
    /// Long deduplication window, no focus revalidation and no polling.
    pub fn reference_data() -> Self {
        Self {
            deduping_interval: Duration::from_secs(600), // 10 minutes
            revalidate_on_focus: false,
            revalidate_if_stale: false,
            ..Self::default()
        }
    }

    /// Profile for live data: short polling and eager focus revalidation.
    pub fn live_data() -> Self {
        Self {
            deduping_interval: Duration::from_millis(500),
            refresh_interval: Duration::from_secs(5),
            focus_throttle_interval: Duration::from_secs(1),
            error_retry_interval: Duration::from_secs(1),
            ..Self::default()
        }
    }

    /// Options for a named preset.
    pub fn preset(preset: Preset) -> Self {
        match preset {
            Preset::Default => Self::default(),
            Preset::ReferenceData => Self::reference_data(),
            Preset::LiveData => Self::live_data(),
        }
    }

    pub fn with_deduping_interval(mut self, interval: Duration) -> Self {
        self.deduping_interval = interval;
        self
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn with_revalidate_on_focus(mut self, enabled: bool) -> Self {
        self.revalidate_on_focus = enabled;
        self
    }

    pub fn with_revalidate_on_reconnect(mut self, enabled: bool) -> Self {
        self.revalidate_on_reconnect = enabled;
        self
    }

    pub fn with_revalidate_on_mount(mut self, enabled: bool) -> Self {
        self.revalidate_on_mount = enabled;
        self
    }

    pub fn with_error_retry(mut self, count: u32, interval: Duration) -> Self {
        self.error_retry_count = count;
        self.error_retry_interval = interval;
        self
    }

    /// Whether polling is enabled.
    pub fn polls(&self) -> bool {
        !self.refresh_interval.is_zero()
    }
}

/// Named option profiles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preset {
    Default,
    ReferenceData,
    LiveData,
}

impl From<Preset> for SwrOptions {
    fn from(preset: Preset) -> Self {
        Self::preset(preset)
    }
}

/// What happens to an entry once nobody observes it any more
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Keep the entry so a later subscriber sees stale data immediately
    #[default]
    Retain,
    /// Drop the entry as soon as its last subscriber goes away
    OnLastUnsubscribe,
}

/// Configuration for a cache instance
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries held in the store
    pub max_capacity: u64,
    /// Eviction of unobserved entries
    pub eviction: EvictionPolicy,
    /// Options used when a caller does not supply its own
    pub defaults: SwrOptions,
    /// Buffer size of the focus/reconnect event channel
    pub event_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_capacity: 1000,
            eviction: EvictionPolicy::Retain,
            defaults: SwrOptions::default(),
            event_capacity: 64,
        }
    }
}
