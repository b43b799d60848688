//! Revalidation triggers
//!
//! Decides whether an event (mount, focus, reconnect, polling tick or a
//! manual refresh) should cause a fetch right now. Everything but a manual
//! refresh is suppressed within the deduplication window that follows the
//! last update of the key.

use tokio::time::Instant;

use crate::{CacheEntry, SwrOptions};

/// Event that may cause a revalidation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trigger {
    Mount,
    Focus,
    Reconnect,
    Interval,
    Manual,
}

/// Application lifecycle events fanned out to subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Focus,
    Reconnect,
}

/// Focus and connectivity of the application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Environment {
    pub focused: bool,
    pub online: bool,
}

impl Default for Environment {
    fn default() -> Self {
        Self {
            focused: true,
            online: true,
        }
    }
}

/// Why a trigger did not lead to a fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The trigger is turned off for this resource
    Disabled,
    /// The key was updated within the deduplication window
    Deduped,
    /// Cached data exists and stale data should not be revalidated on mount
    HasData,
    /// Polling is paused while the application is unfocused
    Hidden,
    /// Polling is paused while offline
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Revalidate,
    Skip(SkipReason),
}

/// Decide whether `trigger` warrants a fetch for the key of `entry`.
pub fn should_revalidate<V>(
    trigger: Trigger,
    options: &SwrOptions,
    entry: Option<&CacheEntry<V>>,
    env: Environment,
    now: Instant,
) -> Decision {
    let has_data = entry.is_some_and(|e| e.data.is_some());

    match trigger {
        Trigger::Manual => return Decision::Revalidate,
        Trigger::Mount => {
            if !options.revalidate_on_mount {
                return Decision::Skip(SkipReason::Disabled);
            }
            if has_data && !options.revalidate_if_stale {
                return Decision::Skip(SkipReason::HasData);
            }
        }
        Trigger::Focus => {
            if !options.revalidate_on_focus {
                return Decision::Skip(SkipReason::Disabled);
            }
        }
        Trigger::Reconnect => {
            if !options.revalidate_on_reconnect {
                return Decision::Skip(SkipReason::Disabled);
            }
        }
        Trigger::Interval => {
            if !options.polls() {
                return Decision::Skip(SkipReason::Disabled);
            }
            if !env.focused && !options.refresh_when_hidden {
                return Decision::Skip(SkipReason::Hidden);
            }
            if !env.online && !options.refresh_when_offline {
                return Decision::Skip(SkipReason::Offline);
            }
        }
    }

    if let Some(last) = entry.and_then(|e| e.last_updated)
        && now.saturating_duration_since(last) < options.deduping_interval
    {
        return Decision::Skip(SkipReason::Deduped);
    }

    Decision::Revalidate
}
