//! Retry/backoff control
//!
//! Failed fetches are retried after a fixed delay until the configured
//! number of retries is used up. Each fetch starts with a fresh
//! [`RetryState`], so any success resets the streak.

use std::time::Duration;
use tokio::sync::{Notify, watch};

use crate::SwrOptions;

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

/// Retry limits for one fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn from_options(options: &SwrOptions) -> Self {
        Self {
            max_retries: if options.should_retry_on_error {
                options.error_retry_count
            } else {
                0
            },
            interval: options.error_retry_interval,
        }
    }
}

/// Retries taken by one fetch
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RetryState {
    retries: u32,
}

impl RetryState {
    /// Record a failed attempt and decide whether to try again.
    pub fn record_failure(&mut self, policy: &RetryPolicy) -> RetryDecision {
        if self.retries < policy.max_retries {
            self.retries += 1;
            RetryDecision::RetryAfter(policy.interval)
        } else {
            RetryDecision::GiveUp
        }
    }

    /// Retries scheduled so far
    pub fn retries(&self) -> u32 {
        self.retries
    }
}

/// How a retry delay ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Backoff {
    Elapsed,
    Expedited,
    ShutDown,
}

/// Wait out a retry delay, cut short by `wake` or by shutdown.
pub(crate) async fn backoff(
    delay: Duration,
    wake: &Notify,
    shutdown: &mut watch::Receiver<bool>,
) -> Backoff {
    tokio::select! {
        () = tokio::time::sleep(delay) => Backoff::Elapsed,
        () = wake.notified() => Backoff::Expedited,
        // A dropped sender means the cache itself is gone.
        _ = shutdown.wait_for(|down| *down) => Backoff::ShutDown,
    }
}
