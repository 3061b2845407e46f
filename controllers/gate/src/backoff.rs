//! # Per-item exponential backoff
//!
//! Tracks consecutive failures per work queue key and turns them into a
//! retry delay of `base * 2^failures`, capped at `max`. A key's count is
//! reset by [`ItemBackoff::forget`] once the key settles.
//!
//! Defaults (5ms base, 1000s cap) follow the usual controller rate limiter,
//! so a pod waiting on a booting VM is rechecked often at first and then
//! settles into slow polling.

use std::collections::HashMap;
use std::time::Duration;

/// Default delay after the first failure.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
/// Default ceiling for the delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Exponential backoff keyed by work item.
#[derive(Debug, Clone)]
pub struct ItemBackoff {
    base: Duration,
    max: Duration,
    failures: HashMap<String, u32>,
}

impl Default for ItemBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

impl ItemBackoff {
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: HashMap::new(),
        }
    }

    /// Delay before the next retry of `key`, counting this call as a failure.
    pub fn next_delay(&mut self, key: &str) -> Duration {
        let failures = self.failures.entry(key.to_string()).or_insert(0);
        let delay = Self::calculate_for_failure_count(*failures, self.base, self.max);
        *failures = failures.saturating_add(1);
        delay
    }

    /// Clear the failure history of `key`.
    pub fn forget(&mut self, key: &str) {
        self.failures.remove(key);
    }

    /// Consecutive failures recorded for `key`.
    #[must_use]
    pub fn failures(&self, key: &str) -> u32 {
        self.failures.get(key).copied().unwrap_or(0)
    }

    /// Stateless delay for the given failure count.
    #[must_use]
    pub fn calculate_for_failure_count(failures: u32, base: Duration, max: Duration) -> Duration {
        2u32.checked_pow(failures)
            .and_then(|factor| base.checked_mul(factor))
            .map_or(max, |delay| delay.min(max))
    }
}
