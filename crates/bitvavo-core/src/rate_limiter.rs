//! Rate budget tracking.
//!
//! Bitvavo grants a weighted budget of 1000 points per minute. The server
//! reports the remaining budget via REST response headers and, once it is
//! exhausted, rejects calls with error 105 naming the unban time. This
//! tracker mirrors those signals. It is advisory: nothing here blocks a send.

use crate::auth::timestamp_ms;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Error code the venue uses for "rate limit exceeded".
pub const RATE_LIMIT_ERROR_CODE: i64 = 105;

/// Budget granted per window.
pub const DEFAULT_RATE_LIMIT: u32 = 1000;

#[derive(Debug)]
struct Budget {
    remaining: u32,
    reset_at_ms: i64,
    reset_pending: bool,
}

impl Budget {
    /// Apply a due reset. Returns true if the budget was restored.
    fn settle(&mut self, max: u32, now_ms: i64) -> bool {
        if self.reset_pending && self.reset_at_ms <= now_ms {
            self.remaining = max;
            self.reset_pending = false;
            return true;
        }
        false
    }
}

/// Shared remaining-budget counter.
///
/// One instance is shared by the WebSocket and REST paths of a client.
pub struct RateLimiter {
    max: u32,
    budget: Arc<Mutex<Budget>>,
    reset_task: Mutex<Option<JoinHandle<()>>>,
}

impl RateLimiter {
    /// Create a tracker with `max` points of budget.
    pub fn new(max: u32) -> Self {
        Self {
            max,
            budget: Arc::new(Mutex::new(Budget {
                remaining: max,
                reset_at_ms: 0,
                reset_pending: false,
            })),
            reset_task: Mutex::new(None),
        }
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    /// Remaining budget.
    pub fn remaining(&self) -> u32 {
        let mut budget = self.budget.lock();
        budget.settle(self.max, timestamp_ms());
        budget.remaining
    }

    /// Time (ms since epoch) the budget resets, 0 if never reported.
    pub fn reset_at_ms(&self) -> i64 {
        self.budget.lock().reset_at_ms
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    /// Feed a server error. Only [`RATE_LIMIT_ERROR_CODE`] affects the budget.
    pub fn observe_error(&self, code: Option<i64>, message: &str) {
        if code != Some(RATE_LIMIT_ERROR_CODE) {
            return;
        }
        let reset_at = parse_reset_timestamp(message);
        {
            let mut budget = self.budget.lock();
            budget.remaining = 0;
            if let Some(reset_at) = reset_at {
                budget.reset_at_ms = reset_at;
                budget.reset_pending = true;
            }
        }
        match reset_at {
            Some(reset_at) => {
                warn!(reset_at_ms = reset_at, "Rate limit exceeded, budget exhausted");
                self.schedule_reset(reset_at);
            }
            None => warn!(%message, "Rate limit exceeded, no reset time in message"),
        }
    }

    /// Adopt quota headers reported by the REST transport.
    pub fn observe_headers(&self, remaining: Option<u32>, reset_at_ms: Option<i64>) {
        if remaining.is_none() && reset_at_ms.is_none() {
            return;
        }
        {
            let mut budget = self.budget.lock();
            if let Some(remaining) = remaining {
                budget.remaining = remaining;
            }
            if let Some(reset_at) = reset_at_ms {
                budget.reset_at_ms = reset_at;
                budget.reset_pending = true;
            }
        }
        debug!(?remaining, ?reset_at_ms, "Rate budget updated from headers");
        if let Some(reset_at) = reset_at_ms {
            self.schedule_reset(reset_at);
        }
    }

    /// Restore the full budget at `reset_at_ms`, replacing any earlier schedule.
    ///
    /// Outside a tokio runtime only the lazy reset in [`Self::remaining`] applies.
    fn schedule_reset(&self, reset_at_ms: i64) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let delay_ms = reset_at_ms.saturating_sub(timestamp_ms()).max(0) as u64;
        let budget = self.budget.clone();
        let max = self.max;
        let task = runtime.spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            if budget.lock().settle(max, timestamp_ms()) {
                debug!(max, "Rate budget reset");
            }
        });
        if let Some(previous) = self.reset_task.lock().replace(task) {
            previous.abort();
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_RATE_LIMIT)
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        if let Some(task) = self.reset_task.get_mut().take() {
            task.abort();
        }
    }
}

/// Extract the unban timestamp from a rate-limit message such as
/// `"... You have been banned until 1700000000000."` or `"... at 1700000000000."`.
pub fn parse_reset_timestamp(message: &str) -> Option<i64> {
    let (_, tail) = message.split_once(" at ")?;
    let head = tail.split('.').next()?;
    head.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reset_timestamp() {
        assert_eq!(
            parse_reset_timestamp(
                "Rate limit exceeded. Your budget will be reset at 1700000000000."
            ),
            Some(1_700_000_000_000)
        );
        assert_eq!(
            parse_reset_timestamp("banned at 1700000000000"),
            Some(1_700_000_000_000)
        );
        assert_eq!(parse_reset_timestamp("no timestamp here"), None);
        assert_eq!(parse_reset_timestamp("at noon at soon."), None);
    }

    #[test]
    fn test_starts_full() {
        let limiter = RateLimiter::default();
        assert_eq!(limiter.remaining(), DEFAULT_RATE_LIMIT);
        assert_eq!(limiter.reset_at_ms(), 0);
        assert!(!limiter.is_exhausted());
    }

    #[test]
    fn test_unrelated_errors_ignored() {
        let limiter = RateLimiter::default();
        limiter.observe_error(Some(216), "Insufficient balance.");
        limiter.observe_error(None, "something at 123.");
        assert_eq!(limiter.remaining(), DEFAULT_RATE_LIMIT);
    }

    #[test]
    fn test_rate_limit_error_exhausts_until_reset_without_runtime() {
        let limiter = RateLimiter::default();
        let reset_at = timestamp_ms() + 60_000;
        limiter.observe_error(
            Some(RATE_LIMIT_ERROR_CODE),
            &format!("Rate limit exceeded. Budget resets at {reset_at}."),
        );
        assert_eq!(limiter.remaining(), 0);
        assert_eq!(limiter.reset_at_ms(), reset_at);
        assert!(limiter.is_exhausted());
    }

    #[test]
    fn test_elapsed_reset_applies_lazily() {
        let limiter = RateLimiter::default();
        let reset_at = timestamp_ms() - 1;
        limiter.observe_error(
            Some(RATE_LIMIT_ERROR_CODE),
            &format!("Rate limit exceeded at {reset_at}."),
        );
        assert_eq!(limiter.remaining(), DEFAULT_RATE_LIMIT);
    }

    #[test]
    fn test_headers_adopted() {
        let limiter = RateLimiter::default();
        let reset_at = timestamp_ms() + 60_000;
        limiter.observe_headers(Some(987), Some(reset_at));
        assert_eq!(limiter.remaining(), 987);
        assert_eq!(limiter.reset_at_ms(), reset_at);

        limiter.observe_headers(None, None);
        assert_eq!(limiter.remaining(), 987);
    }

    #[tokio::test]
    async fn test_scheduled_reset_restores_budget() {
        let limiter = RateLimiter::default();
        let reset_at = timestamp_ms() + 50;
        limiter.observe_headers(Some(0), Some(reset_at));
        assert_eq!(limiter.budget.lock().remaining, 0);

        tokio::time::sleep(Duration::from_millis(150)).await;
        // Inspect the raw budget: `remaining()` would settle it lazily.
        {
            let budget = limiter.budget.lock();
            assert_eq!(budget.remaining, DEFAULT_RATE_LIMIT);
            assert!(!budget.reset_pending);
        }
        assert_eq!(limiter.remaining(), DEFAULT_RATE_LIMIT);
    }

    #[tokio::test]
    async fn test_new_schedule_replaces_previous() {
        let limiter = RateLimiter::default();
        limiter.observe_headers(Some(0), Some(timestamp_ms() + 50));
        // Later schedule supersedes the first one.
        let later = timestamp_ms() + 60_000;
        limiter.observe_headers(Some(0), Some(later));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(limiter.remaining(), 0);
        assert_eq!(limiter.reset_at_ms(), later);
    }
}
