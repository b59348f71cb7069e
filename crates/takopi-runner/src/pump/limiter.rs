//! Per-key dispatch-time bookkeeping.
//!
//! Tracks, for every scope key, the earliest instant the next dispatch may
//! occur. Keys only ever move forward in time: a fixed interval advances
//! them on commit, and external Retry-After signals push them further out.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

/// Earliest-allowed-dispatch clock per scope key.
pub struct RateLimiter {
    /// Minimum spacing between commits on one key. Zero means unlimited.
    interval: Duration,
    next_allowed: Mutex<HashMap<String, Instant>>,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_allowed: Mutex::new(HashMap::new()),
        }
    }

    /// Earliest instant a dispatch on `key` may be scheduled, without
    /// committing to it: max(now, not_before, next_allowed[key]).
    pub fn peek_ready_at(&self, key: &str, not_before: Option<Instant>) -> Instant {
        let now = Instant::now();
        let mut ready = not_before.map_or(now, |nb| nb.max(now));
        #[allow(clippy::unwrap_used)] // lock poisoning is unrecoverable here
        let table = self.next_allowed.lock().unwrap();
        if let Some(next) = table.get(key) {
            ready = ready.max(*next);
        }
        ready
    }

    /// Record a dispatch on `key` scheduled at `scheduled_at`, advancing the
    /// key's clock by the configured interval from max(now, scheduled_at).
    pub fn commit(&self, key: &str, scheduled_at: Instant) {
        if self.interval.is_zero() {
            return;
        }
        let base = scheduled_at.max(Instant::now());
        #[allow(clippy::unwrap_used)]
        let mut table = self.next_allowed.lock().unwrap();
        let next = base + self.interval;
        let entry = table.entry(key.to_string()).or_insert(next);
        // Never move a key backward.
        *entry = (*entry).max(next);
    }

    /// Absorb an external rate-limit rejection: push the key's clock out by
    /// `delay` and suspend the caller for that duration.
    pub async fn apply_retry_after(&self, key: &str, delay: Duration) {
        warn!(key, delay_secs = delay.as_secs_f64(), "retry-after backoff");
        let resume_at = Instant::now() + delay;
        {
            #[allow(clippy::unwrap_used)]
            let mut table = self.next_allowed.lock().unwrap();
            let entry = table.entry(key.to_string()).or_insert(resume_at);
            *entry = (*entry).max(resume_at);
        }
        tokio::time::sleep_until(resume_at).await;
        debug!(key, "retry-after backoff elapsed");
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn peek_does_not_mutate() {
        let limiter = RateLimiter::new(Duration::from_secs(1));
        let first = limiter.peek_ready_at("chat", None);
        let second = limiter.peek_ready_at("chat", None);
        assert_eq!(first, second);
    }

    #[tokio::test(start_paused = true)]
    async fn commit_spaces_dispatches_by_interval() {
        let limiter = RateLimiter::new(Duration::from_secs(1));
        let now = Instant::now();
        limiter.commit("chat", now);
        let ready = limiter.peek_ready_at("chat", None);
        assert_eq!(ready, now + Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_independent() {
        let limiter = RateLimiter::new(Duration::from_secs(1));
        limiter.commit("a", Instant::now());
        assert_eq!(limiter.peek_ready_at("b", None), Instant::now());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_interval_is_unlimited() {
        let limiter = RateLimiter::new(Duration::ZERO);
        limiter.commit("chat", Instant::now());
        assert_eq!(limiter.peek_ready_at("chat", None), Instant::now());
    }

    #[tokio::test(start_paused = true)]
    async fn not_before_is_honoured() {
        let limiter = RateLimiter::new(Duration::from_secs(1));
        let later = Instant::now() + Duration::from_secs(5);
        assert_eq!(limiter.peek_ready_at("chat", Some(later)), later);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_pushes_and_sleeps() {
        let limiter = RateLimiter::new(Duration::from_secs(1));
        let before = Instant::now();
        limiter.apply_retry_after("chat", Duration::from_secs(30)).await;
        assert!(Instant::now() - before >= Duration::from_secs(30));
        // The key stays blocked until the backoff instant.
        assert!(limiter.peek_ready_at("chat", None) <= Instant::now());
    }

    #[tokio::test(start_paused = true)]
    async fn key_never_moves_backward() {
        let limiter = RateLimiter::new(Duration::from_secs(1));
        limiter.apply_retry_after("chat", Duration::from_secs(10)).await;
        // A commit scheduled in the past must not shrink the window set by
        // a later retry-after.
        let far = limiter.peek_ready_at("chat", None);
        limiter.commit("chat", Instant::now() - Duration::from_secs(60));
        assert!(limiter.peek_ready_at("chat", None) >= far);
    }
}
