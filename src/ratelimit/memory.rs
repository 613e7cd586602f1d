//! In-process counter backend.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};

use super::backend::{CounterBackend, CounterError, CounterStatus};
use super::counter::{RateLimitCounter, TimeWindow};

/// Seconds between sweeps of expired counters.
const PURGE_INTERVAL_SECS: u64 = 60;

/// Counters held in this process, one per bucket key.
///
/// Suitable for a single gateway instance, tests and the CLI. Counts are not
/// shared with other instances. Expired counters are swept at most once per
/// [`PURGE_INTERVAL_SECS`] as increments arrive.
#[derive(Default)]
pub struct InMemoryCounterBackend {
    counters: DashMap<String, RateLimitCounter>,
    last_purge: AtomicU64,
}

impl InMemoryCounterBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment against an explicit clock, in seconds since the Unix epoch.
    pub fn increment_at(
        &self,
        key: &str,
        limit: u64,
        window: TimeWindow,
        hits: u64,
        now_secs: u64,
    ) -> CounterStatus {
        self.purge_if_due(now_secs);

        let mut counter = self
            .counters
            .entry(key.to_string())
            .or_insert_with(|| RateLimitCounter::new(window, now_secs));
        // A reloaded rule may reuse the key with another unit
        if counter.window() != window {
            debug!(key = %key, from = ?counter.window(), to = ?window, "Counter window changed");
            *counter = RateLimitCounter::new(window, now_secs);
        }
        let current = counter.increment_at(hits, now_secs);

        trace!(key = %key, current, limit, "Incremented counter");

        CounterStatus {
            current,
            limit,
            window: counter.window(),
            reset_after: counter.window().reset_after(now_secs),
        }
    }

    /// Count currently held for a key, if any.
    pub fn current_count(&self, key: &str, now_secs: u64) -> Option<u64> {
        self.counters
            .get(key)
            .map(|counter| counter.current_count_at(now_secs))
    }

    /// Drop counters whose window has ended.
    pub fn purge_expired(&self, now_secs: u64) {
        self.counters
            .retain(|_, counter| !counter.is_expired_at(now_secs));
    }

    fn purge_if_due(&self, now_secs: u64) {
        let last = self.last_purge.load(Ordering::Relaxed);
        if now_secs < last.saturating_add(PURGE_INTERVAL_SECS) {
            return;
        }
        // Only one caller sweeps per interval
        if self
            .last_purge
            .compare_exchange(last, now_secs, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            let before = self.counters.len();
            self.purge_expired(now_secs);
            trace!(purged = before.saturating_sub(self.counters.len()), "Purged expired counters");
        }
    }

    /// Get the number of active counters.
    pub fn counter_count(&self) -> usize {
        self.counters.len()
    }

    /// Clear all counters.
    pub fn clear(&self) {
        self.counters.clear();
    }
}

fn now_secs() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

#[async_trait]
impl CounterBackend for InMemoryCounterBackend {
    async fn increment_and_check(
        &self,
        key: &str,
        limit: u64,
        window: TimeWindow,
        hits: u64,
    ) -> Result<CounterStatus, CounterError> {
        Ok(self.increment_at(key, limit, window, hits, now_secs()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_increment_creates_counter() {
        let backend = InMemoryCounterBackend::new();
        let status = backend.increment_at("gateway:tree:0:a=1", 5, TimeWindow::Minute, 1, 600);

        assert_eq!(status.current, 1);
        assert_eq!(status.remaining(), 4);
        assert!(!status.over_limit());
        assert_eq!(status.reset_after, Duration::from_secs(60));
        assert_eq!(backend.counter_count(), 1);
    }

    #[test]
    fn test_over_limit_after_quota() {
        let backend = InMemoryCounterBackend::new();
        for _ in 0..2 {
            assert!(!backend.increment_at("k", 2, TimeWindow::Minute, 1, 600).over_limit());
        }
        let status = backend.increment_at("k", 2, TimeWindow::Minute, 1, 610);
        assert!(status.over_limit());
        assert_eq!(status.remaining(), 0);
        assert_eq!(status.reset_after, Duration::from_secs(50));
    }

    #[test]
    fn test_next_window_starts_fresh() {
        let backend = InMemoryCounterBackend::new();
        backend.increment_at("k", 1, TimeWindow::Second, 1, 10);
        assert!(backend.increment_at("k", 1, TimeWindow::Second, 1, 10).over_limit());
        assert!(!backend.increment_at("k", 1, TimeWindow::Second, 1, 11).over_limit());
    }

    #[test]
    fn test_changed_window_restarts_counter() {
        let backend = InMemoryCounterBackend::new();
        backend.increment_at("gateway:tree:0:a=1", 100, TimeWindow::Minute, 1, 600);

        let status = backend.increment_at("gateway:tree:0:a=1", 1, TimeWindow::Second, 1, 601);
        assert_eq!(status.window, TimeWindow::Second);
        assert_eq!(status.current, 1);
        assert!(!status.over_limit());
        assert_eq!(status.reset_after, Duration::from_secs(1));
    }

    #[test]
    fn test_different_keys_have_separate_counters() {
        let backend = InMemoryCounterBackend::new();
        backend.increment_at("a", 10, TimeWindow::Hour, 5, 0);
        backend.increment_at("b", 10, TimeWindow::Hour, 3, 0);

        assert_eq!(backend.current_count("a", 1), Some(5));
        assert_eq!(backend.current_count("b", 1), Some(3));
        assert_eq!(backend.current_count("c", 1), None);
    }

    #[test]
    fn test_expired_counters_are_swept_on_increment() {
        let backend = InMemoryCounterBackend::new();
        backend.increment_at("short", 10, TimeWindow::Second, 1, 100);
        backend.increment_at("long", 10, TimeWindow::Day, 1, 100);
        assert_eq!(backend.counter_count(), 2);

        // Within the sweep interval nothing is dropped
        backend.increment_at("other", 10, TimeWindow::Day, 1, 120);
        assert_eq!(backend.counter_count(), 3);

        backend.increment_at("other", 10, TimeWindow::Day, 1, 100 + PURGE_INTERVAL_SECS);
        assert_eq!(backend.counter_count(), 2);
        assert_eq!(backend.current_count("short", 200), None);
    }

    #[test]
    fn test_purge_and_clear() {
        let backend = InMemoryCounterBackend::new();
        backend.increment_at("short", 10, TimeWindow::Second, 1, 100);
        backend.increment_at("long", 10, TimeWindow::Day, 1, 100);

        backend.purge_expired(101);
        assert_eq!(backend.counter_count(), 1);
        assert_eq!(backend.current_count("long", 101), Some(1));

        backend.clear();
        assert_eq!(backend.counter_count(), 0);
    }

    #[tokio::test]
    async fn test_trait_uses_wall_clock() {
        let backend = InMemoryCounterBackend::new();
        let status = backend
            .increment_and_check("k", 100, TimeWindow::Day, 2)
            .await
            .unwrap();
        assert_eq!(status.current, 2);
        assert!(status.reset_after <= Duration::from_secs(86400));
    }
}
