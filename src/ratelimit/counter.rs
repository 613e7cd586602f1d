//! Fixed-window rate limit counters.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Time window for rate limiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeWindow {
    /// Per-second rate limiting
    Second,
    /// Per-minute rate limiting
    Minute,
    /// Per-hour rate limiting
    Hour,
    /// Per-day rate limiting
    Day,
}

impl TimeWindow {
    /// Get the duration of this time window.
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.seconds())
    }

    /// Length of the window in whole seconds.
    pub fn seconds(&self) -> u64 {
        match self {
            TimeWindow::Second => 1,
            TimeWindow::Minute => 60,
            TimeWindow::Hour => 3600,
            TimeWindow::Day => 86400,
        }
    }

    /// Start of the epoch-aligned window containing `now_secs`.
    pub fn window_start(&self, now_secs: u64) -> u64 {
        now_secs - now_secs % self.seconds()
    }

    /// Time left in the window containing `now_secs`.
    pub fn reset_after(&self, now_secs: u64) -> Duration {
        Duration::from_secs(self.window_start(now_secs) + self.seconds() - now_secs)
    }
}

/// A counter for one descriptor bucket.
///
/// Windows are aligned to the Unix epoch, so every instance sharing a clock
/// agrees on where a window starts. The count and the window start are
/// updated under one lock so a reset can never drop a concurrent increment.
pub struct RateLimitCounter {
    /// Requests counted in the current window
    count: AtomicU64,
    /// Time window for this counter
    window: TimeWindow,
    /// Epoch second at which the current window started
    window_start: Mutex<u64>,
}

impl RateLimitCounter {
    pub fn new(window: TimeWindow, now_secs: u64) -> Self {
        Self {
            count: AtomicU64::new(0),
            window,
            window_start: Mutex::new(window.window_start(now_secs)),
        }
    }

    /// Add `hits` to the window containing `now_secs`, returning the new count.
    pub fn increment_at(&self, hits: u64, now_secs: u64) -> u64 {
        let mut window_start = self.window_start.lock();
        self.roll(&mut window_start, now_secs);
        self.count.fetch_add(hits, Ordering::SeqCst) + hits
    }

    /// Count in the window containing `now_secs`.
    pub fn current_count_at(&self, now_secs: u64) -> u64 {
        let mut window_start = self.window_start.lock();
        self.roll(&mut window_start, now_secs);
        self.count.load(Ordering::SeqCst)
    }

    pub fn window(&self) -> TimeWindow {
        self.window
    }

    /// Whether the window this counter last saw has ended by `now_secs`.
    pub fn is_expired_at(&self, now_secs: u64) -> bool {
        *self.window_start.lock() + self.window.seconds() <= now_secs
    }

    fn roll(&self, window_start: &mut u64, now_secs: u64) {
        let current = self.window.window_start(now_secs);
        if current != *window_start {
            self.count.store(0, Ordering::SeqCst);
            *window_start = current;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_window_duration() {
        assert_eq!(TimeWindow::Second.duration(), Duration::from_secs(1));
        assert_eq!(TimeWindow::Minute.duration(), Duration::from_secs(60));
        assert_eq!(TimeWindow::Hour.duration(), Duration::from_secs(3600));
        assert_eq!(TimeWindow::Day.duration(), Duration::from_secs(86400));
    }

    #[test]
    fn test_epoch_aligned_windows() {
        assert_eq!(TimeWindow::Minute.window_start(125), 120);
        assert_eq!(TimeWindow::Minute.reset_after(125), Duration::from_secs(55));
        assert_eq!(TimeWindow::Minute.reset_after(120), Duration::from_secs(60));
        assert_eq!(TimeWindow::Second.reset_after(7), Duration::from_secs(1));
    }

    #[test]
    fn test_counter_increments_within_window() {
        let counter = RateLimitCounter::new(TimeWindow::Minute, 120);

        assert_eq!(counter.increment_at(1, 121), 1);
        assert_eq!(counter.increment_at(4, 179), 5);
        assert_eq!(counter.current_count_at(179), 5);
    }

    #[test]
    fn test_counter_resets_on_next_window() {
        let counter = RateLimitCounter::new(TimeWindow::Minute, 120);
        counter.increment_at(3, 130);

        assert!(!counter.is_expired_at(179));
        assert!(counter.is_expired_at(180));
        assert_eq!(counter.increment_at(1, 180), 1);
        assert_eq!(counter.current_count_at(200), 1);
    }

    #[test]
    fn test_parse_window_names() {
        let window: TimeWindow = serde_yaml::from_str("hour").unwrap();
        assert_eq!(window, TimeWindow::Hour);
        assert!(serde_yaml::from_str::<TimeWindow>("fortnight").is_err());
    }
}
