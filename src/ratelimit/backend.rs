//! Counter backend trait for abstracting local and shared counter stores.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use super::counter::TimeWindow;

/// Counter state after an increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterStatus {
    /// Count in the current window, this increment included
    pub current: u64,
    pub limit: u64,
    pub window: TimeWindow,
    /// Time until the current window closes
    pub reset_after: Duration,
}

impl CounterStatus {
    pub fn over_limit(&self) -> bool {
        self.current > self.limit
    }

    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.current)
    }
}

#[derive(Debug, Error)]
pub enum CounterError {
    #[error("counter backend unavailable: {0}")]
    Unavailable(String),

    #[error("counter backend timed out after {0:?}")]
    Timeout(Duration),
}

/// Trait for counter backend implementations.
///
/// Increments must be atomic per key; when several gateway instances share a
/// backend, the backend owns that guarantee.
#[async_trait]
pub trait CounterBackend: Send + Sync {
    /// Add `hits` to the bucket `key` and report its state against `limit`.
    async fn increment_and_check(
        &self,
        key: &str,
        limit: u64,
        window: TimeWindow,
        hits: u64,
    ) -> Result<CounterStatus, CounterError>;
}
