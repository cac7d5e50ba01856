// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt::Debug;
use std::time::Duration;

/// Point-in-time statistics of a tracked strategy.
///
/// Depending on where it came from this covers either the whole lifetime of the strategy
/// ([`StatsProvider::stats`]) or the period since the previous poll ([`StatsProvider::diff_stats`]).
/// Delay fields describe the delays produced by the strategy, not request latencies; they are
/// zero when no delay was produced in the covered period.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackupRequestsStrategyStats {
    allowed: u64,
    successful: u64,
    min_delay: Duration,
    max_delay: Duration,
    avg_delay: Duration,
}

impl BackupRequestsStrategyStats {
    pub(crate) fn new(allowed: u64, successful: u64, min_delay: Duration, max_delay: Duration, avg_delay: Duration) -> Self {
        Self {
            allowed,
            successful,
            min_delay,
            max_delay,
            avg_delay,
        }
    }

    /// Number of backup requests the strategy allowed.
    #[must_use]
    pub fn allowed(&self) -> u64 {
        self.allowed
    }

    /// Number of backup requests that completed before their original request.
    #[must_use]
    pub fn successful(&self) -> u64 {
        self.successful
    }

    /// Shortest produced delay.
    #[must_use]
    pub fn min_delay(&self) -> Duration {
        self.min_delay
    }

    /// Longest produced delay.
    #[must_use]
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Mean of the produced delays.
    #[must_use]
    pub fn avg_delay(&self) -> Duration {
        self.avg_delay
    }
}

/// Source of backup request statistics for one service operation.
pub trait StatsProvider: Debug + Send + Sync {
    /// Statistics accumulated since the provider was created.
    fn stats(&self) -> BackupRequestsStrategyStats;

    /// Statistics accumulated since the previous call, or since creation on the first call.
    fn diff_stats(&self) -> BackupRequestsStrategyStats;
}

/// Immutable summary of produced delays, in nanoseconds.
///
/// `total_*` fields cover the lifetime of the strategy. `window_*` fields cover the period since
/// the last diff and are reset by it. Updates produce a new value; the current one is never
/// mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DelayStats {
    pub total_count: u64,
    pub total_sum: u64,
    pub total_min: u64,
    pub total_max: u64,
    pub window_min: u64,
    pub window_max: u64,
}

impl DelayStats {
    pub const EMPTY: Self = Self {
        total_count: 0,
        total_sum: 0,
        total_min: u64::MAX,
        total_max: 0,
        window_min: u64::MAX,
        window_max: 0,
    };

    #[must_use]
    pub fn record(&self, delay: u64) -> Self {
        Self {
            total_count: self.total_count.wrapping_add(1),
            total_sum: self.total_sum.wrapping_add(delay),
            total_min: self.total_min.min(delay),
            total_max: self.total_max.max(delay),
            window_min: self.window_min.min(delay),
            window_max: self.window_max.max(delay),
        }
    }

    #[must_use]
    pub fn reset_window(&self) -> Self {
        Self {
            window_min: u64::MAX,
            window_max: 0,
            ..*self
        }
    }
}

/// Turns a `(count, sum, min, max)` delay summary into durations; empty summaries are all zero.
pub(crate) fn delay_durations(count: u64, sum: u64, min: u64, max: u64) -> (Duration, Duration, Duration) {
    if count == 0 {
        return (Duration::ZERO, Duration::ZERO, Duration::ZERO);
    }

    (Duration::from_nanos(min), Duration::from_nanos(max), Duration::from_nanos(sum / count))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_updates_totals_and_window() {
        let stats = DelayStats::EMPTY.record(10).record(30).record(20);

        assert_eq!(stats.total_count, 3);
        assert_eq!(stats.total_sum, 60);
        assert_eq!(stats.total_min, 10);
        assert_eq!(stats.total_max, 30);
        assert_eq!(stats.window_min, 10);
        assert_eq!(stats.window_max, 30);
    }

    #[test]
    fn reset_window_keeps_totals() {
        let stats = DelayStats::EMPTY.record(10).record(30).reset_window().record(20);

        assert_eq!(stats.total_count, 3);
        assert_eq!(stats.total_min, 10);
        assert_eq!(stats.total_max, 30);
        assert_eq!(stats.window_min, 20);
        assert_eq!(stats.window_max, 20);
    }

    #[test]
    fn empty_durations_are_zero() {
        assert_eq!(delay_durations(0, 0, u64::MAX, 0), (Duration::ZERO, Duration::ZERO, Duration::ZERO));
        assert_eq!(
            delay_durations(2, 30, 10, 20),
            (Duration::from_nanos(10), Duration::from_nanos(20), Duration::from_nanos(15))
        );
    }
}
