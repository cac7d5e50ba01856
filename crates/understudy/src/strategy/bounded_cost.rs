// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::Duration;

use super::sliding_window::SlidingWindowEstimator;
use super::{BackupRequestsStrategy, BoundedCostOptions, InvalidOptionsError};
use crate::cost_limiter::{BurstyBarrier, CostLimiter};

/// Strategy that waits for a latency percentile and caps the share of backed up requests.
///
/// The delay is the `(100 - percent)`th percentile of the most recent `history_length`
/// completions, floored at `min_backup_delay`. Whether a backup is actually sent is decided by a
/// [`CostLimiter`], a [`BurstyBarrier`] by default, so at most `percent`% of requests are
/// duplicated even when latencies degrade across the board.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use understudy::{BackupRequestsStrategy, BoundedCostOptions, BoundedCostStrategy};
///
/// let strategy = BoundedCostStrategy::new(
///     BoundedCostOptions::new(5.0)
///         .history_length(1000)
///         .required_history_length(500)
///         .max_burst(1),
/// )?;
///
/// // Not enough history yet.
/// assert_eq!(strategy.time_until_backup_request(), None);
///
/// for _ in 0..500 {
///     strategy.record_completion(Duration::from_millis(10));
/// }
/// assert!(strategy.time_until_backup_request().is_some());
/// # Ok::<(), understudy::InvalidOptionsError>(())
/// ```
#[derive(Debug)]
pub struct BoundedCostStrategy<L = BurstyBarrier> {
    estimator: SlidingWindowEstimator,
    cost_limiter: L,
    options: BoundedCostOptions,
}

impl BoundedCostStrategy {
    /// Creates a strategy limited by a [`BurstyBarrier`].
    ///
    /// # Errors
    ///
    /// Returns [`InvalidOptionsError`] if any option is out of range.
    pub fn new(options: BoundedCostOptions) -> Result<Self, InvalidOptionsError> {
        options.validate()?;
        Ok(Self::from_validated(options))
    }

    /// Creates a strategy from options that already passed [`BoundedCostOptions::validate`].
    pub(crate) fn from_validated(options: BoundedCostOptions) -> Self {
        let barrier = BurstyBarrier::new(options.percent, options.max_burst);
        Self::build(options, barrier)
    }
}

impl<L: CostLimiter> BoundedCostStrategy<L> {
    /// Creates a strategy that asks `cost_limiter` before allowing backup requests.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidOptionsError`] if any option is out of range.
    pub fn with_cost_limiter(options: BoundedCostOptions, cost_limiter: L) -> Result<Self, InvalidOptionsError> {
        options.validate()?;
        Ok(Self::build(options, cost_limiter))
    }

    /// Options this strategy was built from.
    #[must_use]
    pub fn options(&self) -> &BoundedCostOptions {
        &self.options
    }

    fn build(options: BoundedCostOptions, cost_limiter: L) -> Self {
        Self {
            estimator: SlidingWindowEstimator::new(&options),
            cost_limiter,
            options,
        }
    }
}

impl<L: CostLimiter> BackupRequestsStrategy for BoundedCostStrategy<L> {
    fn time_until_backup_request(&self) -> Option<Duration> {
        self.cost_limiter.arrive();
        self.estimator.percentile_value()
    }

    fn is_backup_request_allowed(&self) -> bool {
        self.cost_limiter.can_pass_through()
    }

    fn record_completion(&self, duration: Duration) {
        self.estimator.record_completion(duration);
    }
}
