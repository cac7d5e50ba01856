// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::Duration;

/// Lowest latency tracked by the estimator and the latency buffers, in nanoseconds.
///
/// Recorded values below this are clamped up to it.
pub const LOW_NANOS: u64 = 1_000;

/// Highest latency tracked by the estimator and the latency buffers, in nanoseconds.
///
/// Recorded values above this are clamped down to it.
pub const HIGH_NANOS: u64 = 100_000_000_000;

/// Default number of recent completions kept in the sliding window.
pub(crate) const DEFAULT_HISTORY_LENGTH: usize = 1024;

/// Default number of completions that must be observed before a delay is produced.
pub(crate) const DEFAULT_REQUIRED_HISTORY_LENGTH: usize = 128;

/// Default maximum number of backup requests the cost limiter lets through in one burst.
pub(crate) const DEFAULT_MAX_BURST: u32 = 64;

/// Default lower bound for the backup delay.
pub(crate) const DEFAULT_MIN_BACKUP_DELAY: Duration = Duration::ZERO;

/// Default upper bound (exclusive) for the history length.
///
/// Every slot costs one `u64` plus its share of the window histogram, so anything at or above
/// this is treated as a configuration mistake.
pub(crate) const DEFAULT_HISTORY_LENGTH_LIMIT: usize = 1_000_000;

/// Smallest accepted value for both the history length and the required history length.
pub(crate) const MIN_HISTORY_LENGTH: usize = 100;

/// Number of significant decimal digits kept by the telemetry histograms.
pub(crate) const SIGNIFICANT_DIGITS: u8 = 3;

pub(crate) const ERR_POISONED_LOCK: &str = "poisoned lock - cannot continue execution because the sliding window may be inconsistent";

pub(crate) fn clamp_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos())
        .unwrap_or(u64::MAX)
        .clamp(LOW_NANOS, HIGH_NANOS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_nanos_respects_bounds() {
        assert_eq!(clamp_nanos(Duration::ZERO), LOW_NANOS);
        assert_eq!(clamp_nanos(Duration::from_millis(10)), 10_000_000);
        assert_eq!(clamp_nanos(Duration::from_secs(1_000)), HIGH_NANOS);
        assert_eq!(clamp_nanos(Duration::MAX), HIGH_NANOS);
    }
}
