// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Statistics tracking around a backup requests strategy.

mod stats;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
pub use stats::{BackupRequestsStrategyStats, StatsProvider};
use stats::{DelayStats, delay_durations};

use crate::constants::clamp_nanos;
use crate::latency_buffer::LatencyHistogramBuffer;
use crate::strategy::BackupRequestsStrategy;
use crate::telemetry::{BackupEvent, StrategyTelemetry};

/// Decorates a strategy with cumulative and since-last-poll statistics.
///
/// The wrapper forwards all three strategy calls to the inner strategy and additionally counts
/// allowed backups and summarizes the produced delays. Whether a backup request beat its original
/// cannot be observed through the strategy calls; the caller reports it with
/// [`backup_request_success`][Self::backup_request_success].
///
/// Two [`LatencyHistogramBuffer`]s collect request latencies for telemetry: one for requests
/// that completed with help of a backup request, one for the latencies the original request
/// alone would have had. The caller fills both; harvesting is up to the stats consumer.
///
/// Everything here is lock-free: counters are atomics and delay summaries are immutable values
/// replaced through compare-and-swap.
///
/// # Examples
///
/// ```rust
/// use understudy::{BackupRequestsStrategy, BoundedCostOptions, BoundedCostStrategy, StatsProvider, TrackingStrategy};
///
/// let strategy = TrackingStrategy::new(BoundedCostStrategy::new(BoundedCostOptions::new(5.0))?);
///
/// assert_eq!(strategy.time_until_backup_request(), None);
/// assert_eq!(strategy.stats().allowed(), 0);
/// # Ok::<(), understudy::InvalidOptionsError>(())
/// ```
#[derive(Debug)]
pub struct TrackingStrategy<S> {
    inner: S,
    allowed: AtomicU64,
    successful: AtomicU64,
    ledger: ArcSwap<Ledger>,
    latency_with_backup: LatencyHistogramBuffer,
    latency_without_backup: LatencyHistogramBuffer,
    telemetry: Option<StrategyTelemetry>,
}

/// Produced delays together with the cumulative values captured by the previous diff.
///
/// Both live in one record so a single swap resets the delay window and installs the new
/// baseline; a diff can never pair the counts of one period with the window of another.
#[derive(Debug, Clone, Copy)]
struct Ledger {
    delays: DelayStats,
    baseline: Baseline,
}

#[derive(Debug, Clone, Copy)]
struct Baseline {
    allowed: u64,
    successful: u64,
    delay_count: u64,
    delay_sum: u64,
}

impl Ledger {
    const EMPTY: Self = Self {
        delays: DelayStats::EMPTY,
        baseline: Baseline {
            allowed: 0,
            successful: 0,
            delay_count: 0,
            delay_sum: 0,
        },
    };

    fn record(&self, delay: u64) -> Self {
        Self {
            delays: self.delays.record(delay),
            ..*self
        }
    }
}

impl<S> TrackingStrategy<S> {
    /// Wraps `inner`.
    #[must_use]
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            allowed: AtomicU64::new(0),
            successful: AtomicU64::new(0),
            ledger: ArcSwap::from_pointee(Ledger::EMPTY),
            latency_with_backup: LatencyHistogramBuffer::new(),
            latency_without_backup: LatencyHistogramBuffer::new(),
            telemetry: None,
        }
    }

    pub(crate) fn with_telemetry(self, telemetry: StrategyTelemetry) -> Self {
        Self {
            telemetry: Some(telemetry),
            ..self
        }
    }

    /// The wrapped strategy.
    #[must_use]
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Reports that a backup request completed before its original request.
    pub fn backup_request_success(&self) {
        self.successful.fetch_add(1, Ordering::AcqRel);
        self.report(BackupEvent::Succeeded);
    }

    /// Latencies of requests that completed with a backup request in play.
    #[must_use]
    pub fn latency_with_backup(&self) -> &LatencyHistogramBuffer {
        &self.latency_with_backup
    }

    /// Latencies of original requests, as if no backup request was sent.
    #[must_use]
    pub fn latency_without_backup(&self) -> &LatencyHistogramBuffer {
        &self.latency_without_backup
    }

    fn report(&self, event: BackupEvent) {
        if let Some(telemetry) = &self.telemetry {
            telemetry.report(event);
        }
    }
}

impl<S: BackupRequestsStrategy> BackupRequestsStrategy for TrackingStrategy<S> {
    fn time_until_backup_request(&self) -> Option<Duration> {
        let delay = self.inner.time_until_backup_request()?;
        let nanos = clamp_nanos(delay);
        self.ledger.rcu(|current| current.record(nanos));
        Some(delay)
    }

    fn is_backup_request_allowed(&self) -> bool {
        let allowed = self.inner.is_backup_request_allowed();
        if allowed {
            self.allowed.fetch_add(1, Ordering::AcqRel);
            self.report(BackupEvent::Allowed);
        } else {
            self.report(BackupEvent::Denied);
        }
        allowed
    }

    fn record_completion(&self, duration: Duration) {
        self.inner.record_completion(duration);
    }
}

impl<S: BackupRequestsStrategy> StatsProvider for TrackingStrategy<S> {
    fn stats(&self) -> BackupRequestsStrategyStats {
        let delays = self.ledger.load().delays;
        let (min, max, avg) = delay_durations(delays.total_count, delays.total_sum, delays.total_min, delays.total_max);

        BackupRequestsStrategyStats::new(
            self.allowed.load(Ordering::Acquire),
            self.successful.load(Ordering::Acquire),
            min,
            max,
            avg,
        )
    }

    fn diff_stats(&self) -> BackupRequestsStrategyStats {
        loop {
            let ledger = self.ledger.load_full();
            let allowed = self.allowed.load(Ordering::Acquire);
            let successful = self.successful.load(Ordering::Acquire);

            let delays = ledger.delays;
            let next = Ledger {
                delays: delays.reset_window(),
                baseline: Baseline {
                    allowed,
                    successful,
                    delay_count: delays.total_count,
                    delay_sum: delays.total_sum,
                },
            };

            // Losing the swap means a delay was recorded or another diff won; start over.
            let previous = self.ledger.compare_and_swap(&ledger, Arc::new(next));
            if !Arc::ptr_eq(&previous, &ledger) {
                continue;
            }

            let last = ledger.baseline;
            let count = delays.total_count.wrapping_sub(last.delay_count);
            let sum = delays.total_sum.wrapping_sub(last.delay_sum);
            let (min, max, avg) = delay_durations(count, sum, delays.window_min, delays.window_max);

            return BackupRequestsStrategyStats::new(
                allowed.wrapping_sub(last.allowed),
                successful.wrapping_sub(last.successful),
                min,
                max,
                avg,
            );
        }
    }
}
