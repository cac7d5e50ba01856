// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tick::{Clock, Stopwatch};

use crate::config::TrackedStrategy;
use crate::latency_buffer::LatencyHistogram;
use crate::registry::{StatsConsumer, deliver_latencies};
use crate::strategy::BackupRequestsStrategy;

/// Bookkeeping for one request that may be backed up.
///
/// Drives the strategy call sequence for a single request so callers only report what happened:
///
/// - [`begin`][Self::begin] asks the strategy for the delay and starts measuring latency.
/// - [`try_start_backup`][Self::try_start_backup] is called once the delay elapsed without a
///   response.
/// - [`complete_original`][Self::complete_original] and [`complete_backup`][Self::complete_backup]
///   are called when the respective request completes. The first completion wins the race.
///
/// The completion methods take `&self`, so the attempt can be shared between the tasks running
/// the original and the backup request.
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
/// use tick::Clock;
/// use understudy::{BackupRequestAttempt, BoundedCostOptions, BoundedCostStrategy, TrackingStrategy};
///
/// let strategy = Arc::new(TrackingStrategy::new(BoundedCostStrategy::new(BoundedCostOptions::new(5.0))?));
/// let clock = Clock::new_frozen();
///
/// let attempt = BackupRequestAttempt::begin(strategy, &clock);
/// // Not enough history to produce a delay, so no backup request either.
/// assert_eq!(attempt.backup_delay(), None);
/// assert!(!attempt.try_start_backup());
/// assert!(attempt.complete_original());
/// # Ok::<(), understudy::InvalidOptionsError>(())
/// ```
#[derive(Debug)]
pub struct BackupRequestAttempt {
    strategy: Arc<TrackedStrategy>,
    stopwatch: Stopwatch,
    delay: Option<Duration>,
    backup_requested: AtomicBool,
    done: AtomicBool,
    sink: Option<LatencySink>,
}

#[derive(Debug)]
struct LatencySink {
    service: String,
    operation: String,
    consumer: Arc<dyn StatsConsumer>,
}

impl BackupRequestAttempt {
    /// Starts bookkeeping for a request that was just dispatched.
    #[must_use]
    pub fn begin(strategy: Arc<TrackedStrategy>, clock: &Clock) -> Self {
        let delay = strategy.time_until_backup_request();
        Self {
            strategy,
            stopwatch: clock.stopwatch(),
            delay,
            backup_requested: AtomicBool::new(false),
            done: AtomicBool::new(false),
            sink: None,
        }
    }

    pub(crate) fn with_consumer(self, service: &str, operation: &str, consumer: Arc<dyn StatsConsumer>) -> Self {
        Self {
            sink: Some(LatencySink {
                service: service.to_string(),
                operation: operation.to_string(),
                consumer,
            }),
            ..self
        }
    }

    /// How long to wait for the original response before trying a backup request.
    ///
    /// `None` means this request must not be backed up.
    #[must_use]
    pub fn backup_delay(&self) -> Option<Duration> {
        self.delay
    }

    /// Returns `true` if a backup request should be sent now.
    ///
    /// The strategy is asked at most once, and only if a delay was produced and no request has
    /// completed yet.
    pub fn try_start_backup(&self) -> bool {
        if self.delay.is_none() || self.done.load(Ordering::Acquire) {
            return false;
        }

        if self.backup_requested.swap(true, Ordering::AcqRel) {
            return false;
        }

        self.strategy.is_backup_request_allowed()
    }

    /// Reports that the original request completed. Returns `true` if it completed first.
    ///
    /// The latency always feeds the strategy's history, since it describes the service whether or
    /// not a backup request was sent.
    pub fn complete_original(&self) -> bool {
        let latency = self.stopwatch.elapsed();
        self.strategy.record_completion(latency);

        let won = !self.done.swap(true, Ordering::AcqRel);
        if won {
            self.record(self.strategy.latency_with_backup(), latency, true);
        }
        self.record(self.strategy.latency_without_backup(), latency, false);
        won
    }

    /// Reports that the backup request completed. Returns `true` if it completed first.
    pub fn complete_backup(&self) -> bool {
        let latency = self.stopwatch.elapsed();

        let won = !self.done.swap(true, Ordering::AcqRel);
        if won {
            self.strategy.backup_request_success();
            self.record(self.strategy.latency_with_backup(), latency, true);
        }
        won
    }

    fn record(&self, buffer: &crate::LatencyHistogramBuffer, latency: Duration, with_backup: bool) {
        buffer.record(latency, |histogram| self.deliver(histogram, with_backup));
    }

    fn deliver(&self, histogram: &LatencyHistogram, with_backup: bool) {
        if let Some(sink) = &self.sink {
            deliver_latencies(sink.consumer.as_ref(), &sink.service, &sink.operation, histogram, with_backup);
        }
    }
}
