// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Latency-driven backup (hedged) request decisions with bounded cost.
//!
//! A backup request is a duplicate of an in-flight request, sent after a delay in the hope that
//! it completes before the slow original. This crate decides *when* to send one and *whether*
//! it may be sent at all. It does not send, cancel or route requests.
//!
//! # How It Works
//!
//! [`BoundedCostStrategy`] keeps a sliding window of recent request latencies. Once enough
//! history is collected, it answers "how long should this request wait before it is backed
//! up?" with the `(100 - percent)`th latency percentile. Only requests slower than that are
//! candidates for a backup, and a [`CostLimiter`] ([`BurstyBarrier`] by default) caps the
//! share of backed up requests at `percent`%, even when every request turns slow.
//!
//! Every request follows the [`BackupRequestsStrategy`] call sequence:
//!
//! 1. [`time_until_backup_request`][BackupRequestsStrategy::time_until_backup_request] right
//!    after dispatch.
//! 2. [`is_backup_request_allowed`][BackupRequestsStrategy::is_backup_request_allowed] once the
//!    delay elapsed without a response.
//! 3. [`record_completion`][BackupRequestsStrategy::record_completion] when the original
//!    completes.
//!
//! [`BackupRequestAttempt`] drives this sequence for a single request.
//!
//! # Statistics
//!
//! [`TrackingStrategy`] wraps a strategy and counts allowed and successful backup requests,
//! summarizes the produced delays and collects request latencies into
//! [`LatencyHistogramBuffer`]s that can be harvested without blocking request threads.
//!
//! # Configuration
//!
//! [`StrategyBinding`] builds a tracked strategy from a JSON configuration map and keeps it
//! across configuration refreshes that do not change anything, so the warmed up latency window
//! survives. [`BackupRequestsRegistry`] manages the bindings of every service operation and
//! reports to a [`StatsConsumer`].
//!
//! # Quick Start
//!
//! ```rust
//! use std::time::Duration;
//!
//! use understudy::{BackupRequestsStrategy, BoundedCostOptions, BoundedCostStrategy};
//!
//! let strategy = BoundedCostStrategy::new(
//!     BoundedCostOptions::new(5.0)
//!         .history_length(1000)
//!         .required_history_length(500),
//! )?;
//!
//! for _ in 0..500 {
//!     strategy.record_completion(Duration::from_millis(10));
//! }
//!
//! // Wait about 10ms for a response before considering a backup request.
//! let delay = strategy.time_until_backup_request().unwrap();
//! assert!(delay >= Duration::from_millis(10));
//! # Ok::<(), understudy::InvalidOptionsError>(())
//! ```
//!
//! # Features
//!
//! - `metrics`: reports backup request events through OpenTelemetry, see
//!   [`BackupRequestsRegistry::enable_metrics`].
//!
//! Structured logs are always emitted through [`tracing`].

mod attempt;
mod config;
mod constants;
mod cost_limiter;
mod histogram;
mod latency_buffer;
mod registry;
mod strategy;
pub mod telemetry;
mod tracking;

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
pub(crate) mod testing;

#[cfg(doctest)]
#[doc = include_str!("../README.md")]
struct ReadmeDoctests;

pub use attempt::BackupRequestAttempt;
pub use config::{
    BOUNDED_COST_BACKUP_REQUESTS, BackupRequestsConfig, COST, ConfigError, HISTORY_LENGTH, MAX_BURST, MIN_BACKUP_DELAY_MS,
    OPERATION, REQUIRED_HISTORY_LENGTH, STRATEGY, StrategyBinding, TrackedStrategy, resolve_options,
};
pub use constants::{HIGH_NANOS, LOW_NANOS};
pub use cost_limiter::{BurstyBarrier, CostLimiter};
pub use latency_buffer::{LatencyHistogram, LatencyHistogramBuffer};
pub use registry::{BackupRequestsRegistry, StatsConsumer};
pub use strategy::{BackupRequestsStrategy, BoundedCostOptions, BoundedCostStrategy, InvalidOptionsError};
pub use tracking::{BackupRequestsStrategyStats, StatsProvider, TrackingStrategy};
