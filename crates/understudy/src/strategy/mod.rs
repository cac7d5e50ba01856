// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Backup request decision strategies.

mod bounded_cost;
mod options;
mod sliding_window;

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

pub use bounded_cost::BoundedCostStrategy;
pub use options::{BoundedCostOptions, InvalidOptionsError};

/// Decides when a backup request should be sent.
///
/// For every outgoing request the caller follows a strict sequence:
///
/// 1. Right after dispatching the original request, call
///    [`time_until_backup_request`][Self::time_until_backup_request] exactly once.
/// 2. If it returned a delay and no response arrived within it, call
///    [`is_backup_request_allowed`][Self::is_backup_request_allowed] at most once. It must not be
///    called once the original request has completed.
/// 3. When the original request completes (successfully or not), call
///    [`record_completion`][Self::record_completion] exactly once with its latency.
///
/// Implementations are shared by all requests of an operation and must never block for
/// unbounded time.
pub trait BackupRequestsStrategy: Debug + Send + Sync {
    /// Returns how long to wait before considering a backup request.
    ///
    /// `None` means no backup request should be sent for this request.
    fn time_until_backup_request(&self) -> Option<Duration>;

    /// Returns `true` if a backup request may be sent now.
    fn is_backup_request_allowed(&self) -> bool;

    /// Reports the latency of a completed original request.
    fn record_completion(&self, duration: Duration);
}

impl<S: BackupRequestsStrategy + ?Sized> BackupRequestsStrategy for Arc<S> {
    fn time_until_backup_request(&self) -> Option<Duration> {
        (**self).time_until_backup_request()
    }

    fn is_backup_request_allowed(&self) -> bool {
        (**self).is_backup_request_allowed()
    }

    fn record_completion(&self, duration: Duration) {
        (**self).record_completion(duration);
    }
}

impl<S: BackupRequestsStrategy + ?Sized> BackupRequestsStrategy for Box<S> {
    fn time_until_backup_request(&self) -> Option<Duration> {
        (**self).time_until_backup_request()
    }

    fn is_backup_request_allowed(&self) -> bool {
        (**self).is_backup_request_allowed()
    }

    fn record_completion(&self, duration: Duration) {
        (**self).record_completion(duration);
    }
}
