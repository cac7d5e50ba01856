// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};

/// Bounds the fraction of requests that may trigger a backup request.
///
/// The strategy reports every outgoing request through [`arrive`][CostLimiter::arrive] and asks
/// [`can_pass_through`][CostLimiter::can_pass_through] before a backup request is sent. How the
/// quota is accounted is up to the implementation.
pub trait CostLimiter: Debug + Send + Sync {
    /// Records the arrival of a request.
    fn arrive(&self);

    /// Returns `true` and consumes quota when a backup request may be sent now.
    fn can_pass_through(&self) -> bool;
}

/// Fixed-point scale of one token.
const TOKEN: u64 = 1_000_000;

/// Token-bucket limiter refilled by arrivals rather than by time.
///
/// Each arrival adds `percent / 100` of a token, up to `max_burst` tokens. Passing through
/// consumes one token. Over a long run at most `percent`% of arrivals pass, and at most
/// `max_burst` backups can be sent back to back after a quiet period.
///
/// Tokens are tracked as fixed-point micro-tokens in a single atomic, so both operations are
/// lock-free.
///
/// # Examples
///
/// ```rust
/// use understudy::{BurstyBarrier, CostLimiter};
///
/// let barrier = BurstyBarrier::new(50.0, 1);
/// barrier.arrive();
/// assert!(!barrier.can_pass_through());
///
/// barrier.arrive();
/// assert!(barrier.can_pass_through());
/// assert!(!barrier.can_pass_through());
/// ```
#[derive(Debug)]
pub struct BurstyBarrier {
    tokens: AtomicU64,
    refill: u64,
    capacity: u64,
}

impl BurstyBarrier {
    /// Creates a barrier that lets `percent`% of arrivals pass, in bursts of up to `max_burst`.
    ///
    /// `percent` is expected in `(0, 100)`; values outside are clamped to `[0, 100]`.
    #[must_use]
    #[expect(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss,
        reason = "percent is clamped to [0, 100] so the refill fits comfortably in u64"
    )]
    pub fn new(percent: f64, max_burst: u32) -> Self {
        let percent = percent.clamp(0.0, 100.0);
        Self {
            tokens: AtomicU64::new(0),
            refill: (percent / 100.0 * TOKEN as f64).round() as u64,
            capacity: u64::from(max_burst) * TOKEN,
        }
    }
}

impl CostLimiter for BurstyBarrier {
    fn arrive(&self) {
        let _ = self.tokens.fetch_update(Ordering::AcqRel, Ordering::Acquire, |tokens| {
            (tokens < self.capacity).then(|| tokens.saturating_add(self.refill).min(self.capacity))
        });
    }

    fn can_pass_through(&self) -> bool {
        self.tokens
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |tokens| tokens.checked_sub(TOKEN))
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    static_assertions::assert_impl_all!(BurstyBarrier: Send, Sync, Debug);

    #[test]
    fn nothing_passes_without_arrivals() {
        let barrier = BurstyBarrier::new(5.0, 10);
        assert!(!barrier.can_pass_through());
    }

    #[test]
    fn passes_configured_fraction() {
        let barrier = BurstyBarrier::new(5.0, 1);
        let mut passed = 0;
        for _ in 0..1_000 {
            barrier.arrive();
            if barrier.can_pass_through() {
                passed += 1;
            }
        }
        assert_eq!(passed, 50);
    }

    #[test]
    fn burst_is_capped() {
        let barrier = BurstyBarrier::new(50.0, 3);
        for _ in 0..100 {
            barrier.arrive();
        }

        let passed = (0..100).filter(|_| barrier.can_pass_through()).count();
        assert_eq!(passed, 3);
    }

    #[test]
    fn zero_burst_never_passes() {
        let barrier = BurstyBarrier::new(99.0, 0);
        for _ in 0..10 {
            barrier.arrive();
        }
        assert!(!barrier.can_pass_through());
    }

    #[test]
    fn concurrent_use_never_exceeds_quota() {
        let barrier = Arc::new(BurstyBarrier::new(10.0, 1_000));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let mut passed = 0_u32;
                    for _ in 0..1_000 {
                        barrier.arrive();
                        if barrier.can_pass_through() {
                            passed += 1;
                        }
                    }
                    passed
                })
            })
            .collect();

        let passed: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert!(passed <= 400, "passed {passed}");
    }
}
