// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt::{self, Debug};
use std::ops::Deref;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::time::Duration;

use hdrhistogram::Histogram;

use crate::constants::{HIGH_NANOS, LOW_NANOS, SIGNIFICANT_DIGITS, clamp_nanos};

/// Histogram type handed out by [`LatencyHistogramBuffer`].
///
/// Short counts keep the buffer small; a bucket that would exceed `u16::MAX` triggers an
/// overflow delivery instead of saturating.
pub type LatencyHistogram = Histogram<u16>;

/// Double-buffered latency histogram that can be harvested without blocking writers.
///
/// Two histograms take turns: the *active* one accepts recorded values while the *inactive*
/// one sits empty, ready to be swapped in. Each histogram lives in a slot that either owns it
/// or is empty; taking the histogram out of a slot grants exclusive access to it, so a single
/// histogram is never written by two threads at once.
///
/// Latencies are recorded in nanoseconds and clamped to `[LOW_NANOS, HIGH_NANOS]`.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use understudy::LatencyHistogramBuffer;
///
/// let buffer = LatencyHistogramBuffer::new();
/// buffer.record(Duration::from_millis(12), |_overflowed| {});
/// buffer.record(Duration::from_millis(15), |_overflowed| {});
///
/// buffer.harvest(|histogram| assert_eq!(histogram.len(), 2));
/// buffer.harvest(|histogram| assert_eq!(histogram.len(), 0));
/// ```
pub struct LatencyHistogramBuffer {
    active: Slot,
    inactive: Slot,
}

impl LatencyHistogramBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            active: Slot::new(new_histogram()),
            inactive: Slot::new(new_histogram()),
        }
    }

    /// Records a latency.
    ///
    /// If the active histogram cannot hold another occurrence of the value, the inactive
    /// histogram becomes active, the value is recorded there, and the full histogram is passed
    /// to `on_overflow` before being reset. The callback must not keep the histogram around,
    /// since the instance is reused afterwards.
    pub fn record(&self, latency: Duration, on_overflow: impl FnOnce(&LatencyHistogram)) {
        let value = clamp_nanos(latency);
        let mut active = self.active.claim();

        if active.count_at(value) < u16::MAX {
            record_value(&mut active, value);
            self.active.release(active);
            return;
        }

        let mut fresh = self.inactive.claim();
        record_value(&mut fresh, value);
        self.active.release(fresh);

        let full = Parked::new(active, &self.inactive);
        let histogram: &LatencyHistogram = &full;
        on_overflow(histogram);
    }

    /// Passes every value recorded since the previous harvest (or overflow) to `consumer`.
    ///
    /// Writers keep recording into the other histogram while `consumer` runs. The consumer must
    /// not keep the histogram around, since the instance is reset and reused afterwards. A panicking
    /// consumer loses the harvested values but leaves the buffer usable.
    pub fn harvest<R>(&self, consumer: impl FnOnce(&LatencyHistogram) -> R) -> R {
        let harvested = self.active.claim();
        let fresh = self.inactive.claim();
        self.active.release(fresh);

        let harvested = Parked::new(harvested, &self.inactive);
        let histogram: &LatencyHistogram = &harvested;
        consumer(histogram)
    }
}

impl Default for LatencyHistogramBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for LatencyHistogramBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LatencyHistogramBuffer")
            .field("low", &LOW_NANOS)
            .field("high", &HIGH_NANOS)
            .finish_non_exhaustive()
    }
}

fn new_histogram() -> Box<LatencyHistogram> {
    Box::new(Histogram::new_with_bounds(LOW_NANOS, HIGH_NANOS, SIGNIFICANT_DIGITS).expect("static histogram bounds are valid"))
}

fn record_value(histogram: &mut LatencyHistogram, value: u64) {
    // Clamped values are within the histogram bounds and the caller checked the bucket has room.
    let _ = histogram.record(value);
}

/// A histogram on loan to a callback.
///
/// Dropping it resets the histogram and puts it back into its slot, also when the callback
/// unwinds. An empty slot would make every later claim spin forever.
struct Parked<'a> {
    histogram: Option<Box<LatencyHistogram>>,
    slot: &'a Slot,
}

impl<'a> Parked<'a> {
    fn new(histogram: Box<LatencyHistogram>, slot: &'a Slot) -> Self {
        Self {
            histogram: Some(histogram),
            slot,
        }
    }
}

impl Deref for Parked<'_> {
    type Target = LatencyHistogram;

    fn deref(&self) -> &Self::Target {
        self.histogram.as_deref().unwrap_or_else(|| unreachable!("parked histogram is present until dropped"))
    }
}

impl Drop for Parked<'_> {
    fn drop(&mut self) {
        if let Some(mut histogram) = self.histogram.take() {
            histogram.reset();
            self.slot.release(histogram);
        }
    }
}

/// Holds either an owned histogram or nothing.
///
/// Claiming swaps the slot to empty and spins while another thread holds the histogram;
/// releasing puts a histogram back into an empty slot.
struct Slot {
    ptr: AtomicPtr<LatencyHistogram>,
}

impl Slot {
    fn new(histogram: Box<LatencyHistogram>) -> Self {
        Self {
            ptr: AtomicPtr::new(Box::into_raw(histogram)),
        }
    }

    fn claim(&self) -> Box<LatencyHistogram> {
        loop {
            let current = self.ptr.swap(ptr::null_mut(), Ordering::AcqRel);
            if !current.is_null() {
                // SAFETY: non-null pointers stored in the slot always come from `Box::into_raw`
                // and the swap above removed it from the slot, so this thread is its only owner.
                return unsafe { Box::from_raw(current) };
            }
            std::hint::spin_loop();
        }
    }

    fn release(&self, histogram: Box<LatencyHistogram>) {
        let previous = self.ptr.swap(Box::into_raw(histogram), Ordering::AcqRel);
        debug_assert!(previous.is_null(), "released a histogram into an occupied slot");
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        let current = *self.ptr.get_mut();
        if !current.is_null() {
            // SAFETY: we have exclusive access during drop and the pointer came from `Box::into_raw`.
            drop(unsafe { Box::from_raw(current) });
        }
    }
}
