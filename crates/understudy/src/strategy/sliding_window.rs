// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Mutex;
use std::time::Duration;

use crate::constants::{ERR_POISONED_LOCK, HIGH_NANOS, LOW_NANOS, clamp_nanos};
use crate::histogram::WindowHistogram;
use crate::strategy::BoundedCostOptions;

/// Percentile of the most recent completions, floored at a minimum delay.
///
/// The histogram and the ring of raw samples are updated together under one mutex, so the
/// bucket counts always describe exactly the values currently held in `history`.
#[derive(Debug)]
pub(crate) struct SlidingWindowEstimator {
    window: Mutex<Window>,
    percentile: f64,
    required_history_length: usize,
    min_backup_delay: Duration,
}

impl SlidingWindowEstimator {
    pub fn new(options: &BoundedCostOptions) -> Self {
        Self {
            window: Mutex::new(Window {
                histogram: WindowHistogram::new(LOW_NANOS, HIGH_NANOS),
                history: vec![0; options.history_length],
                cursor: 0,
                warmed: false,
            }),
            percentile: 100.0 - options.percent,
            required_history_length: options.required_history_length,
            min_backup_delay: options.min_backup_delay,
        }
    }

    /// Returns `None` until enough completions were recorded.
    pub fn percentile_value(&self) -> Option<Duration> {
        let nanos = {
            let mut window = self.window.lock().expect(ERR_POISONED_LOCK);
            if !window.warmed {
                return None;
            }
            window.histogram.value_at_percentile(self.percentile)
        };

        Some(Duration::from_nanos(nanos).max(self.min_backup_delay))
    }

    pub fn record_completion(&self, duration: Duration) {
        let value = clamp_nanos(duration);
        self.window
            .lock()
            .expect(ERR_POISONED_LOCK)
            .record(value, self.required_history_length);
    }
}

#[derive(Debug)]
struct Window {
    histogram: WindowHistogram,
    history: Vec<u64>,
    cursor: usize,
    warmed: bool,
}

impl Window {
    fn record(&mut self, value: u64, required_history_length: usize) {
        let slot = self.cursor;
        let evicted = std::mem::replace(&mut self.history[slot], value);

        // The evicted bucket goes first so the histogram never holds more samples than the window.
        if evicted != 0 {
            self.histogram.decrement(evicted);
        }
        self.histogram.record(value);

        self.cursor = (slot + 1) % self.history.len();
        if !self.warmed && slot + 1 >= required_history_length {
            self.warmed = true;
        }
    }
}
