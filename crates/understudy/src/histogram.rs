// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Log-linear bucketed histogram that supports removing previously recorded values.
//!
//! Values are grouped into buckets whose width grows with the magnitude of the value, so
//! every bucket covers roughly the same relative range (about 0.2%). Unlike a plain HDR
//! histogram, counts can be decremented, which lets a sliding window evict old samples in
//! constant time.
//!
//! Percentile lookups walk from the bucket selected by the previous lookup instead of from the
//! first bucket. When the window changes slowly between lookups, the walk covers only a few
//! buckets.

const SUB_BUCKET_BITS: u32 = 10;
const SUB_BUCKET_COUNT: u64 = 1 << SUB_BUCKET_BITS;
const SUB_BUCKET_HALF: u64 = SUB_BUCKET_COUNT >> 1;

#[derive(Debug, Clone)]
pub(crate) struct WindowHistogram {
    counts: Vec<u32>,
    total: u64,
    unit_shift: u32,
    lowest: u64,
    highest: u64,
    // Bucket selected by the last percentile lookup and the number of samples below it.
    rank_bucket: usize,
    below_rank_bucket: u64,
}

impl WindowHistogram {
    /// Creates a histogram covering `[lowest, highest]`.
    ///
    /// `lowest` must be at least 1 and smaller than `highest`.
    pub fn new(lowest: u64, highest: u64) -> Self {
        debug_assert!(lowest >= 1 && lowest < highest, "invalid histogram range");

        let unit_shift = 63 - lowest.max(1).leading_zeros();
        let mut histogram = Self {
            counts: Vec::new(),
            total: 0,
            unit_shift,
            lowest,
            highest,
            rank_bucket: 0,
            below_rank_bucket: 0,
        };
        histogram.counts = vec![0; histogram.index_of(highest) + 1];
        histogram
    }

    pub fn record(&mut self, value: u64) {
        let index = self.index_of(value);
        self.counts[index] = self.counts[index].saturating_add(1);
        self.total += 1;
        if index < self.rank_bucket {
            self.below_rank_bucket += 1;
        }
    }

    /// Removes one occurrence of `value`.
    ///
    /// The caller must only remove values it has recorded before.
    pub fn decrement(&mut self, value: u64) {
        let index = self.index_of(value);
        debug_assert!(self.counts[index] > 0, "removing a value that was never recorded");
        if self.counts[index] > 0 {
            self.counts[index] -= 1;
            self.total -= 1;
            if index < self.rank_bucket {
                self.below_rank_bucket -= 1;
            }
        }
    }

    pub fn total_count(&self) -> u64 {
        self.total
    }

    #[cfg(test)]
    pub fn count_at(&self, value: u64) -> u32 {
        self.counts[self.index_of(value)]
    }

    /// Returns the value below which `percentile` percent of recorded values fall.
    ///
    /// The result is the highest value equivalent to the selected bucket. Returns 0 when empty.
    #[expect(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        reason = "counts are bounded by the window length and the product is non-negative"
    )]
    pub fn value_at_percentile(&mut self, percentile: f64) -> u64 {
        if self.total == 0 {
            return 0;
        }

        let percentile = percentile.clamp(0.0, 100.0);
        let target = ((percentile / 100.0) * self.total as f64 + 0.5) as u64;
        let target = target.clamp(1, self.total);

        // Settle on the first bucket whose cumulative count reaches the target.
        while self.rank_bucket > 0 && self.below_rank_bucket >= target {
            self.rank_bucket -= 1;
            self.below_rank_bucket -= u64::from(self.counts[self.rank_bucket]);
        }
        while self.rank_bucket + 1 < self.counts.len()
            && self.below_rank_bucket + u64::from(self.counts[self.rank_bucket]) < target
        {
            self.below_rank_bucket += u64::from(self.counts[self.rank_bucket]);
            self.rank_bucket += 1;
        }

        self.highest_equivalent(self.rank_bucket)
    }

    fn index_of(&self, value: u64) -> usize {
        let scaled = value.clamp(self.lowest, self.highest) >> self.unit_shift;
        if scaled < SUB_BUCKET_COUNT {
            return to_index(scaled);
        }

        let magnitude = 63 - scaled.leading_zeros();
        let shift = magnitude + 1 - SUB_BUCKET_BITS;
        let sub_bucket = scaled >> shift;

        to_index(SUB_BUCKET_COUNT + u64::from(magnitude - SUB_BUCKET_BITS) * SUB_BUCKET_HALF + (sub_bucket - SUB_BUCKET_HALF))
    }

    fn highest_equivalent(&self, index: usize) -> u64 {
        let index = index as u64;
        let (lowest_scaled, width_scaled) = if index < SUB_BUCKET_COUNT {
            (index, 1)
        } else {
            let offset = index - SUB_BUCKET_COUNT;
            let shift = offset / SUB_BUCKET_HALF + 1;
            let sub_bucket = SUB_BUCKET_HALF + offset % SUB_BUCKET_HALF;
            (sub_bucket << shift, 1 << shift)
        };

        ((lowest_scaled + width_scaled) << self.unit_shift) - 1
    }
}

#[expect(clippy::cast_possible_truncation, reason = "bucket indexes stay far below usize::MAX")]
fn to_index(value: u64) -> usize {
    value as usize
}
