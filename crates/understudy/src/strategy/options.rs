// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::Duration;

use crate::constants::{
    DEFAULT_HISTORY_LENGTH, DEFAULT_HISTORY_LENGTH_LIMIT, DEFAULT_MAX_BURST, DEFAULT_MIN_BACKUP_DELAY,
    DEFAULT_REQUIRED_HISTORY_LENGTH, MIN_HISTORY_LENGTH,
};

/// A strategy option is outside of its accepted range.
#[ohno::error]
#[display("invalid backup requests option '{parameter}': {reason}")]
pub struct InvalidOptionsError {
    parameter: String,
    reason: String,
}

impl InvalidOptionsError {
    /// Name of the offending option.
    #[must_use]
    pub fn parameter(&self) -> &str {
        &self.parameter
    }

    /// Human readable description of the accepted range.
    #[must_use]
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// Parameters of a [`BoundedCostStrategy`][crate::BoundedCostStrategy].
///
/// Only `percent` has no default. Everything else starts from the values documented on the
/// individual setters. The options are checked when the strategy is built; see
/// [`validate`][BoundedCostOptions::validate] for the accepted ranges.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use understudy::BoundedCostOptions;
///
/// let options = BoundedCostOptions::new(5.0)
///     .history_length(1000)
///     .required_history_length(500)
///     .max_burst(1)
///     .min_backup_delay(Duration::from_millis(2));
///
/// assert!(options.validate().is_ok());
/// assert!(BoundedCostOptions::new(100.0).validate().is_err());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct BoundedCostOptions {
    pub(crate) percent: f64,
    pub(crate) max_burst: u32,
    pub(crate) history_length: usize,
    pub(crate) required_history_length: usize,
    pub(crate) min_backup_delay: Duration,
    pub(crate) history_length_limit: usize,
}

impl BoundedCostOptions {
    /// Creates options targeting `percent`% of requests, with defaults for everything else.
    #[must_use]
    pub fn new(percent: f64) -> Self {
        Self {
            percent,
            max_burst: DEFAULT_MAX_BURST,
            history_length: DEFAULT_HISTORY_LENGTH,
            required_history_length: DEFAULT_REQUIRED_HISTORY_LENGTH,
            min_backup_delay: DEFAULT_MIN_BACKUP_DELAY,
            history_length_limit: DEFAULT_HISTORY_LENGTH_LIMIT,
        }
    }

    /// Maximum number of backup requests allowed back to back. Defaults to 64.
    #[must_use]
    pub fn max_burst(mut self, max_burst: u32) -> Self {
        self.max_burst = max_burst;
        self
    }

    /// Number of recent completions the percentile is computed over. Defaults to 1024.
    #[must_use]
    pub fn history_length(mut self, history_length: usize) -> Self {
        self.history_length = history_length;
        self
    }

    /// Number of completions required before any delay is produced. Defaults to 128.
    #[must_use]
    pub fn required_history_length(mut self, required_history_length: usize) -> Self {
        self.required_history_length = required_history_length;
        self
    }

    /// Lower bound of the produced delay. Defaults to zero.
    #[must_use]
    pub fn min_backup_delay(mut self, min_backup_delay: Duration) -> Self {
        self.min_backup_delay = min_backup_delay;
        self
    }

    /// Exclusive upper bound for the history length. Defaults to 1 000 000.
    ///
    /// Every history slot costs memory, so very large windows are usually a configuration mistake.
    #[must_use]
    pub fn history_length_limit(mut self, history_length_limit: usize) -> Self {
        self.history_length_limit = history_length_limit;
        self
    }

    /// Target percentage of requests that may be backed up.
    #[must_use]
    pub fn get_percent(&self) -> f64 {
        self.percent
    }

    /// Configured history length.
    #[must_use]
    pub fn get_history_length(&self) -> usize {
        self.history_length
    }

    /// Configured required history length.
    #[must_use]
    pub fn get_required_history_length(&self) -> usize {
        self.required_history_length
    }

    /// Configured maximum burst.
    #[must_use]
    pub fn get_max_burst(&self) -> u32 {
        self.max_burst
    }

    /// Configured minimum backup delay.
    #[must_use]
    pub fn get_min_backup_delay(&self) -> Duration {
        self.min_backup_delay
    }

    /// Checks every option against its accepted range.
    ///
    /// - `percent` in `(0, 100)`
    /// - `max_burst` greater than zero
    /// - `history_length` in `[100, history_length_limit)`
    /// - `required_history_length` in `[100, history_length]`
    ///
    /// # Errors
    ///
    /// Returns [`InvalidOptionsError`] naming the first option that is out of range.
    pub fn validate(&self) -> Result<(), InvalidOptionsError> {
        if !(self.percent > 0.0 && self.percent < 100.0) {
            return Err(invalid("percent", format!("must be in (0, 100), was {}", self.percent)));
        }

        if self.max_burst == 0 {
            return Err(invalid("max_burst", "must be greater than 0".to_string()));
        }

        if self.history_length < MIN_HISTORY_LENGTH || self.history_length >= self.history_length_limit {
            return Err(invalid(
                "history_length",
                format!(
                    "must be in [{MIN_HISTORY_LENGTH}, {}), was {}",
                    self.history_length_limit, self.history_length
                ),
            ));
        }

        if self.required_history_length < MIN_HISTORY_LENGTH || self.required_history_length > self.history_length {
            return Err(invalid(
                "required_history_length",
                format!(
                    "must be in [{MIN_HISTORY_LENGTH}, {}], was {}",
                    self.history_length, self.required_history_length
                ),
            ));
        }

        Ok(())
    }
}

fn invalid(parameter: &str, reason: String) -> InvalidOptionsError {
    InvalidOptionsError::new(parameter.to_string(), reason)
}
