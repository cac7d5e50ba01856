// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Building strategies from configuration maps.
//!
//! A configuration is a JSON object naming the operation and exactly one strategy
//! implementation with its properties:
//!
//! ```json
//! {
//!     "operation": "get",
//!     "strategy": {
//!         "BoundedCostBackupRequests": { "cost": 5, "historyLength": 1024, "minBackupDelayMs": 2 }
//!     }
//! }
//! ```
//!
//! Only `cost` is required. Missing properties take the defaults of [`BoundedCostOptions`].

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::constants::{DEFAULT_HISTORY_LENGTH, DEFAULT_MAX_BURST, DEFAULT_REQUIRED_HISTORY_LENGTH};
use crate::strategy::{BoundedCostOptions, BoundedCostStrategy};
use crate::telemetry::StrategyTelemetry;
use crate::tracking::TrackingStrategy;

/// Key of the operation a configuration applies to.
pub const OPERATION: &str = "operation";
/// Key of the object holding the strategy implementation and its properties.
pub const STRATEGY: &str = "strategy";
/// Target percentage of requests that may be backed up. Required.
pub const COST: &str = "cost";
/// Number of recent completions the delay is computed over.
pub const HISTORY_LENGTH: &str = "historyLength";
/// Number of completions required before any delay is produced.
pub const REQUIRED_HISTORY_LENGTH: &str = "requiredHistoryLength";
/// Maximum number of back to back backup requests.
pub const MAX_BURST: &str = "maxBurst";
/// Lower bound of the delay, in milliseconds.
pub const MIN_BACKUP_DELAY_MS: &str = "minBackupDelayMs";

/// Name of the [`BoundedCostStrategy`] implementation.
pub const BOUNDED_COST_BACKUP_REQUESTS: &str = "BoundedCostBackupRequests";

/// Raw backup requests configuration of one operation.
pub type BackupRequestsConfig = serde_json::Map<String, Value>;

/// Strategy produced from a configuration.
pub type TrackedStrategy = TrackingStrategy<BoundedCostStrategy>;

/// A configuration could not be turned into a strategy.
#[ohno::error]
#[display("invalid backup requests configuration: {reason}")]
pub struct ConfigError {
    reason: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BoundedCostProperties {
    cost: f64,
    #[serde(default = "default_history_length")]
    history_length: usize,
    #[serde(default = "default_required_history_length")]
    required_history_length: usize,
    #[serde(default = "default_max_burst")]
    max_burst: u32,
    #[serde(default)]
    min_backup_delay_ms: u64,
}

fn default_history_length() -> usize {
    DEFAULT_HISTORY_LENGTH
}

fn default_required_history_length() -> usize {
    DEFAULT_REQUIRED_HISTORY_LENGTH
}

fn default_max_burst() -> u32 {
    DEFAULT_MAX_BURST
}

impl From<BoundedCostProperties> for BoundedCostOptions {
    fn from(properties: BoundedCostProperties) -> Self {
        Self::new(properties.cost)
            .history_length(properties.history_length)
            .required_history_length(properties.required_history_length)
            .max_burst(properties.max_burst)
            .min_backup_delay(Duration::from_millis(properties.min_backup_delay_ms))
    }
}

/// Resolves the strategy options described by `config`.
///
/// # Errors
///
/// Returns [`ConfigError`] if the strategy is missing, names an unknown implementation, has
/// malformed properties, or the properties are out of range.
pub fn resolve_options(config: &BackupRequestsConfig) -> Result<BoundedCostOptions, ConfigError> {
    let Some(strategy) = config.get(STRATEGY) else {
        return Err(ConfigError::new(format!("missing '{STRATEGY}'")));
    };
    let Some(strategy) = strategy.as_object() else {
        return Err(ConfigError::new(format!("'{STRATEGY}' must be an object")));
    };

    let mut implementations = strategy.iter();
    let (Some((name, properties)), None) = (implementations.next(), implementations.next()) else {
        return Err(ConfigError::new(format!("'{STRATEGY}' must name exactly one implementation")));
    };

    if name != BOUNDED_COST_BACKUP_REQUESTS {
        return Err(ConfigError::new(format!("unknown strategy '{name}'")));
    }

    let properties = BoundedCostProperties::deserialize(properties)
        .map_err(|e| ConfigError::caused_by(format!("malformed '{name}' properties"), e))?;
    let options = BoundedCostOptions::from(properties);
    options
        .validate()
        .map_err(|e| ConfigError::caused_by(format!("invalid '{name}' properties"), e))?;

    Ok(options)
}

/// A strategy bound to the configuration that produced it.
///
/// Rebuilding a strategy throws away its warmed up history, so [`update`][Self::update] keeps
/// the current binding whenever the configuration did not change. A configuration that cannot
/// be resolved is logged and yields a binding without a strategy, which callers treat as
/// "backup requests disabled".
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
/// use understudy::{BackupRequestsConfig, StrategyBinding};
///
/// let config: BackupRequestsConfig = serde_json::from_str(
///     r#"{ "operation": "get", "strategy": { "BoundedCostBackupRequests": { "cost": 5 } } }"#,
/// )?;
///
/// let binding = Arc::new(StrategyBinding::new(Some(config.clone())));
/// assert!(binding.strategy().is_some());
///
/// let same = binding.update(Some(config));
/// assert!(Arc::ptr_eq(&binding, &same));
///
/// let disabled = binding.update(None);
/// assert!(disabled.strategy().is_none());
/// # Ok::<(), serde_json::Error>(())
/// ```
#[derive(Debug)]
pub struct StrategyBinding {
    config: Option<BackupRequestsConfig>,
    strategy: Option<Arc<TrackedStrategy>>,
    telemetry: Option<StrategyTelemetry>,
}

impl StrategyBinding {
    /// Binds a strategy built from `config`, if any.
    #[must_use]
    pub fn new(config: Option<BackupRequestsConfig>) -> Self {
        Self::bind(config, None)
    }

    pub(crate) fn new_with_telemetry(config: Option<BackupRequestsConfig>, telemetry: StrategyTelemetry) -> Self {
        Self::bind(config, Some(telemetry))
    }

    /// Returns this binding if `config` equals the bound configuration, or a new binding otherwise.
    #[must_use]
    pub fn update(self: &Arc<Self>, config: Option<BackupRequestsConfig>) -> Arc<Self> {
        if self.config == config {
            return Arc::clone(self);
        }

        Arc::new(Self::bind(config, self.telemetry.clone()))
    }

    /// The bound strategy, or `None` if backup requests are disabled.
    #[must_use]
    pub fn strategy(&self) -> Option<&Arc<TrackedStrategy>> {
        self.strategy.as_ref()
    }

    /// The configuration this binding was built from.
    #[must_use]
    pub fn config(&self) -> Option<&BackupRequestsConfig> {
        self.config.as_ref()
    }

    fn bind(config: Option<BackupRequestsConfig>, telemetry: Option<StrategyTelemetry>) -> Self {
        let strategy = config
            .as_ref()
            .and_then(|config| build_strategy(config, telemetry.as_ref()))
            .map(Arc::new);

        Self {
            config,
            strategy,
            telemetry,
        }
    }
}

fn build_strategy(config: &BackupRequestsConfig, telemetry: Option<&StrategyTelemetry>) -> Option<TrackedStrategy> {
    match resolve_options(config).map(BoundedCostStrategy::from_validated) {
        Ok(strategy) => {
            let strategy = TrackingStrategy::new(strategy);
            Some(match telemetry {
                Some(telemetry) => strategy.with_telemetry(telemetry.clone()),
                None => strategy,
            })
        }
        Err(error) => {
            tracing::event!(
                name: "understudy.config.rejected",
                tracing::Level::WARN,
                backup_requests.service = telemetry.map(|t| t.service.as_ref()),
                backup_requests.operation = telemetry.map(|t| t.operation.as_ref()),
                error = %error,
                "backup requests disabled",
            );
            None
        }
    }
}
