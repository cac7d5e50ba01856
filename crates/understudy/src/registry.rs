// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::{Stream, StreamExt};
use serde_json::Value;
use tick::{Clock, PeriodicTimer};

use crate::attempt::BackupRequestAttempt;
use crate::config::{BackupRequestsConfig, OPERATION, StrategyBinding, TrackedStrategy};
use crate::constants::ERR_POISONED_LOCK;
use crate::latency_buffer::LatencyHistogram;
use crate::telemetry::StrategyTelemetry;
use crate::tracking::StatsProvider;

/// Receives backup request statistics of every configured service operation.
///
/// Implementations are called synchronously from configuration updates, latency
/// notifications and request completions, so they should return quickly and must not call
/// back into the registry.
pub trait StatsConsumer: Debug + Send + Sync {
    /// A strategy was bound to `operation` of `service`.
    fn add_stats_provider(&self, service: &str, operation: &str, provider: Arc<dyn StatsProvider>);

    /// A strategy previously announced through [`add_stats_provider`][Self::add_stats_provider]
    /// is no longer used.
    fn remove_stats_provider(&self, service: &str, operation: &str, provider: Arc<dyn StatsProvider>);

    /// Latencies recorded since the previous update, with or without help of backup requests.
    ///
    /// The histogram is reset and reused once this returns, so it must not be kept.
    fn latency_update(&self, service: &str, operation: &str, histogram: &LatencyHistogram, with_backup: bool);
}

/// Hands latencies to `consumer`. A panicking consumer is logged and otherwise ignored, so it
/// cannot take request threads or the notification loop down with it.
pub(crate) fn deliver_latencies(
    consumer: &dyn StatsConsumer,
    service: &str,
    operation: &str,
    histogram: &LatencyHistogram,
    with_backup: bool,
) {
    let delivered = panic::catch_unwind(AssertUnwindSafe(|| {
        consumer.latency_update(service, operation, histogram, with_backup);
    }));

    if delivered.is_err() {
        tracing::event!(
            name: "understudy.consumer.panicked",
            tracing::Level::ERROR,
            backup_requests.service = service,
            backup_requests.operation = operation,
            backup_requests.with_backup = with_backup,
            "stats consumer panicked, latencies dropped",
        );
    }
}

/// Strategies of every service operation with backup requests configured.
///
/// Service configurations are applied with [`update_service`][Self::update_service]; each entry
/// is bound through a [`StrategyBinding`], so unchanged configurations keep their warmed up
/// strategy. The optional [`StatsConsumer`] is told whenever a strategy starts or stops being
/// used and receives the latency histograms on every
/// [`notify_latencies`][Self::notify_latencies].
///
/// A strategy that stops being used may still have requests in flight. It is kept for one more
/// latency notification so those requests are reported too.
///
/// # Examples
///
/// ```rust
/// use understudy::{BackupRequestsConfig, BackupRequestsRegistry};
///
/// let config: BackupRequestsConfig = serde_json::from_str(
///     r#"{ "operation": "get", "strategy": { "BoundedCostBackupRequests": { "cost": 5 } } }"#,
/// )?;
///
/// let registry = BackupRequestsRegistry::new();
/// registry.update_service("users", &[config]);
///
/// assert!(registry.strategy("users", "get").is_some());
/// assert!(registry.strategy("users", "put").is_none());
/// # Ok::<(), serde_json::Error>(())
/// ```
#[derive(Debug, Default)]
pub struct BackupRequestsRegistry {
    strategies: DashMap<String, HashMap<String, Arc<StrategyBinding>>>,
    final_sweep: Mutex<Vec<OperationStrategy>>,
    consumer: Option<Arc<dyn StatsConsumer>>,
    #[cfg(any(feature = "metrics", test))]
    meter: Option<opentelemetry::metrics::Meter>,
}

#[derive(Debug)]
struct OperationStrategy {
    service: String,
    operation: String,
    strategy: Arc<TrackedStrategy>,
}

/// Change of the strategy bound to one operation.
#[derive(Debug)]
struct Rebind {
    operation: String,
    old: Option<Arc<TrackedStrategy>>,
    new: Option<Arc<TrackedStrategy>>,
}

impl BackupRequestsRegistry {
    /// Creates an empty registry without a stats consumer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports statistics and latencies to `consumer`.
    #[must_use]
    pub fn stats_consumer(self, consumer: Arc<dyn StatsConsumer>) -> Self {
        Self {
            consumer: Some(consumer),
            ..self
        }
    }

    /// Reports backup request events to the given OpenTelemetry meter provider.
    ///
    /// Only strategies bound after this call report metrics.
    #[must_use]
    #[cfg(any(feature = "metrics", test))]
    pub fn enable_metrics(self, provider: &dyn opentelemetry::metrics::MeterProvider) -> Self {
        Self {
            meter: Some(crate::telemetry::metrics::create_meter(provider)),
            ..self
        }
    }

    /// Applies the backup requests configurations of `service`.
    ///
    /// Each configuration is keyed by its `operation`. Operations missing from `configs` are
    /// removed; an empty slice removes the whole service. Configurations without an operation
    /// are logged and skipped.
    pub fn update_service(&self, service: &str, configs: &[BackupRequestsConfig]) {
        let rebinds = {
            let mut operations = self.strategies.entry(service.to_string()).or_default();
            let mut rebinds = Vec::new();
            let mut configured = HashSet::new();

            for config in configs {
                let Some(operation) = config.get(OPERATION).and_then(Value::as_str) else {
                    tracing::event!(
                        name: "understudy.config.missing_operation",
                        tracing::Level::WARN,
                        backup_requests.service = service,
                        "backup requests configuration ignored",
                    );
                    continue;
                };

                let updated = match operations.get(operation) {
                    Some(existing) => existing.update(Some(config.clone())),
                    None => Arc::new(StrategyBinding::new_with_telemetry(
                        Some(config.clone()),
                        self.telemetry(service, operation),
                    )),
                };

                let previous = operations.insert(operation.to_string(), Arc::clone(&updated));
                if !previous.as_ref().is_some_and(|previous| Arc::ptr_eq(previous, &updated)) {
                    rebinds.push(Rebind {
                        operation: operation.to_string(),
                        old: previous.and_then(|binding| binding.strategy().cloned()),
                        new: updated.strategy().cloned(),
                    });
                }
                configured.insert(operation.to_string());
            }

            operations.retain(|operation, binding| {
                let keep = configured.contains(operation);
                if !keep {
                    rebinds.push(Rebind {
                        operation: operation.clone(),
                        old: binding.strategy().cloned(),
                        new: None,
                    });
                }
                keep
            });

            rebinds
        };

        self.strategies.remove_if(service, |_, operations| operations.is_empty());

        for rebind in rebinds {
            self.apply(service, rebind);
        }
    }

    /// Removes every operation of `service`.
    pub fn remove_service(&self, service: &str) {
        self.update_service(service, &[]);
    }

    /// The strategy bound to `operation` of `service`, if backup requests are enabled for it.
    #[must_use]
    pub fn strategy(&self, service: &str, operation: &str) -> Option<Arc<TrackedStrategy>> {
        self.strategies
            .get(service)?
            .get(operation)?
            .strategy()
            .cloned()
    }

    /// Starts bookkeeping for a request to `operation` of `service`.
    ///
    /// Returns `None` if backup requests are not enabled for the operation.
    #[must_use]
    pub fn attempt(&self, service: &str, operation: &str, clock: &Clock) -> Option<BackupRequestAttempt> {
        let strategy = self.strategy(service, operation)?;
        let attempt = BackupRequestAttempt::begin(strategy, clock);

        Some(match &self.consumer {
            Some(consumer) => attempt.with_consumer(service, operation, Arc::clone(consumer)),
            None => attempt,
        })
    }

    /// Harvests the latency histograms of every strategy and hands them to the stats consumer.
    ///
    /// Strategies retired since the previous call are harvested one last time.
    pub fn notify_latencies(&self) {
        let live: Vec<OperationStrategy> = self
            .strategies
            .iter()
            .flat_map(|entry| {
                entry
                    .value()
                    .iter()
                    .filter_map(|(operation, binding)| {
                        binding.strategy().map(|strategy| OperationStrategy {
                            service: entry.key().clone(),
                            operation: operation.clone(),
                            strategy: Arc::clone(strategy),
                        })
                    })
                    .collect::<Vec<_>>()
            })
            .collect();

        let retired = std::mem::take(&mut *self.final_sweep.lock().expect(ERR_POISONED_LOCK));

        // A strategy can be retired and bound again, report it once.
        let retired: Vec<OperationStrategy> = retired
            .into_iter()
            .filter(|r| !live.iter().any(|l| Arc::ptr_eq(&l.strategy, &r.strategy)))
            .collect();

        for entry in live.iter().chain(&retired) {
            self.notify_latency(&entry.service, &entry.operation, &entry.strategy);
        }
    }

    /// Calls [`notify_latencies`][Self::notify_latencies] on every tick of a `period` timer.
    ///
    /// The stream never ends; drive it from a background task for as long as latencies should
    /// be reported.
    pub fn latency_notifications(self: &Arc<Self>, clock: &Clock, period: Duration) -> impl Stream<Item = ()> + Send + use<> {
        let registry = Arc::clone(self);
        PeriodicTimer::new(clock, period).map(move |()| registry.notify_latencies())
    }

    fn notify_latency(&self, service: &str, operation: &str, strategy: &TrackedStrategy) {
        strategy
            .latency_without_backup()
            .harvest(|histogram| self.deliver(service, operation, histogram, false));
        strategy
            .latency_with_backup()
            .harvest(|histogram| self.deliver(service, operation, histogram, true));
    }

    fn deliver(&self, service: &str, operation: &str, histogram: &LatencyHistogram, with_backup: bool) {
        if let Some(consumer) = &self.consumer {
            deliver_latencies(consumer.as_ref(), service, operation, histogram, with_backup);
        }
    }

    fn apply(&self, service: &str, rebind: Rebind) {
        if let Some(old) = rebind.old {
            tracing::event!(
                name: "understudy.strategy.removed",
                tracing::Level::DEBUG,
                backup_requests.service = service,
                backup_requests.operation = rebind.operation.as_str(),
            );

            if let Some(consumer) = &self.consumer {
                consumer.remove_stats_provider(service, &rebind.operation, Arc::clone(&old) as Arc<dyn StatsProvider>);
            }

            self.final_sweep.lock().expect(ERR_POISONED_LOCK).push(OperationStrategy {
                service: service.to_string(),
                operation: rebind.operation.clone(),
                strategy: old,
            });
        }

        if let Some(new) = rebind.new {
            tracing::event!(
                name: "understudy.strategy.added",
                tracing::Level::DEBUG,
                backup_requests.service = service,
                backup_requests.operation = rebind.operation.as_str(),
            );

            if let Some(consumer) = &self.consumer {
                consumer.add_stats_provider(service, &rebind.operation, new as Arc<dyn StatsProvider>);
            }
        }
    }

    #[cfg(any(feature = "metrics", test))]
    fn telemetry(&self, service: &str, operation: &str) -> StrategyTelemetry {
        StrategyTelemetry::new(service.to_string(), operation.to_string()).with_meter(self.meter.as_ref())
    }

    #[cfg(not(any(feature = "metrics", test)))]
    #[expect(clippy::unused_self, reason = "the meter is only available with metrics")]
    fn telemetry(&self, service: &str, operation: &str) -> StrategyTelemetry {
        StrategyTelemetry::new(service.to_string(), operation.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::pin::Pin;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::task::{Context, Poll, Waker};

    use tick::ClockControl;

    use super::*;
    use crate::BackupRequestsStrategy;
    use crate::testing::{LatencyUpdate, LogCapture, ProviderEvent, RecordingConsumer, bounded_cost_config};

    static_assertions::assert_impl_all!(BackupRequestsRegistry: Send, Sync, Debug);

    fn registry() -> (BackupRequestsRegistry, Arc<RecordingConsumer>) {
        let consumer = Arc::new(RecordingConsumer::default());
        let registry = BackupRequestsRegistry::new().stats_consumer(Arc::clone(&consumer) as Arc<dyn StatsConsumer>);
        (registry, consumer)
    }

    fn added(operation: &str) -> ProviderEvent {
        ProviderEvent::Added {
            service: "users".to_string(),
            operation: operation.to_string(),
        }
    }

    fn removed(operation: &str) -> ProviderEvent {
        ProviderEvent::Removed {
            service: "users".to_string(),
            operation: operation.to_string(),
        }
    }

    #[test]
    fn update_binds_operations() {
        let (registry, consumer) = registry();
        registry.update_service("users", &[bounded_cost_config("get", 5), bounded_cost_config("put", 10)]);

        assert!(registry.strategy("users", "get").is_some());
        assert!(registry.strategy("users", "put").is_some());
        assert!(registry.strategy("orders", "get").is_none());

        let mut events = consumer.provider_events();
        events.sort_by_key(|e| format!("{e:?}"));
        assert_eq!(events, vec![added("get"), added("put")]);
    }

    #[test]
    fn unchanged_config_keeps_strategy() {
        let (registry, consumer) = registry();
        registry.update_service("users", &[bounded_cost_config("get", 5)]);
        let before = registry.strategy("users", "get").unwrap();

        registry.update_service("users", &[bounded_cost_config("get", 5)]);
        let after = registry.strategy("users", "get").unwrap();

        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(consumer.provider_events(), vec![added("get")]);
    }

    #[test]
    fn changed_config_replaces_strategy() {
        let (registry, consumer) = registry();
        registry.update_service("users", &[bounded_cost_config("get", 5)]);
        let before = registry.strategy("users", "get").unwrap();

        registry.update_service("users", &[bounded_cost_config("get", 10)]);
        let after = registry.strategy("users", "get").unwrap();

        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(consumer.provider_events(), vec![added("get"), removed("get"), added("get")]);
    }

    #[test]
    fn missing_operations_are_removed() {
        let (registry, consumer) = registry();
        registry.update_service("users", &[bounded_cost_config("get", 5), bounded_cost_config("put", 5)]);
        registry.update_service("users", &[bounded_cost_config("get", 5)]);

        assert!(registry.strategy("users", "put").is_none());
        assert!(consumer.provider_events().contains(&removed("put")));

        registry.remove_service("users");
        assert!(registry.strategy("users", "get").is_none());
        assert!(registry.strategies.is_empty());
    }

    #[test]
    fn config_without_operation_is_skipped() {
        let (registry, consumer) = registry();
        let mut config = bounded_cost_config("get", 5);
        config.remove(OPERATION);

        registry.update_service("users", &[config]);
        assert!(consumer.provider_events().is_empty());
    }

    #[test]
    fn invalid_config_disables_operation() {
        let (registry, consumer) = registry();
        registry.update_service("users", &[bounded_cost_config("get", 100)]);

        assert!(registry.strategy("users", "get").is_none());
        assert!(registry.attempt("users", "get", &Clock::new_frozen()).is_none());
        assert!(consumer.provider_events().is_empty());
    }

    #[test]
    fn notify_latencies_harvests_without_then_with() {
        let (registry, consumer) = registry();
        registry.update_service("users", &[bounded_cost_config("get", 5)]);

        let attempt = registry.attempt("users", "get", &Clock::new_frozen()).unwrap();
        assert!(attempt.complete_original());

        registry.notify_latencies();
        let updates = consumer.latency_updates();
        assert_eq!(
            updates,
            vec![
                LatencyUpdate {
                    service: "users".to_string(),
                    operation: "get".to_string(),
                    with_backup: false,
                    count: 1,
                },
                LatencyUpdate {
                    service: "users".to_string(),
                    operation: "get".to_string(),
                    with_backup: true,
                    count: 1,
                },
            ]
        );
    }

    #[test]
    fn retired_strategy_gets_final_sweep() {
        let (registry, consumer) = registry();
        registry.update_service("users", &[bounded_cost_config("get", 5)]);

        let attempt = registry.attempt("users", "get", &Clock::new_frozen()).unwrap();
        registry.remove_service("users");

        // The request completes after its strategy was retired.
        attempt.complete_original();

        registry.notify_latencies();
        let counts: Vec<_> = consumer.latency_updates().iter().map(|u| u.count).collect();
        assert_eq!(counts, vec![1, 1]);

        registry.notify_latencies();
        assert_eq!(consumer.latency_updates().len(), 2, "retired strategies are swept once");
    }

    #[test]
    fn periodic_notifications() {
        let control = ClockControl::new();
        let clock = control.to_clock();
        let (registry, consumer) = registry();
        let registry = Arc::new(registry);
        registry.update_service("users", &[bounded_cost_config("get", 5)]);

        let mut notifications = Box::pin(registry.latency_notifications(&clock, Duration::from_secs(60)));
        let mut cx = Context::from_waker(Waker::noop());

        assert_eq!(Pin::as_mut(&mut notifications).poll_next(&mut cx), Poll::Pending);
        assert!(consumer.latency_updates().is_empty());

        control.advance(Duration::from_secs(61));
        assert_eq!(Pin::as_mut(&mut notifications).poll_next(&mut cx), Poll::Ready(Some(())));
        assert_eq!(consumer.latency_updates().len(), 2);
    }

    #[derive(Debug, Default)]
    struct PanickingConsumer {
        calls: AtomicU64,
    }

    impl StatsConsumer for PanickingConsumer {
        fn add_stats_provider(&self, _service: &str, _operation: &str, _provider: Arc<dyn StatsProvider>) {}

        fn remove_stats_provider(&self, _service: &str, _operation: &str, _provider: Arc<dyn StatsProvider>) {}

        fn latency_update(&self, _service: &str, _operation: &str, _histogram: &LatencyHistogram, _with_backup: bool) {
            self.calls.fetch_add(1, Ordering::Relaxed);
            panic!("consumer failed");
        }
    }

    #[test]
    fn panicking_consumer_is_contained() {
        let logs = LogCapture::default();
        let _guard = tracing::subscriber::set_default(logs.subscriber());

        let consumer = Arc::new(PanickingConsumer::default());
        let registry = BackupRequestsRegistry::new().stats_consumer(Arc::clone(&consumer) as Arc<dyn StatsConsumer>);
        registry.update_service("users", &[bounded_cost_config("get", 5)]);

        let attempt = registry.attempt("users", "get", &Clock::new_frozen()).unwrap();
        attempt.complete_original();

        registry.notify_latencies();
        registry.notify_latencies();
        assert_eq!(consumer.calls.load(Ordering::Relaxed), 4);

        let output = logs.output();
        assert!(output.contains("ERROR"), "{output}");
        assert!(output.contains("stats consumer panicked"), "{output}");
    }

    #[test]
    fn strategy_is_usable_through_registry() {
        let registry = BackupRequestsRegistry::new();
        registry.update_service("users", &[bounded_cost_config("get", 5)]);

        let strategy = registry.strategy("users", "get").unwrap();
        assert_eq!(strategy.time_until_backup_request(), None);
    }

    #[test]
    #[cfg(not(miri))]
    fn metrics_are_reported_for_bound_strategies() {
        use opentelemetry_sdk::metrics::{InMemoryMetricExporter, SdkMeterProvider};

        let exporter = InMemoryMetricExporter::default();
        let provider = SdkMeterProvider::builder().with_periodic_exporter(exporter.clone()).build();

        let registry = BackupRequestsRegistry::new().enable_metrics(&provider);
        registry.update_service("users", &[bounded_cost_config("get", 5)]);
        registry.strategy("users", "get").unwrap().backup_request_success();

        provider.force_flush().unwrap();
        let str = format!("{:?}", exporter.get_finished_metrics().unwrap());
        assert!(str.contains("backup_succeeded"));
        assert!(str.contains("users"));
    }
}
