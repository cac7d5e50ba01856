// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Well-known telemetry keys for backup request events.
//!
//! The keys are attached to the `backup_requests.event` counter (with the `metrics` feature) and
//! to the structured `tracing` events emitted by the tracking strategy and the registry.
//!
//! Names follow the [OpenTelemetry naming guidelines](https://opentelemetry.io/docs/specs/semconv/general/naming/#general-naming-considerations).

use std::borrow::Cow;

#[cfg(any(feature = "metrics", test))]
pub(crate) mod metrics;

/// Key used to annotate the service a backup request targets.
pub const SERVICE_NAME: &str = "backup_requests.service";

/// Key used to annotate the operation a backup request targets.
pub const OPERATION_NAME: &str = "backup_requests.operation";

/// Key used to annotate the specific backup request event being emitted.
///
/// Values: `backup_allowed`, `backup_denied`, `backup_succeeded`.
pub const EVENT_NAME: &str = "backup_requests.event.name";

pub(crate) const BACKUP_ALLOWED_EVENT_NAME: &str = "backup_allowed";
pub(crate) const BACKUP_DENIED_EVENT_NAME: &str = "backup_denied";
pub(crate) const BACKUP_SUCCEEDED_EVENT_NAME: &str = "backup_succeeded";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BackupEvent {
    Allowed,
    Denied,
    Succeeded,
}

impl BackupEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allowed => BACKUP_ALLOWED_EVENT_NAME,
            Self::Denied => BACKUP_DENIED_EVENT_NAME,
            Self::Succeeded => BACKUP_SUCCEEDED_EVENT_NAME,
        }
    }
}

/// Reports the events of one tracked strategy.
#[derive(Debug, Clone)]
pub(crate) struct StrategyTelemetry {
    pub(crate) service: Cow<'static, str>,
    pub(crate) operation: Cow<'static, str>,
    #[cfg(any(feature = "metrics", test))]
    pub(crate) event_reporter: Option<opentelemetry::metrics::Counter<u64>>,
}

impl StrategyTelemetry {
    pub fn new(service: impl Into<Cow<'static, str>>, operation: impl Into<Cow<'static, str>>) -> Self {
        Self {
            service: service.into(),
            operation: operation.into(),
            #[cfg(any(feature = "metrics", test))]
            event_reporter: None,
        }
    }

    #[cfg(any(feature = "metrics", test))]
    pub fn with_meter(self, meter: Option<&opentelemetry::metrics::Meter>) -> Self {
        Self {
            event_reporter: meter.map(metrics::create_backup_event_counter),
            ..self
        }
    }

    pub fn report(&self, event: BackupEvent) {
        #[cfg(any(feature = "metrics", test))]
        if let Some(reporter) = &self.event_reporter {
            reporter.add(
                1,
                &[
                    opentelemetry::KeyValue::new(SERVICE_NAME, self.service.clone()),
                    opentelemetry::KeyValue::new(OPERATION_NAME, self.operation.clone()),
                    opentelemetry::KeyValue::new(EVENT_NAME, event.as_str()),
                ],
            );
        }

        match event {
            BackupEvent::Allowed => tracing::event!(
                name: "understudy.backup.allowed",
                tracing::Level::DEBUG,
                backup_requests.service = %self.service,
                backup_requests.operation = %self.operation,
            ),
            BackupEvent::Denied => tracing::event!(
                name: "understudy.backup.denied",
                tracing::Level::DEBUG,
                backup_requests.service = %self.service,
                backup_requests.operation = %self.operation,
            ),
            BackupEvent::Succeeded => tracing::event!(
                name: "understudy.backup.succeeded",
                tracing::Level::DEBUG,
                backup_requests.service = %self.service,
                backup_requests.operation = %self.operation,
            ),
        }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use opentelemetry_sdk::metrics::{InMemoryMetricExporter, SdkMeterProvider};

    use super::*;

    #[test]
    fn keys_are_expected() {
        assert_eq!(SERVICE_NAME, "backup_requests.service");
        assert_eq!(OPERATION_NAME, "backup_requests.operation");
        assert_eq!(EVENT_NAME, "backup_requests.event.name");
    }

    #[test]
    fn event_names() {
        assert_eq!(BackupEvent::Allowed.as_str(), "backup_allowed");
        assert_eq!(BackupEvent::Denied.as_str(), "backup_denied");
        assert_eq!(BackupEvent::Succeeded.as_str(), "backup_succeeded");
    }

    #[test]
    fn report_without_meter_does_not_panic() {
        let telemetry = StrategyTelemetry::new("users", "get");
        telemetry.report(BackupEvent::Allowed);
        assert!(telemetry.event_reporter.is_none());
    }

    #[test]
    #[cfg(not(miri))]
    fn report_adds_attributes() {
        let exporter = InMemoryMetricExporter::default();
        let provider = SdkMeterProvider::builder().with_periodic_exporter(exporter.clone()).build();
        let meter = metrics::create_meter(&provider);

        let telemetry = StrategyTelemetry::new("users", "get").with_meter(Some(&meter));
        telemetry.report(BackupEvent::Succeeded);
        provider.force_flush().unwrap();

        let str = format!("{:?}", exporter.get_finished_metrics().unwrap());
        assert!(str.contains("backup_requests.event"));
        assert!(str.contains("users"));
        assert!(str.contains("backup_succeeded"));
    }
}
