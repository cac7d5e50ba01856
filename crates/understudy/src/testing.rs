// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tracing_subscriber::fmt::MakeWriter;

use crate::config::{BackupRequestsConfig, TrackedStrategy};
use crate::{
    BackupRequestsStrategy, BoundedCostOptions, BoundedCostStrategy, LatencyHistogram, StatsConsumer, StatsProvider,
    TrackingStrategy,
};

/// A strategy that already produces `latency` as its delay and has quota for a few backups.
pub(crate) fn warmed_strategy(latency: Duration) -> TrackedStrategy {
    let options = BoundedCostOptions::new(5.0).history_length(100).required_history_length(100);
    let strategy = TrackingStrategy::new(BoundedCostStrategy::new(options).unwrap());

    for _ in 0..100 {
        strategy.record_completion(latency);
        // Arrivals on the inner strategy fill the cost limiter without touching the tracked stats.
        let _ = strategy.inner().time_until_backup_request();
    }

    strategy
}

pub(crate) fn bounded_cost_config(operation: &str, cost: u32) -> BackupRequestsConfig {
    match json!({ "operation": operation, "strategy": { "BoundedCostBackupRequests": { "cost": cost } } }) {
        serde_json::Value::Object(map) => map,
        _ => unreachable!(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ProviderEvent {
    Added { service: String, operation: String },
    Removed { service: String, operation: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LatencyUpdate {
    pub service: String,
    pub operation: String,
    pub with_backup: bool,
    pub count: u64,
}

/// Stats consumer that remembers every call.
#[derive(Debug, Default)]
pub(crate) struct RecordingConsumer {
    providers: Mutex<Vec<ProviderEvent>>,
    latency_updates: Mutex<Vec<LatencyUpdate>>,
}

impl RecordingConsumer {
    pub fn provider_events(&self) -> Vec<ProviderEvent> {
        self.providers.lock().unwrap().clone()
    }

    pub fn latency_updates(&self) -> Vec<LatencyUpdate> {
        self.latency_updates.lock().unwrap().clone()
    }
}

impl StatsConsumer for RecordingConsumer {
    fn add_stats_provider(&self, service: &str, operation: &str, _provider: Arc<dyn StatsProvider>) {
        self.providers.lock().unwrap().push(ProviderEvent::Added {
            service: service.to_string(),
            operation: operation.to_string(),
        });
    }

    fn remove_stats_provider(&self, service: &str, operation: &str, _provider: Arc<dyn StatsProvider>) {
        self.providers.lock().unwrap().push(ProviderEvent::Removed {
            service: service.to_string(),
            operation: operation.to_string(),
        });
    }

    fn latency_update(&self, service: &str, operation: &str, histogram: &LatencyHistogram, with_backup: bool) {
        self.latency_updates.lock().unwrap().push(LatencyUpdate {
            service: service.to_string(),
            operation: operation.to_string(),
            with_backup,
            count: histogram.len(),
        });
    }
}

/// Collects formatted log output of the current thread.
#[derive(Debug, Clone, Default)]
pub(crate) struct LogCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    pub fn output(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock().unwrap()).to_string()
    }

    /// Use with `tracing::subscriber::set_default`.
    pub fn subscriber(&self) -> impl tracing::Subscriber {
        use tracing_subscriber::layer::SubscriberExt;
        tracing_subscriber::registry().with(tracing_subscriber::fmt::layer().with_writer(self.clone()).with_ansi(false))
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = LogCaptureWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogCaptureWriter {
            buffer: Arc::clone(&self.buffer),
        }
    }
}

pub(crate) struct LogCaptureWriter {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl Write for LogCaptureWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
