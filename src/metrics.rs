//! Metrics facade.
//!
//! [`Metrics`] is a cheap, cloneable handle over an optional [`MetricsSink`].
//! Without a sink every call is a no-op. Sink calls are isolated from the
//! caller: a panicking sink is logged and otherwise ignored, so recording a
//! metric can never change the outcome of a transaction.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Histogram of call durations.
pub const DURATION_METRIC: &str = "tx.duration";

/// Counter of failed calls.
pub const ERROR_METRIC: &str = "tx.errors";

/// Backend that receives metric events.
pub trait MetricsSink: Send + Sync {
    fn record_duration(&self, operation: &str, duration: Duration);

    fn increment_errors(&self, operation: &str);
}

/// Handle used by execution strategies to record metrics.
#[derive(Clone, Default)]
pub struct Metrics {
    sink: Option<Arc<dyn MetricsSink>>,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("attached", &self.sink.is_some())
            .finish()
    }
}

impl Metrics {
    pub fn new(sink: Arc<dyn MetricsSink>) -> Self {
        Self { sink: Some(sink) }
    }

    /// A handle with no backend attached.
    pub fn noop() -> Self {
        Self { sink: None }
    }

    pub fn is_attached(&self) -> bool {
        self.sink.is_some()
    }

    pub fn record_duration(&self, operation: &str, duration: Duration) {
        self.guarded(DURATION_METRIC, operation, |sink| {
            sink.record_duration(operation, duration)
        });
    }

    pub fn increment_errors(&self, operation: &str) {
        self.guarded(ERROR_METRIC, operation, |sink| sink.increment_errors(operation));
    }

    fn guarded(&self, metric: &str, operation: &str, f: impl FnOnce(&dyn MetricsSink)) {
        let Some(sink) = &self.sink else {
            return;
        };
        if catch_unwind(AssertUnwindSafe(|| f(sink.as_ref()))).is_err() {
            warn!(
                metric = metric,
                operation = %operation,
                "Metrics sink failed, event dropped"
            );
        }
    }
}

#[derive(Debug, Clone, Default)]
struct OperationStats {
    count: u64,
    total: Duration,
    min: Option<Duration>,
    max: Duration,
    errors: u64,
}

/// In-process metrics sink keeping a per-operation summary.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    operations: Mutex<HashMap<String, OperationStats>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience: a registry plus a [`Metrics`] handle that feeds it.
    pub fn shared() -> (Arc<Self>, Metrics) {
        let registry = Arc::new(Self::new());
        let metrics = Metrics::new(registry.clone());
        (registry, metrics)
    }

    /// Number of recorded durations for `operation`.
    pub fn duration_count(&self, operation: &str) -> u64 {
        self.operations
            .lock()
            .get(operation)
            .map(|s| s.count)
            .unwrap_or(0)
    }

    /// Error counter for `operation`.
    pub fn error_count(&self, operation: &str) -> u64 {
        self.operations
            .lock()
            .get(operation)
            .map(|s| s.errors)
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let operations = self
            .operations
            .lock()
            .iter()
            .map(|(name, stats)| {
                let mean_micros = if stats.count == 0 {
                    0
                } else {
                    (stats.total.as_micros() / u128::from(stats.count)) as u64
                };
                (
                    name.clone(),
                    OperationSnapshot {
                        duration: DurationSummary {
                            count: stats.count,
                            total_micros: stats.total.as_micros() as u64,
                            min_micros: stats.min.map(|d| d.as_micros() as u64).unwrap_or(0),
                            max_micros: stats.max.as_micros() as u64,
                            mean_micros,
                        },
                        errors: stats.errors,
                    },
                )
            })
            .collect();

        MetricsSnapshot {
            taken_at: Utc::now(),
            operations,
        }
    }

    pub fn reset(&self) {
        self.operations.lock().clear();
    }
}

impl MetricsSink for MetricsRegistry {
    fn record_duration(&self, operation: &str, duration: Duration) {
        let mut operations = self.operations.lock();
        let stats = operations.entry(operation.to_string()).or_default();
        stats.count += 1;
        stats.total += duration;
        stats.min = Some(stats.min.map_or(duration, |min| min.min(duration)));
        stats.max = stats.max.max(duration);
    }

    fn increment_errors(&self, operation: &str) {
        let mut operations = self.operations.lock();
        operations.entry(operation.to_string()).or_default().errors += 1;
    }
}

/// Serializable view of a [`MetricsRegistry`].
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub taken_at: DateTime<Utc>,
    pub operations: BTreeMap<String, OperationSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OperationSnapshot {
    #[serde(rename = "tx.duration")]
    pub duration: DurationSummary,
    #[serde(rename = "tx.errors")]
    pub errors: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DurationSummary {
    pub count: u64,
    pub total_micros: u64,
    pub min_micros: u64,
    pub max_micros: u64,
    pub mean_micros: u64,
}
