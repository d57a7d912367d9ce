//! Execution strategies.
//!
//! A strategy runs a unit of work with the logging facets selected by a
//! [`LogLevel`], and the metered strategy also records duration and error
//! metrics. Instrumentation never changes the result of the unit of work.

use crate::error::TxResult;
use crate::metrics::Metrics;
use crate::models::{CallSite, LogFacets, LogLevel};
use std::future::Future;
use std::time::Instant;
use tracing::info;

#[derive(Debug, Clone, Default)]
pub enum ExecutionStrategy {
    /// Logging facets only.
    #[default]
    Plain,
    /// Logging facets plus duration and error metrics.
    Metered(Metrics),
}

impl ExecutionStrategy {
    /// Pick the strategy for a call declaring `instrumented`.
    pub fn select(instrumented: bool, metrics: &Metrics) -> Self {
        if instrumented {
            Self::Metered(metrics.clone())
        } else {
            Self::Plain
        }
    }

    pub fn is_metered(&self) -> bool {
        matches!(self, Self::Metered(_))
    }

    /// Run `work` with the facets of `level`.
    pub async fn execute_with<T, Fut>(&self, level: LogLevel, site: &CallSite, work: Fut) -> TxResult<T>
    where
        Fut: Future<Output = TxResult<T>>,
    {
        self.run(level.facets(), site, work).await
    }

    /// Run `work` without logging.
    pub async fn execute<T, Fut>(&self, site: &CallSite, work: Fut) -> TxResult<T>
    where
        Fut: Future<Output = TxResult<T>>,
    {
        self.run(LogFacets::NONE, site, work).await
    }

    pub async fn execute_with_wrap_logs<T, Fut>(&self, site: &CallSite, work: Fut) -> TxResult<T>
    where
        Fut: Future<Output = TxResult<T>>,
    {
        self.run(LogFacets::WRAP, site, work).await
    }

    pub async fn execute_with_time_logs<T, Fut>(&self, site: &CallSite, work: Fut) -> TxResult<T>
    where
        Fut: Future<Output = TxResult<T>>,
    {
        self.run(LogFacets::TIME, site, work).await
    }

    pub async fn execute_with_all_logs<T, Fut>(&self, site: &CallSite, work: Fut) -> TxResult<T>
    where
        Fut: Future<Output = TxResult<T>>,
    {
        self.run(LogFacets::ALL, site, work).await
    }

    async fn run<T, Fut>(&self, facets: LogFacets, site: &CallSite, work: Fut) -> TxResult<T>
    where
        Fut: Future<Output = TxResult<T>>,
    {
        if facets.wrap {
            info!(call_site = %site, "Call started");
        }

        let started = Instant::now();
        let result = work.await;
        let elapsed = started.elapsed();

        if facets.time {
            info!(
                call_site = %site,
                elapsed_ms = elapsed.as_secs_f64() * 1000.0,
                "Call duration"
            );
        }

        if let Self::Metered(metrics) = self {
            let operation = site.qualified_name();
            metrics.record_duration(&operation, elapsed);
            if result.is_err() {
                metrics.increment_errors(&operation);
            }
        }

        if facets.wrap {
            match &result {
                Ok(_) => info!(call_site = %site, "Call finished"),
                Err(e) => info!(call_site = %site, error = %e, "Call finished with error"),
            }
        }

        result
    }
}
