//! Per-operation metrics.
//!
//! An [`Operations`] value is created by the caller, registered on the
//! caller's registry and handed to each store constructor.

use crate::error::MetadataResult;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};
use std::future::Future;

/// Counters and latency histograms labelled by operation name.
#[derive(Clone)]
pub struct Operations {
    calls: IntCounterVec,
    errors: IntCounterVec,
    rows: IntCounterVec,
    duration: HistogramVec,
}

impl Operations {
    /// Create the metric set and register it on `registry`.
    pub fn new(registry: &Registry) -> MetadataResult<Self> {
        let ops = Self::build()?;
        registry.register(Box::new(ops.calls.clone()))?;
        registry.register(Box::new(ops.errors.clone()))?;
        registry.register(Box::new(ops.rows.clone()))?;
        registry.register(Box::new(ops.duration.clone()))?;
        Ok(ops)
    }

    /// Create a metric set that is not exported anywhere.
    pub fn unregistered() -> MetadataResult<Self> {
        Self::build()
    }

    fn build() -> MetadataResult<Self> {
        Ok(Self {
            calls: IntCounterVec::new(
                Opts::new(
                    "tidemark_metadata_operations_total",
                    "Total number of metadata operations",
                ),
                &["op"],
            )?,
            errors: IntCounterVec::new(
                Opts::new(
                    "tidemark_metadata_operation_errors_total",
                    "Total number of failed metadata operations",
                ),
                &["op"],
            )?,
            rows: IntCounterVec::new(
                Opts::new(
                    "tidemark_metadata_rows_total",
                    "Rows affected by metadata operations",
                ),
                &["op", "kind"],
            )?,
            duration: HistogramVec::new(
                HistogramOpts::new(
                    "tidemark_metadata_operation_duration_seconds",
                    "Metadata operation latency",
                )
                .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0]),
                &["op"],
            )?,
        })
    }

    /// Run `fut` as operation `op`, recording its latency and outcome.
    pub(crate) async fn observe<T, F>(&self, op: &'static str, fut: F) -> MetadataResult<T>
    where
        F: Future<Output = MetadataResult<T>>,
    {
        self.calls.with_label_values(&[op]).inc();
        let timer = self.duration.with_label_values(&[op]).start_timer();
        let result = fut.await;
        timer.observe_duration();
        if let Err(err) = &result {
            self.errors.with_label_values(&[op]).inc();
            tracing::debug!(op, error = %err, "metadata operation failed");
        }
        result
    }

    pub(crate) fn record_rows(&self, op: &'static str, kind: &'static str, count: u64) {
        if count > 0 {
            self.rows.with_label_values(&[op, kind]).inc_by(count);
        }
    }

    /// Number of calls recorded for `op`.
    pub fn calls(&self, op: &str) -> u64 {
        self.calls.with_label_values(&[op]).get()
    }

    /// Number of failed calls recorded for `op`.
    pub fn errors(&self, op: &str) -> u64 {
        self.errors.with_label_values(&[op]).get()
    }

    /// Rows of `kind` recorded for `op`.
    pub fn rows(&self, op: &str, kind: &str) -> u64 {
        self.rows.with_label_values(&[op, kind]).get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MetadataError;

    #[tokio::test]
    async fn test_observe_counts_calls_and_errors() {
        let ops = Operations::unregistered().unwrap();
        let ok: MetadataResult<u32> = ops.observe("demo", async { Ok(1) }).await;
        assert_eq!(ok.unwrap(), 1);
        let err: MetadataResult<u32> = ops
            .observe("demo", async { Err(MetadataError::Internal("boom".to_string())) })
            .await;
        assert!(err.is_err());
        assert_eq!(ops.calls("demo"), 2);
        assert_eq!(ops.errors("demo"), 1);
    }

    #[test]
    fn test_register_twice_on_same_registry_fails() {
        let registry = Registry::new();
        Operations::new(&registry).unwrap();
        assert!(matches!(
            Operations::new(&registry),
            Err(MetadataError::Metrics(_))
        ));
    }

    #[test]
    fn test_record_rows_skips_zero() {
        let ops = Operations::unregistered().unwrap();
        ops.record_rows("demo", "deleted", 0);
        ops.record_rows("demo", "deleted", 3);
        assert_eq!(ops.rows("demo", "deleted"), 3);
    }
}
