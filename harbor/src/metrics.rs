//! Prometheus metrics instrumentation for harbor.
//!
//! All collectors are compiled behind the `metrics` feature flag.
//!
//! # Metrics
//!
//! ## Counters
//! - `harbor_jobs_enqueued_total` - Queue entries inserted, by queue
//! - `harbor_jobs_fetched_total` - Queue entries claimed, by queue
//! - `harbor_lease_released_total` - Leases ended, by queue and outcome
//! - `harbor_dequeue_poll_misses_total` - Claim attempts that found nothing
//! - `harbor_locks_reaped_total` - Stale distributed lock rows removed
//! - `harbor_schema_init_total` - Initializer runs, by outcome
//!
//! ## Histograms
//! - `harbor_batch_commit_seconds` - Write batch commit latency, by status
#![cfg(feature = "metrics")]

use prometheus::{
    Counter, CounterVec, HistogramOpts, HistogramVec, Opts, Registry, exponential_buckets,
};
use std::sync::LazyLock;

/// Global Prometheus registry for harbor metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Counter for queue entries inserted.
pub static JOBS_ENQUEUED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("harbor_jobs_enqueued_total", "Total queue entries inserted");
    CounterVec::new(opts, &["queue"]).expect("harbor_jobs_enqueued_total metric creation failed")
});

/// Counter for queue entries claimed by a dequeue.
pub static JOBS_FETCHED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("harbor_jobs_fetched_total", "Total queue entries claimed");
    CounterVec::new(opts, &["queue"]).expect("harbor_jobs_fetched_total metric creation failed")
});

/// Counter for lease terminations.
///
/// Labels:
/// - `queue`: The queue the entry was claimed from
/// - `outcome`: `confirmed`, `abandoned` or `dropped`
pub static LEASE_RELEASED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("harbor_lease_released_total", "Total leases ended");
    CounterVec::new(opts, &["queue", "outcome"])
        .expect("harbor_lease_released_total metric creation failed")
});

/// Counter for empty claim attempts.
pub static DEQUEUE_POLL_MISSES_TOTAL: LazyLock<Counter> = LazyLock::new(|| {
    Counter::new(
        "harbor_dequeue_poll_misses_total",
        "Total claim attempts that found no eligible entry",
    )
    .expect("harbor_dequeue_poll_misses_total metric creation failed")
});

/// Counter for reaped lock rows.
pub static LOCKS_REAPED_TOTAL: LazyLock<Counter> = LazyLock::new(|| {
    Counter::new("harbor_locks_reaped_total", "Total expired lock rows deleted")
        .expect("harbor_locks_reaped_total metric creation failed")
});

/// Counter for schema initializer runs.
pub static SCHEMA_INIT_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("harbor_schema_init_total", "Schema initializer runs by outcome");
    CounterVec::new(opts, &["outcome"]).expect("harbor_schema_init_total metric creation failed")
});

/// Histogram for write batch commit latency in seconds.
///
/// Labels:
/// - `status`: `committed` or `rolled_back`
pub static BATCH_COMMIT_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.0005, 2.0, 14).expect("bucket creation failed");
    let opts = HistogramOpts::new(
        "harbor_batch_commit_seconds",
        "Write batch commit latency in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["status"]).expect("harbor_batch_commit_seconds metric creation failed")
});

/// Register every collector with [`REGISTRY`].
///
/// Calling it more than once is harmless.
pub fn register_metrics() -> prometheus::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(JOBS_ENQUEUED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(JOBS_FETCHED_TOTAL.clone()),
        Box::new(LEASE_RELEASED_TOTAL.clone()),
        Box::new(DEQUEUE_POLL_MISSES_TOTAL.clone()),
        Box::new(LOCKS_REAPED_TOTAL.clone()),
        Box::new(SCHEMA_INIT_TOTAL.clone()),
        Box::new(BATCH_COMMIT_SECONDS.clone()),
    ] {
        match registry.register(metric) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(e),
        }
    }

    Ok(())
}

pub(crate) fn record_job_enqueued(queue: &str) {
    JOBS_ENQUEUED_TOTAL.with_label_values(&[queue]).inc();
}

pub(crate) fn record_job_fetched(queue: &str) {
    JOBS_FETCHED_TOTAL.with_label_values(&[queue]).inc();
}

pub(crate) fn record_lease_released(queue: &str, outcome: &str) {
    LEASE_RELEASED_TOTAL
        .with_label_values(&[queue, outcome])
        .inc();
}

pub(crate) fn record_poll_miss() {
    DEQUEUE_POLL_MISSES_TOTAL.inc();
}

pub(crate) fn record_locks_reaped(removed: u64) {
    LOCKS_REAPED_TOTAL.inc_by(removed as f64);
}

pub(crate) fn record_schema_outcome(outcome: &str) {
    SCHEMA_INIT_TOTAL.with_label_values(&[outcome]).inc();
}

pub(crate) fn observe_batch_commit(status: &str, seconds: f64) {
    BATCH_COMMIT_SECONDS
        .with_label_values(&[status])
        .observe(seconds);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> prometheus::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    encoder.encode_to_string(&REGISTRY.gather())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_is_idempotent() {
        register_metrics().expect("first registration");
        register_metrics().expect("second registration");
    }

    #[test]
    fn test_gather_metrics() {
        register_metrics().unwrap();

        record_job_enqueued("default");
        record_lease_released("default", "confirmed");
        observe_batch_commit("committed", 0.002);

        let output = gather_metrics().expect("gather should succeed");
        assert!(output.contains("harbor_jobs_enqueued_total"));
        assert!(output.contains("harbor_lease_released_total"));
        assert!(output.contains("harbor_batch_commit_seconds"));
    }
}
