//! Tracing and telemetry instrumentation for harbor.
//!
//! Span constructors for every storage operation that touches the queue or
//! commits work, plus `record_*` helpers that emit a structured event and,
//! with the `metrics` feature, bump the matching Prometheus collector.
//!
//! # Example
//!
//! ```ignore
//! use harbor::telemetry::{enqueue_span, record_job_enqueued};
//! use tracing::Instrument;
//!
//! async {
//!     // insert the queue row
//!     record_job_enqueued("default", 42);
//! }
//! .instrument(enqueue_span("default", 42))
//! .await;
//! ```

use std::time::Instant;

use tracing::{Span, info_span};

use crate::schema::InitOutcome;

/// Span around inserting one queue entry.
#[must_use]
pub fn enqueue_span(queue: &str, job_id: i64) -> Span {
    info_span!("harbor.enqueue", queue = %queue, job_id)
}

/// Span around a whole dequeue call, including every poll attempt.
#[must_use]
pub fn dequeue_span(queues: &[String]) -> Span {
    info_span!(
        "harbor.dequeue",
        queues = %queues.join(","),
        attempts = tracing::field::Empty,
    )
}

/// Span around confirming or abandoning a lease.
#[must_use]
pub fn lease_span(entry_id: i64, job_id: i64, queue: &str, action: &'static str) -> Span {
    info_span!("harbor.lease", entry_id, job_id, queue = %queue, action)
}

/// Span around a write batch commit.
#[must_use]
pub fn commit_span(ops: usize) -> Span {
    info_span!("harbor.commit", ops)
}

/// Span around schema initialization.
#[must_use]
pub fn migrate_span(schema: &str) -> Span {
    info_span!("harbor.migrate", schema = %schema)
}

/// Span around one expired-lock sweep.
#[must_use]
pub fn reap_span(schema: &str) -> Span {
    info_span!("harbor.reap", schema = %schema)
}

/// Record that a queue entry was inserted.
pub fn record_job_enqueued(queue: &str, job_id: i64) {
    tracing::debug!(queue, job_id, "job enqueued");

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_enqueued(queue);
}

/// Record a successful claim.
pub fn record_job_fetched(queue: &str, job_id: i64, attempts: u32) {
    tracing::debug!(queue, job_id, attempts, "job fetched");

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_fetched(queue);
}

/// Record a claim attempt that found nothing eligible.
pub fn record_poll_miss() {
    tracing::trace!("no eligible queue entry");

    #[cfg(feature = "metrics")]
    crate::metrics::record_poll_miss();
}

/// Record how a lease ended: `confirmed`, `abandoned` or `dropped`.
pub fn record_lease_released(queue: &str, outcome: &'static str) {
    tracing::debug!(queue, outcome, "lease released");

    #[cfg(feature = "metrics")]
    crate::metrics::record_lease_released(queue, outcome);
}

/// Record the result of a write batch commit.
pub fn record_batch_committed(ops: usize, status: &'static str, started: Instant) {
    let elapsed = started.elapsed();
    let elapsed_ms = elapsed.as_millis() as u64;
    if status == "committed" {
        tracing::debug!(ops, elapsed_ms, "write batch committed");
    } else {
        tracing::warn!(ops, status, elapsed_ms, "write batch rolled back");
    }

    #[cfg(feature = "metrics")]
    crate::metrics::observe_batch_commit(status, elapsed.as_secs_f64());
}

/// Record how many stale lock rows a sweep removed.
pub fn record_locks_reaped(schema: &str, removed: u64) {
    if removed > 0 {
        tracing::info!(schema, removed, "expired locks reaped");
    } else {
        tracing::trace!(schema, "no expired locks");
    }

    #[cfg(feature = "metrics")]
    crate::metrics::record_locks_reaped(removed);
}

/// Record what schema initialization did.
pub fn record_schema_initialized(schema: &str, outcome: &InitOutcome) {
    match outcome {
        InitOutcome::Skipped => tracing::info!(schema, "schema initialization skipped"),
        InitOutcome::UpToDate { version } => {
            tracing::debug!(schema, version, "schema already current")
        }
        InitOutcome::Migrated { from, to } => {
            tracing::info!(schema, from, to, "schema migrations applied")
        }
    }

    #[cfg(feature = "metrics")]
    crate::metrics::record_schema_outcome(match outcome {
        InitOutcome::Skipped => "skipped",
        InitOutcome::UpToDate { .. } => "up_to_date",
        InitOutcome::Migrated { .. } => "migrated",
    });
}
