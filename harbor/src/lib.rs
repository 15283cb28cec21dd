//! Harbor - durable Postgres storage for background job runtimes.
//!
//! Harbor keeps jobs, their state history, queue entries and the small
//! key/value collections a job runtime needs in one Postgres schema, and gets
//! every coordination guarantee from the database itself: row locks with
//! `SKIP LOCKED`, session advisory locks and savepoints.
//!
//! # Core Concepts
//!
//! - **Connection scope**: a [`ConnectionProvider`] hands out
//!   [`ScopedConnection`]s from a pool, or joins a caller-owned
//!   [`AmbientTransaction`] and nests work in savepoints.
//!
//! - **Schema initializer**: [`SchemaInitializer`] applies the embedded,
//!   contiguously numbered migrations once across every process, guarded by an
//!   advisory lock.
//!
//! - **Queue**: the [`JobQueue`] trait and its [`PostgresJobQueue`]
//!   implementation give at-least-once delivery. A claimed entry stays
//!   invisible for the invisibility timeout.
//!
//! - **Lease**: a [`LeaseHandle`] is confirmed (entry deleted) or abandoned
//!   (entry visible again). Dropping an unsettled lease abandons it.
//!
//! - **Write batch**: a [`WriteBatch`] records state transitions, counters,
//!   sets, lists and hashes, and commits them in one transaction.
//!
//! - **Reaper**: [`ExpiredLockReaper`] deletes [`DistributedLock`] rows left
//!   behind by crashed holders.
//!
//! # Feature Flags
//!
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use harbor::*;
//!
//! let pool = PersistenceConfig::new(database_url).connect().await?;
//! let storage = Storage::open(ConnectionProvider::pooled(pool), StorageOptions::default()).await?;
//! let connection = storage.connection()?;
//!
//! let job_id = connection.create_expired_job(NewJob::new(invocation, args)).await?;
//! connection.job_queue().enqueue("default", job_id).await?;
//!
//! let mut lease = connection
//!     .fetch_next_job(&["default".to_string()], &CancelToken::new())
//!     .await?;
//! let mut batch = connection.create_write_batch();
//! batch
//!     .set_job_state(lease.job_id(), StateData::new("Succeeded"))?
//!     .increment_counter("stats:succeeded")?;
//! batch.commit().await?;
//! lease.confirm().await?;
//! ```

/// Deferred mutations committed atomically.
///
/// The `batch` module provides [`WriteBatch`] and the [`BatchOp`] records it
/// replays on commit.
pub mod batch;

/// Cooperative cancellation for waiting operations.
pub mod cancel;

/// Configuration structures for connection pools and storage behavior.
///
/// The `config` module defines [`PersistenceConfig`] and [`StorageOptions`].
pub mod config;

/// Connection and transaction scopes, pooled or ambient.
pub mod connection;

/// Crate error type.
pub mod error;

/// Job identifiers and the data stored with a job.
pub mod job;

/// Leases on claimed queue entries.
pub mod lease;

#[cfg(feature = "metrics")]
/// Prometheus collectors.
pub mod metrics;

/// Queue traits and the Postgres queue.
///
/// The `queue` module defines the [`JobQueue`] and [`QueueLease`] traits and
/// [`PostgresJobQueue`], whose claim statement prefers earlier queues and
/// skips rows locked by concurrent claims.
pub mod queue;

/// Background sweep of expired distributed locks.
pub mod reaper;

/// Schema namespace, migrations and the initializer.
pub mod schema;

/// Job, state, collection and server operations.
///
/// The `storage` module provides [`Storage`], [`StorageConnection`] and
/// [`DistributedLock`].
pub mod storage;

/// Tracing spans and event helpers.
pub mod telemetry;

pub use batch::*;
pub use cancel::*;
pub use config::*;
pub use connection::*;
pub use error::{Error, Result};
pub use job::*;
pub use lease::*;
pub use queue::*;
pub use reaper::*;
pub use schema::{InitOutcome, SchemaInitializer, SchemaName};
pub use storage::*;
