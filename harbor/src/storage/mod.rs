//! Inbound storage interface used by the host job runtime.
//!
//! [`StorageConnection`] creates jobs, reads job and state data, hands out
//! leases through the [`PostgresJobQueue`], and opens [`WriteBatch`]es. Read
//! helpers for counters, sets, lists and hashes live in `collections`, server
//! bookkeeping in `server`, and the row-based [`DistributedLock`] in `lock`.

use std::collections::HashMap;
use std::time::Duration;

use sqlx::Row;
use sqlx::types::Json;
use tracing::debug;

use crate::batch::WriteBatch;
use crate::cancel::CancelToken;
use crate::config::StorageOptions;
use crate::connection::{AmbientTransaction, ConnectionProvider, IsolationLevel};
use crate::error::{Result, require_non_empty};
use crate::job::{JobData, JobId, NewJob, StateData};
use crate::lease::LeaseHandle;
use crate::queue::{JobQueue, PostgresJobQueue};
use crate::reaper::ExpiredLockReaper;
use crate::schema::{SchemaInitializer, SchemaName};

mod collections;
mod lock;
mod server;

pub use lock::DistributedLock;
pub use server::{ServerContext, ServerData};

/// Storage operations over one schema.
#[derive(Clone, Debug)]
pub struct StorageConnection {
    provider: ConnectionProvider,
    schema: SchemaName,
    queue: PostgresJobQueue,
    lock_timeout: Duration,
}

impl StorageConnection {
    /// Create a connection over `provider` configured by `options`.
    pub fn new(provider: ConnectionProvider, options: &StorageOptions) -> Result<Self> {
        let queue = PostgresJobQueue::new(provider.clone(), options)?;
        Ok(Self {
            schema: queue.schema().clone(),
            provider,
            queue,
            lock_timeout: options.distributed_lock_timeout(),
        })
    }

    /// Where connections come from.
    pub fn provider(&self) -> &ConnectionProvider {
        &self.provider
    }

    /// Schema every statement targets.
    pub fn schema(&self) -> &SchemaName {
        &self.schema
    }

    /// The queue backing [`fetch_next_job`](Self::fetch_next_job).
    pub fn job_queue(&self) -> &PostgresJobQueue {
        &self.queue
    }

    /// Start an empty write batch.
    pub fn create_write_batch(&self) -> WriteBatch {
        WriteBatch::new(self.provider.clone(), self.schema.clone())
    }

    /// Wait for the next entry from `queues`, earlier queues first.
    pub async fn fetch_next_job(
        &self,
        queues: &[String],
        cancel: &CancelToken,
    ) -> Result<LeaseHandle> {
        self.queue.dequeue(queues, cancel).await
    }

    /// Take the distributed lock on `resource` using the configured timeout.
    pub async fn acquire_distributed_lock(&self, resource: &str) -> Result<DistributedLock> {
        DistributedLock::acquire(
            self.provider.clone(),
            self.schema.clone(),
            resource,
            self.lock_timeout,
        )
        .await
    }

    /// Insert a job and its parameters. The job expires `expire_in` after it was created.
    pub async fn create_expired_job(&self, job: NewJob) -> Result<JobId> {
        for name in job.parameters.keys() {
            require_non_empty("parameters", name)?;
        }
        let job_sql = format!(
            r#"
            INSERT INTO {} (invocationdata, arguments, createdat, expireat)
            VALUES ($1, $2, $3, $3 + make_interval(secs => $4))
            RETURNING id
            "#,
            self.schema.table("job")
        );
        let param_sql = format!(
            "INSERT INTO {} (jobid, name, value) VALUES ($1, $2, $3)",
            self.schema.table("jobparameter")
        );

        let mut scope = self.provider.acquire().await?;
        let mut tx = scope.begin_transaction(IsolationLevel::ReadCommitted).await?;

        let id: i64 = sqlx::query_scalar(&job_sql)
            .bind(Json(&job.invocation_data))
            .bind(Json(&job.arguments))
            .bind(job.created_at)
            .bind(job.expire_in.as_secs_f64())
            .fetch_one(tx.connection())
            .await?;

        for (name, value) in &job.parameters {
            sqlx::query(&param_sql)
                .bind(id)
                .bind(name)
                .bind(value.as_deref())
                .execute(tx.connection())
                .await?;
        }

        tx.commit().await?;
        debug!(job_id = id, parameters = job.parameters.len(), "job created");
        Ok(JobId(id))
    }

    /// Payload and current state name of a job, if it exists.
    pub async fn get_job_data(&self, job_id: JobId) -> Result<Option<JobData>> {
        let sql = format!(
            "SELECT invocationdata, arguments, statename, createdat, expireat FROM {} WHERE id = $1",
            self.schema.table("job")
        );
        let mut scope = self.provider.acquire().await?;
        let row = sqlx::query(&sql)
            .bind(job_id.get())
            .fetch_optional(scope.connection()?)
            .await;
        let Some(row) = scope.observe(row)? else {
            return Ok(None);
        };
        Ok(Some(JobData {
            invocation_data: row.try_get::<Json<serde_json::Value>, _>("invocationdata")?.0,
            arguments: row.try_get::<Json<serde_json::Value>, _>("arguments")?.0,
            state_name: row.try_get("statename")?,
            created_at: row.try_get("createdat")?,
            expire_at: row.try_get("expireat")?,
        }))
    }

    /// The state the job currently points at.
    pub async fn get_state_data(&self, job_id: JobId) -> Result<Option<StateData>> {
        let sql = format!(
            r#"
            SELECT s.name, s.reason, s.data
            FROM {job} j
            INNER JOIN {state} s ON s.id = j.stateid
            WHERE j.id = $1
            "#,
            job = self.schema.table("job"),
            state = self.schema.table("state"),
        );
        let mut scope = self.provider.acquire().await?;
        let row = sqlx::query(&sql)
            .bind(job_id.get())
            .fetch_optional(scope.connection()?)
            .await;
        let Some(row) = scope.observe(row)? else {
            return Ok(None);
        };
        let data: Option<Json<HashMap<String, String>>> = row.try_get("data")?;
        Ok(Some(StateData {
            name: row.try_get("name")?,
            reason: row.try_get("reason")?,
            data: data.map(|d| d.0).unwrap_or_default(),
        }))
    }

    /// Set or overwrite one job parameter.
    pub async fn set_job_parameter(
        &self,
        job_id: JobId,
        name: &str,
        value: Option<&str>,
    ) -> Result<()> {
        require_non_empty("name", name)?;
        let sql = format!(
            r#"
            INSERT INTO {} (jobid, name, value)
            VALUES ($1, $2, $3)
            ON CONFLICT (jobid, name) DO UPDATE SET value = EXCLUDED.value
            "#,
            self.schema.table("jobparameter")
        );
        let mut scope = self.provider.acquire().await?;
        let done = sqlx::query(&sql)
            .bind(job_id.get())
            .bind(name)
            .bind(value)
            .execute(scope.connection()?)
            .await;
        scope.observe(done)?;
        Ok(())
    }

    /// Read one job parameter. Missing and null parameters both read as `None`.
    pub async fn get_job_parameter(&self, job_id: JobId, name: &str) -> Result<Option<String>> {
        require_non_empty("name", name)?;
        let sql = format!(
            "SELECT value FROM {} WHERE jobid = $1 AND name = $2",
            self.schema.table("jobparameter")
        );
        let mut scope = self.provider.acquire().await?;
        let value: std::result::Result<Option<Option<String>>, sqlx::Error> =
            sqlx::query_scalar(&sql)
                .bind(job_id.get())
                .bind(name)
                .fetch_optional(scope.connection()?)
                .await;
        Ok(scope.observe(value)?.flatten())
    }
}

/// Entry point: validated options plus a connection provider.
#[derive(Clone, Debug)]
pub struct Storage {
    provider: ConnectionProvider,
    options: StorageOptions,
}

impl Storage {
    /// Validate `options` and, if asked to, bring the schema up to date.
    pub async fn open(provider: ConnectionProvider, options: StorageOptions) -> Result<Self> {
        options.validate()?;
        if options.prepare_schema_if_necessary {
            SchemaInitializer::new(provider.clone(), options.schema()?)
                .initialize()
                .await?;
        }
        Ok(Self { provider, options })
    }

    /// Options the storage was opened with.
    pub fn options(&self) -> &StorageOptions {
        &self.options
    }

    /// A connection for job, state and collection operations.
    pub fn connection(&self) -> Result<StorageConnection> {
        StorageConnection::new(self.provider.clone(), &self.options)
    }

    /// The same storage, joined to a caller-owned transaction.
    pub fn with_transaction(&self, transaction: AmbientTransaction) -> Self {
        Self {
            provider: ConnectionProvider::ambient(transaction),
            options: self.options.clone(),
        }
    }

    /// The expired-lock reaper for this schema.
    pub fn lock_reaper(&self) -> Result<ExpiredLockReaper> {
        ExpiredLockReaper::new(self.provider.clone(), &self.options)
    }
}
