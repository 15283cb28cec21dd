use std::time::Duration;

use async_trait::async_trait;
use sqlx::Row;
use tracing::{Instrument, Span, debug};

use crate::cancel::CancelToken;
use crate::config::StorageOptions;
use crate::connection::ConnectionProvider;
use crate::error::{Error, Result, require_non_empty};
use crate::job::JobId;
use crate::lease::LeaseHandle;
use crate::schema::SchemaName;
use crate::telemetry;

/// One claimed queue entry.
///
/// Implementors must make sure an entry that is neither confirmed nor
/// abandoned becomes claimable again.
#[async_trait]
pub trait QueueLease: Send {
    /// Job the entry points at.
    fn job_id(&self) -> JobId;

    /// Queue the entry was claimed from.
    fn queue(&self) -> &str;

    /// Remove the entry; the job is done.
    async fn confirm(&mut self) -> Result<()>;

    /// Put the entry back so it can be claimed right away.
    async fn abandon(&mut self) -> Result<()>;
}

/// Trait for durable queue backends with lease-based delivery.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Handle returned by [`dequeue`](Self::dequeue).
    type Lease: QueueLease;

    /// Add an entry for `job_id` to `queue`. Enqueueing the same job twice yields two entries.
    async fn enqueue(&self, queue: &str, job_id: JobId) -> Result<()>;

    /// Wait until an entry from one of `queues` can be claimed.
    ///
    /// Earlier queues are preferred. Only `cancel` ends the wait without a
    /// lease, with [`Error::Canceled`].
    async fn dequeue(&self, queues: &[String], cancel: &CancelToken) -> Result<Self::Lease>;
}

/// Claimed row returned by the claim statement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ClaimedEntry {
    pub id: i64,
    pub job_id: JobId,
    pub queue: String,
}

/// Postgres `jobqueue` table driven with `FOR UPDATE SKIP LOCKED` claims.
#[derive(Clone, Debug)]
pub struct PostgresJobQueue {
    provider: ConnectionProvider,
    schema: SchemaName,
    invisibility_timeout: Duration,
    poll_interval: Duration,
}

impl PostgresJobQueue {
    /// Create a queue over `provider` using the schema and timings in `options`.
    pub fn new(provider: ConnectionProvider, options: &StorageOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            provider,
            schema: options.schema()?,
            invisibility_timeout: options.invisibility_timeout(),
            poll_interval: options.queue_poll_interval(),
        })
    }

    /// Schema the queue lives in.
    pub fn schema(&self) -> &SchemaName {
        &self.schema
    }

    /// How long a claimed entry stays invisible to other dequeuers.
    pub fn invisibility_timeout(&self) -> Duration {
        self.invisibility_timeout
    }

    /// Make one claim attempt without waiting.
    pub async fn try_dequeue(&self, queues: &[String]) -> Result<Option<LeaseHandle>> {
        validate_queues(queues)?;
        Ok(self.claim(queues).await?.map(|entry| self.lease(entry)))
    }

    async fn claim(&self, queues: &[String]) -> Result<Option<ClaimedEntry>> {
        let sql = claim_sql(&self.schema);
        let mut scope = self.provider.acquire().await?;
        let row = sqlx::query(&sql)
            .bind(queues)
            .bind(self.invisibility_timeout.as_secs_f64())
            .fetch_optional(scope.connection()?)
            .await;
        let Some(row) = scope.observe(row)? else {
            return Ok(None);
        };
        Ok(Some(ClaimedEntry {
            id: row.try_get("id")?,
            job_id: JobId(row.try_get("jobid")?),
            queue: row.try_get("queue")?,
        }))
    }

    fn lease(&self, entry: ClaimedEntry) -> LeaseHandle {
        LeaseHandle::new(entry, self.provider.clone(), self.schema.clone())
    }
}

#[async_trait]
impl JobQueue for PostgresJobQueue {
    type Lease = LeaseHandle;

    async fn enqueue(&self, queue: &str, job_id: JobId) -> Result<()> {
        require_non_empty("queue", queue)?;
        let span = telemetry::enqueue_span(queue, job_id.get());
        async {
            let sql = enqueue_sql(&self.schema);
            let mut scope = self.provider.acquire().await?;
            let inserted = sqlx::query(&sql)
                .bind(job_id.get())
                .bind(queue)
                .execute(scope.connection()?)
                .await;
            scope.observe(inserted)?;
            telemetry::record_job_enqueued(queue, job_id.get());
            Ok(())
        }
        .instrument(span)
        .await
    }

    async fn dequeue(&self, queues: &[String], cancel: &CancelToken) -> Result<LeaseHandle> {
        validate_queues(queues)?;
        let span = telemetry::dequeue_span(queues);
        async {
            let mut attempts: u32 = 0;
            loop {
                cancel.check()?;
                attempts += 1;

                if let Some(entry) = self.claim(queues).await? {
                    Span::current().record("attempts", attempts);
                    telemetry::record_job_fetched(&entry.queue, entry.job_id.get(), attempts);
                    return Ok(self.lease(entry));
                }

                telemetry::record_poll_miss();
                cancel.check()?;
                debug!(
                    wait_ms = self.poll_interval.as_millis() as u64,
                    "no eligible entry; waiting"
                );
                cancel.sleep(self.poll_interval).await?;
            }
        }
        .instrument(span)
        .await
    }
}

fn validate_queues(queues: &[String]) -> Result<()> {
    if queues.is_empty() {
        return Err(Error::validation("queues", "at least one queue is required"));
    }
    for queue in queues {
        require_non_empty("queues", queue)?;
    }
    Ok(())
}

pub(crate) fn enqueue_sql(schema: &SchemaName) -> String {
    format!(
        "INSERT INTO {} (jobid, queue) VALUES ($1, $2)",
        schema.table("jobqueue")
    )
}

/// Claim statement: `$1` is the ordered queue list, `$2` the invisibility timeout in seconds.
///
/// The first listed queue wins; within a queue the oldest entry wins.
pub fn claim_sql(schema: &SchemaName) -> String {
    let table = schema.table("jobqueue");
    format!(
        r#"
        UPDATE {table}
        SET fetchedat = NOW()
        WHERE id = (
            SELECT id
            FROM {table}
            WHERE queue = ANY($1)
              AND (fetchedat IS NULL OR fetchedat < NOW() - make_interval(secs => $2))
            ORDER BY array_position($1, queue), id
            LIMIT 1
            FOR UPDATE SKIP LOCKED
        )
        RETURNING id, jobid, queue
        "#
    )
}
