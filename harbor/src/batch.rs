//! Deferred storage mutations committed as one unit.
//!
//! A [`WriteBatch`] only records [`BatchOp`]s; nothing touches the database
//! until [`WriteBatch::commit`], which replays them in order inside a single
//! `REPEATABLE READ` transaction (or a savepoint, under an ambient transaction).

use std::time::{Duration, Instant};

use sqlx::PgConnection;
use sqlx::types::Json;
use tracing::{Instrument, warn};

use crate::connection::{ConnectionProvider, IsolationLevel};
use crate::error::{Result, require_non_empty};
use crate::job::{JobId, StateData};
use crate::queue::enqueue_sql;
use crate::schema::SchemaName;
use crate::telemetry;

/// Keyed collection tables that carry their own expiry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Collection {
    /// `"set"`
    Set,
    /// `"list"`
    List,
    /// `"hash"`
    Hash,
}

impl Collection {
    fn table(self) -> &'static str {
        match self {
            Collection::Set => "set",
            Collection::List => "list",
            Collection::Hash => "hash",
        }
    }
}

/// One recorded mutation.
#[derive(Clone, Debug, PartialEq)]
pub enum BatchOp {
    /// Set the job's expiry to now plus `expire_in`.
    ExpireJob {
        /// Target job.
        job_id: JobId,
        /// Lifetime from commit time.
        expire_in: Duration,
    },
    /// Clear the job's expiry.
    PersistJob {
        /// Target job.
        job_id: JobId,
    },
    /// Append a state and make it the job's current one.
    SetJobState {
        /// Target job.
        job_id: JobId,
        /// State to append.
        state: StateData,
    },
    /// Append a state to the history only.
    AddJobState {
        /// Target job.
        job_id: JobId,
        /// State to append.
        state: StateData,
    },
    /// Insert a queue entry.
    Enqueue {
        /// Queue name.
        queue: String,
        /// Job the entry points at.
        job_id: JobId,
    },
    /// Append a counter delta.
    Counter {
        /// Counter key.
        key: String,
        /// Signed change.
        delta: i64,
        /// Lifetime of this delta row, if any.
        expire_in: Option<Duration>,
    },
    /// Upsert a set member's score.
    AddToSet {
        /// Set key.
        key: String,
        /// Member.
        value: String,
        /// Score to store.
        score: f64,
    },
    /// Insert members with score 0, keeping existing ones.
    AddRangeToSet {
        /// Set key.
        key: String,
        /// Members to add.
        values: Vec<String>,
    },
    /// Remove one set member.
    RemoveFromSet {
        /// Set key.
        key: String,
        /// Member to remove.
        value: String,
    },
    /// Remove the whole set.
    RemoveSet {
        /// Set key.
        key: String,
    },
    /// Append to a list.
    InsertToList {
        /// List key.
        key: String,
        /// Element to append.
        value: String,
    },
    /// Remove every occurrence of `value` from a list.
    RemoveFromList {
        /// List key.
        key: String,
        /// Element to remove.
        value: String,
    },
    /// Keep only positions `keep_from..=keep_to` in insertion order.
    TrimList {
        /// List key.
        key: String,
        /// First kept position.
        keep_from: i64,
        /// Last kept position.
        keep_to: i64,
    },
    /// Upsert hash fields.
    SetRangeInHash {
        /// Hash key.
        key: String,
        /// `(field, value)` pairs.
        entries: Vec<(String, String)>,
    },
    /// Remove the whole hash.
    RemoveHash {
        /// Hash key.
        key: String,
    },
    /// Expire every row of a keyed collection.
    Expire {
        /// Table holding the collection.
        collection: Collection,
        /// Collection key.
        key: String,
        /// Lifetime from commit time.
        expire_in: Duration,
    },
    /// Clear the expiry on every row of a keyed collection.
    Persist {
        /// Table holding the collection.
        collection: Collection,
        /// Collection key.
        key: String,
    },
}

/// Accumulates mutations for one atomic commit.
#[derive(Debug)]
pub struct WriteBatch {
    provider: ConnectionProvider,
    schema: SchemaName,
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    /// Create an empty batch.
    pub fn new(provider: ConnectionProvider, schema: SchemaName) -> Self {
        Self {
            provider,
            schema,
            ops: Vec::new(),
        }
    }

    /// Operations recorded so far, in commit order.
    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    /// Number of recorded operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    fn push(&mut self, op: BatchOp) -> Result<&mut Self> {
        self.ops.push(op);
        Ok(self)
    }

    /// Expire the job `expire_in` from commit time.
    pub fn expire_job(&mut self, job_id: JobId, expire_in: Duration) -> Result<&mut Self> {
        self.push(BatchOp::ExpireJob { job_id, expire_in })
    }

    /// Clear the job's expiry.
    pub fn persist_job(&mut self, job_id: JobId) -> Result<&mut Self> {
        self.push(BatchOp::PersistJob { job_id })
    }

    /// Append `state` to the history and make it the job's current state.
    pub fn set_job_state(&mut self, job_id: JobId, state: StateData) -> Result<&mut Self> {
        require_non_empty("state.name", &state.name)?;
        self.push(BatchOp::SetJobState { job_id, state })
    }

    /// Append `state` to the history without changing the current state.
    pub fn add_job_state(&mut self, job_id: JobId, state: StateData) -> Result<&mut Self> {
        require_non_empty("state.name", &state.name)?;
        self.push(BatchOp::AddJobState { job_id, state })
    }

    /// Add a queue entry for `job_id` once the batch commits.
    pub fn enqueue(&mut self, queue: &str, job_id: JobId) -> Result<&mut Self> {
        require_non_empty("queue", queue)?;
        self.push(BatchOp::Enqueue {
            queue: queue.to_string(),
            job_id,
        })
    }

    /// Add 1 to `key`.
    pub fn increment_counter(&mut self, key: &str) -> Result<&mut Self> {
        self.counter(key, 1, None)
    }

    /// Add 1 to `key`; the delta expires after `expire_in`.
    pub fn increment_counter_with_expiry(
        &mut self,
        key: &str,
        expire_in: Duration,
    ) -> Result<&mut Self> {
        self.counter(key, 1, Some(expire_in))
    }

    /// Subtract 1 from `key`.
    pub fn decrement_counter(&mut self, key: &str) -> Result<&mut Self> {
        self.counter(key, -1, None)
    }

    /// Subtract 1 from `key`; the delta expires after `expire_in`.
    pub fn decrement_counter_with_expiry(
        &mut self,
        key: &str,
        expire_in: Duration,
    ) -> Result<&mut Self> {
        self.counter(key, -1, Some(expire_in))
    }

    fn counter(&mut self, key: &str, delta: i64, expire_in: Option<Duration>) -> Result<&mut Self> {
        require_non_empty("key", key)?;
        self.push(BatchOp::Counter {
            key: key.to_string(),
            delta,
            expire_in,
        })
    }

    /// Add `value` with score 0, or reset an existing member's score to 0.
    pub fn add_to_set(&mut self, key: &str, value: &str) -> Result<&mut Self> {
        self.add_to_set_with_score(key, value, 0.0)
    }

    /// Add `value` or update its score.
    pub fn add_to_set_with_score(&mut self, key: &str, value: &str, score: f64) -> Result<&mut Self> {
        require_non_empty("key", key)?;
        self.push(BatchOp::AddToSet {
            key: key.to_string(),
            value: value.to_string(),
            score,
        })
    }

    /// Add every value with score 0. Existing members keep their score.
    pub fn add_range_to_set<I, S>(&mut self, key: &str, values: I) -> Result<&mut Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        require_non_empty("key", key)?;
        self.push(BatchOp::AddRangeToSet {
            key: key.to_string(),
            values: values.into_iter().map(Into::into).collect(),
        })
    }

    /// Remove one member.
    pub fn remove_from_set(&mut self, key: &str, value: &str) -> Result<&mut Self> {
        require_non_empty("key", key)?;
        self.push(BatchOp::RemoveFromSet {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Remove every member of the set.
    pub fn remove_set(&mut self, key: &str) -> Result<&mut Self> {
        require_non_empty("key", key)?;
        self.push(BatchOp::RemoveSet {
            key: key.to_string(),
        })
    }

    /// Append `value` to the list.
    pub fn insert_to_list(&mut self, key: &str, value: &str) -> Result<&mut Self> {
        require_non_empty("key", key)?;
        self.push(BatchOp::InsertToList {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Remove every occurrence of `value`.
    pub fn remove_from_list(&mut self, key: &str, value: &str) -> Result<&mut Self> {
        require_non_empty("key", key)?;
        self.push(BatchOp::RemoveFromList {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Keep only positions `keep_from..=keep_to`, oldest first. An inverted range empties the list.
    pub fn trim_list(&mut self, key: &str, keep_from: i64, keep_to: i64) -> Result<&mut Self> {
        require_non_empty("key", key)?;
        self.push(BatchOp::TrimList {
            key: key.to_string(),
            keep_from,
            keep_to,
        })
    }

    /// Insert or overwrite hash fields.
    pub fn set_range_in_hash<I, K, V>(&mut self, key: &str, entries: I) -> Result<&mut Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        require_non_empty("key", key)?;
        self.push(BatchOp::SetRangeInHash {
            key: key.to_string(),
            entries: entries
                .into_iter()
                .map(|(field, value)| (field.into(), value.into()))
                .collect(),
        })
    }

    /// Remove every field of the hash.
    pub fn remove_hash(&mut self, key: &str) -> Result<&mut Self> {
        require_non_empty("key", key)?;
        self.push(BatchOp::RemoveHash {
            key: key.to_string(),
        })
    }

    /// Expire the whole set after `expire_in`.
    pub fn expire_set(&mut self, key: &str, expire_in: Duration) -> Result<&mut Self> {
        self.expire(Collection::Set, key, expire_in)
    }

    /// Expire the whole list after `expire_in`.
    pub fn expire_list(&mut self, key: &str, expire_in: Duration) -> Result<&mut Self> {
        self.expire(Collection::List, key, expire_in)
    }

    /// Expire the whole hash after `expire_in`.
    pub fn expire_hash(&mut self, key: &str, expire_in: Duration) -> Result<&mut Self> {
        self.expire(Collection::Hash, key, expire_in)
    }

    /// Clear the set's expiry.
    pub fn persist_set(&mut self, key: &str) -> Result<&mut Self> {
        self.persist(Collection::Set, key)
    }

    /// Clear the list's expiry.
    pub fn persist_list(&mut self, key: &str) -> Result<&mut Self> {
        self.persist(Collection::List, key)
    }

    /// Clear the hash's expiry.
    pub fn persist_hash(&mut self, key: &str) -> Result<&mut Self> {
        self.persist(Collection::Hash, key)
    }

    fn expire(&mut self, collection: Collection, key: &str, expire_in: Duration) -> Result<&mut Self> {
        require_non_empty("key", key)?;
        self.push(BatchOp::Expire {
            collection,
            key: key.to_string(),
            expire_in,
        })
    }

    fn persist(&mut self, collection: Collection, key: &str) -> Result<&mut Self> {
        require_non_empty("key", key)?;
        self.push(BatchOp::Persist {
            collection,
            key: key.to_string(),
        })
    }

    /// Replay every recorded operation in one transaction.
    ///
    /// Either all of them become visible or, on the first failure, none do and
    /// the error is returned.
    pub async fn commit(self) -> Result<()> {
        let started = Instant::now();
        let span = telemetry::commit_span(self.ops.len());
        async move {
            let result = self.apply_all().await;
            match &result {
                Ok(()) => {
                    telemetry::record_batch_committed(self.ops.len(), "committed", started);
                    for op in &self.ops {
                        if let BatchOp::Enqueue { queue, job_id } = op {
                            telemetry::record_job_enqueued(queue, job_id.get());
                        }
                    }
                }
                Err(_) => telemetry::record_batch_committed(self.ops.len(), "rolled_back", started),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn apply_all(&self) -> Result<()> {
        let mut scope = self.provider.acquire().await?;
        let mut tx = scope.begin_transaction(IsolationLevel::RepeatableRead).await?;

        let mut failure = None;
        for (index, op) in self.ops.iter().enumerate() {
            if let Err(err) = op.apply(tx.connection(), &self.schema).await {
                warn!(index, error = %err, "write batch operation failed");
                failure = Some(err);
                break;
            }
        }

        let Some(err) = failure else {
            return tx.commit().await;
        };
        if let Err(rollback_err) = tx.rollback().await {
            warn!(error = %rollback_err, "write batch rollback failed");
        }
        let err = crate::Error::from(err);
        if err.is_connection_lost() {
            scope.release();
        }
        Err(err)
    }
}

impl BatchOp {
    async fn apply(
        &self,
        conn: &mut PgConnection,
        schema: &SchemaName,
    ) -> std::result::Result<(), sqlx::Error> {
        match self {
            BatchOp::ExpireJob { job_id, expire_in } => {
                let sql = format!(
                    "UPDATE {} SET expireat = NOW() + make_interval(secs => $2) WHERE id = $1",
                    schema.table("job")
                );
                sqlx::query(&sql)
                    .bind(job_id.get())
                    .bind(expire_in.as_secs_f64())
                    .execute(conn)
                    .await?;
            }
            BatchOp::PersistJob { job_id } => {
                let sql = format!("UPDATE {} SET expireat = NULL WHERE id = $1", schema.table("job"));
                sqlx::query(&sql).bind(job_id.get()).execute(conn).await?;
            }
            BatchOp::SetJobState { job_id, state } => {
                let sql = format!(
                    r#"
                    WITH s AS (
                        INSERT INTO {state_table} (jobid, name, reason, createdat, data)
                        VALUES ($1, $2, $3, NOW(), $4)
                        RETURNING id
                    )
                    UPDATE {job_table} j
                    SET stateid = s.id, statename = $2
                    FROM s
                    WHERE j.id = $1
                    "#,
                    state_table = schema.table("state"),
                    job_table = schema.table("job"),
                );
                sqlx::query(&sql)
                    .bind(job_id.get())
                    .bind(&state.name)
                    .bind(state.reason.as_deref())
                    .bind(Json(&state.data))
                    .execute(conn)
                    .await?;
            }
            BatchOp::AddJobState { job_id, state } => {
                let sql = format!(
                    "INSERT INTO {} (jobid, name, reason, createdat, data) VALUES ($1, $2, $3, NOW(), $4)",
                    schema.table("state")
                );
                sqlx::query(&sql)
                    .bind(job_id.get())
                    .bind(&state.name)
                    .bind(state.reason.as_deref())
                    .bind(Json(&state.data))
                    .execute(conn)
                    .await?;
            }
            BatchOp::Enqueue { queue, job_id } => {
                sqlx::query(&enqueue_sql(schema))
                    .bind(job_id.get())
                    .bind(queue)
                    .execute(conn)
                    .await?;
            }
            BatchOp::Counter {
                key,
                delta,
                expire_in,
            } => {
                let sql = format!(
                    "INSERT INTO {} (key, value, expireat) VALUES ($1, $2, NOW() + make_interval(secs => $3))",
                    schema.table("counter")
                );
                sqlx::query(&sql)
                    .bind(key)
                    .bind(*delta)
                    .bind(expire_in.map(|d| d.as_secs_f64()))
                    .execute(conn)
                    .await?;
            }
            BatchOp::AddToSet { key, value, score } => {
                let sql = format!(
                    r#"
                    INSERT INTO {} (key, value, score)
                    VALUES ($1, $2, $3)
                    ON CONFLICT (key, value) DO UPDATE SET score = EXCLUDED.score
                    "#,
                    schema.table("set")
                );
                sqlx::query(&sql)
                    .bind(key)
                    .bind(value)
                    .bind(*score)
                    .execute(conn)
                    .await?;
            }
            BatchOp::AddRangeToSet { key, values } => {
                let sql = format!(
                    r#"
                    INSERT INTO {} (key, value, score)
                    SELECT $1, v, 0.0 FROM UNNEST($2::text[]) AS v
                    ON CONFLICT (key, value) DO NOTHING
                    "#,
                    schema.table("set")
                );
                sqlx::query(&sql).bind(key).bind(values).execute(conn).await?;
            }
            BatchOp::RemoveFromSet { key, value } => {
                let sql = format!("DELETE FROM {} WHERE key = $1 AND value = $2", schema.table("set"));
                sqlx::query(&sql).bind(key).bind(value).execute(conn).await?;
            }
            BatchOp::RemoveSet { key } => {
                let sql = format!("DELETE FROM {} WHERE key = $1", schema.table("set"));
                sqlx::query(&sql).bind(key).execute(conn).await?;
            }
            BatchOp::InsertToList { key, value } => {
                let sql = format!("INSERT INTO {} (key, value) VALUES ($1, $2)", schema.table("list"));
                sqlx::query(&sql).bind(key).bind(value).execute(conn).await?;
            }
            BatchOp::RemoveFromList { key, value } => {
                let sql = format!("DELETE FROM {} WHERE key = $1 AND value = $2", schema.table("list"));
                sqlx::query(&sql).bind(key).bind(value).execute(conn).await?;
            }
            BatchOp::TrimList {
                key,
                keep_from,
                keep_to,
            } => {
                let table = schema.table("list");
                let sql = format!(
                    r#"
                    DELETE FROM {table} AS source
                    WHERE source.key = $1
                      AND source.id NOT IN (
                        SELECT keep.id
                        FROM {table} AS keep
                        WHERE keep.key = $1
                        ORDER BY keep.id
                        OFFSET $2 LIMIT $3
                      )
                    "#
                );
                sqlx::query(&sql)
                    .bind(key)
                    .bind((*keep_from).max(0))
                    .bind(trim_window(*keep_from, *keep_to))
                    .execute(conn)
                    .await?;
            }
            BatchOp::SetRangeInHash { key, entries } => {
                let sql = hash_upsert_sql(schema);
                for (field, value) in entries {
                    sqlx::query(&sql)
                        .bind(key)
                        .bind(field)
                        .bind(value)
                        .execute(&mut *conn)
                        .await?;
                }
            }
            BatchOp::RemoveHash { key } => {
                let sql = format!("DELETE FROM {} WHERE key = $1", schema.table("hash"));
                sqlx::query(&sql).bind(key).execute(conn).await?;
            }
            BatchOp::Expire {
                collection,
                key,
                expire_in,
            } => {
                let sql = format!(
                    "UPDATE {} SET expireat = NOW() + make_interval(secs => $2) WHERE key = $1",
                    schema.table(collection.table())
                );
                sqlx::query(&sql)
                    .bind(key)
                    .bind(expire_in.as_secs_f64())
                    .execute(conn)
                    .await?;
            }
            BatchOp::Persist { collection, key } => {
                let sql = format!(
                    "UPDATE {} SET expireat = NULL WHERE key = $1",
                    schema.table(collection.table())
                );
                sqlx::query(&sql).bind(key).execute(conn).await?;
            }
        }
        Ok(())
    }
}

pub(crate) fn hash_upsert_sql(schema: &SchemaName) -> String {
    format!(
        r#"
        INSERT INTO {} (key, field, value)
        VALUES ($1, $2, $3)
        ON CONFLICT (key, field) DO UPDATE SET value = EXCLUDED.value
        "#,
        schema.table("hash")
    )
}

/// Row count kept by a trim; an inverted range keeps nothing.
fn trim_window(keep_from: i64, keep_to: i64) -> i64 {
    (keep_to - keep_from.max(0) + 1).max(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    fn batch() -> WriteBatch {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/harbor")
            .unwrap();
        WriteBatch::new(
            ConnectionProvider::pooled(pool),
            SchemaName::new("harbor").unwrap(),
        )
    }

    #[tokio::test]
    async fn operations_are_recorded_in_order() {
        let mut batch = batch();
        batch
            .set_job_state(JobId(1), StateData::new("Succeeded"))
            .unwrap()
            .increment_counter("stats:succeeded")
            .unwrap()
            .add_to_set_with_score("schedule", "1", 12.5)
            .unwrap()
            .enqueue("default", JobId(1))
            .unwrap();

        assert_eq!(batch.len(), 4);
        assert!(matches!(batch.ops()[0], BatchOp::SetJobState { .. }));
        assert_eq!(
            batch.ops()[1],
            BatchOp::Counter {
                key: "stats:succeeded".into(),
                delta: 1,
                expire_in: None
            }
        );
        assert!(matches!(batch.ops()[3], BatchOp::Enqueue { .. }));
    }

    #[tokio::test]
    async fn empty_keys_are_rejected_before_queueing() {
        let mut batch = batch();
        assert!(matches!(
            batch.increment_counter(""),
            Err(Error::Validation { argument: "key", .. })
        ));
        assert!(batch.enqueue("", JobId(3)).is_err());
        assert!(batch.set_job_state(JobId(3), StateData::default()).is_err());
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn expiry_variants_carry_their_collection() {
        let mut batch = batch();
        batch.expire_list("recent", Duration::from_secs(60)).unwrap();
        batch.persist_hash("recurring-job:a").unwrap();
        batch
            .decrement_counter_with_expiry("stats:deleted", Duration::from_secs(5))
            .unwrap();

        assert_eq!(
            batch.ops()[0],
            BatchOp::Expire {
                collection: Collection::List,
                key: "recent".into(),
                expire_in: Duration::from_secs(60)
            }
        );
        assert_eq!(
            batch.ops()[1],
            BatchOp::Persist {
                collection: Collection::Hash,
                key: "recurring-job:a".into()
            }
        );
        assert!(matches!(
            batch.ops()[2],
            BatchOp::Counter { delta: -1, expire_in: Some(_), .. }
        ));
    }

    #[test]
    fn trim_window_clamps() {
        assert_eq!(trim_window(0, 2), 3);
        assert_eq!(trim_window(1, 1), 1);
        assert_eq!(trim_window(3, 1), 0);
        assert_eq!(trim_window(-2, 1), 2);
    }
}
