//! Throw-away Postgres schemas for harbor integration tests.
//!
//! Every [`TestDatabase`] lives in its own freshly migrated schema, so tests
//! can run in parallel against one database and never see each other's rows.

use std::time::Duration;

use anyhow::Context;
use harbor::{
    ConnectionProvider, InitOutcome, SchemaInitializer, SchemaName, StorageConnection,
    StorageOptions,
};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

/// A migrated schema private to one test.
#[derive(Clone, Debug)]
pub struct TestDatabase {
    pool: PgPool,
    schema: SchemaName,
}

impl TestDatabase {
    /// Connect through `DATABASE_URL` and migrate a fresh schema.
    ///
    /// Returns `Ok(None)` when `DATABASE_URL` is not set so callers can skip.
    pub async fn connect() -> anyhow::Result<Option<Self>> {
        init_tracing();
        let Ok(url) = std::env::var("DATABASE_URL") else {
            tracing::warn!("DATABASE_URL not set; skipping database test");
            return Ok(None);
        };
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(&url)
            .await
            .context("connect to DATABASE_URL")?;
        let db = Self::create(pool).await?;
        Ok(Some(db))
    }

    /// Migrate a fresh schema on an existing pool.
    pub async fn create(pool: PgPool) -> anyhow::Result<Self> {
        let name = format!("harbor_test_{}", Uuid::new_v4().simple());
        let schema = SchemaName::new(name)?;
        let initializer =
            SchemaInitializer::new(ConnectionProvider::pooled(pool.clone()), schema.clone());

        // The advisory lock is shared by every schema; wait out other tests.
        for _ in 0..200 {
            match initializer.initialize().await? {
                InitOutcome::Skipped => tokio::time::sleep(Duration::from_millis(50)).await,
                _ => return Ok(Self { pool, schema }),
            }
        }
        anyhow::bail!("schema initialization lock stayed busy")
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn schema(&self) -> &SchemaName {
        &self.schema
    }

    pub fn provider(&self) -> ConnectionProvider {
        ConnectionProvider::pooled(self.pool.clone())
    }

    /// Options pointing at this schema, with short timings for tests.
    pub fn options(&self) -> StorageOptions {
        StorageOptions::default()
            .with_schema_name(self.schema.as_str())
            .with_queue_poll_interval(Duration::from_millis(50))
            .with_prepare_schema(false)
    }

    pub fn connection(&self) -> anyhow::Result<StorageConnection> {
        Ok(StorageConnection::new(self.provider(), &self.options())?)
    }

    /// Insert a bare job row and return its id.
    pub async fn insert_job(&self) -> anyhow::Result<i64> {
        let sql = format!(
            "INSERT INTO {} (invocationdata, arguments, createdat) VALUES ($1, $2, NOW()) RETURNING id",
            self.schema.table("job")
        );
        let id = sqlx::query_scalar(&sql)
            .bind(serde_json::json!({"type": "Test", "method": "Run"}))
            .bind(serde_json::json!([]))
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }

    /// Insert a queue entry, optionally already fetched `fetched_ago` in the past.
    pub async fn insert_queue_entry(
        &self,
        job_id: i64,
        queue: &str,
        fetched_ago: Option<Duration>,
    ) -> anyhow::Result<i64> {
        let sql = format!(
            r#"
            INSERT INTO {} (jobid, queue, fetchedat)
            VALUES ($1, $2, NOW() - make_interval(secs => $3))
            RETURNING id
            "#,
            self.schema.table("jobqueue")
        );
        let id = sqlx::query_scalar(&sql)
            .bind(job_id)
            .bind(queue)
            .bind(fetched_ago.map(|d| d.as_secs_f64()))
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }

    /// `fetchedat` of a queue entry; `None` inside means not fetched.
    pub async fn fetched_at(
        &self,
        entry_id: i64,
    ) -> anyhow::Result<Option<Option<chrono::DateTime<chrono::Utc>>>> {
        let sql = format!(
            "SELECT fetchedat FROM {} WHERE id = $1",
            self.schema.table("jobqueue")
        );
        Ok(sqlx::query_scalar(&sql)
            .bind(entry_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// Insert a lock row acquired `age` ago.
    pub async fn insert_lock(&self, resource: &str, age: Duration) -> anyhow::Result<()> {
        let sql = format!(
            "INSERT INTO {} (resource, acquired) VALUES ($1, NOW() - make_interval(secs => $2))",
            self.schema.table("lock")
        );
        sqlx::query(&sql)
            .bind(resource)
            .bind(age.as_secs_f64())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Row count of `table` in this schema.
    pub async fn count(&self, table: &str) -> anyhow::Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM {}", self.schema.table(table));
        Ok(sqlx::query_scalar(&sql).fetch_one(&self.pool).await?)
    }

    /// Stored schema version.
    pub async fn version(&self) -> anyhow::Result<i32> {
        let sql = format!("SELECT version FROM {}", self.schema.table("schema"));
        Ok(sqlx::query_scalar(&sql).fetch_one(&self.pool).await?)
    }

    /// Drop the schema and everything in it.
    pub async fn cleanup(self) -> anyhow::Result<()> {
        let sql = format!("DROP SCHEMA IF EXISTS {} CASCADE", self.schema.quoted());
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }
}

/// Install a test subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
