//! Schema namespace handling and the fleet-safe initializer.

use std::fmt;

use sqlx::Executor;
use tracing::{Instrument, debug, info, warn};

use crate::connection::{ConnectionProvider, IsolationLevel, ScopedConnection};
use crate::error::{Error, Result};
use crate::telemetry;

/// Embedded, versioned migration scripts.
pub mod migrations;

pub use migrations::Migration;

/// Advisory lock key every initializer contends on.
pub const SCHEMA_LOCK_KEY: i64 = 12345;

/// Version assumed when no version can be read.
pub const BASELINE_VERSION: i32 = 1;

/// A validated schema namespace, rendered for SQL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchemaName {
    name: String,
    quoted: String,
}

impl SchemaName {
    /// Validate `name` as a plain identifier.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if !is_plain_identifier(&name) {
            return Err(Error::validation(
                "schema_name",
                format!(
                    "`{name}` must be a non-empty identifier of letters, digits and underscores"
                ),
            ));
        }
        let quoted = format!("\"{name}\"");
        Ok(Self { name, quoted })
    }

    /// Bare namespace name.
    pub fn as_str(&self) -> &str {
        &self.name
    }

    /// Quoted namespace, e.g. `"harbor"`.
    pub fn quoted(&self) -> &str {
        &self.quoted
    }

    /// Schema-qualified, quoted table name.
    pub fn table(&self, table: &str) -> String {
        format!("{}.\"{}\"", self.quoted, table)
    }
}

impl fmt::Display for SchemaName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

pub(crate) fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    name.len() <= 63 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// What a call to [`SchemaInitializer::initialize`] did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitOutcome {
    /// Another session holds the initialization lock; nothing was done.
    Skipped,
    /// Schema was already at the latest version.
    UpToDate {
        /// Installed version.
        version: i32,
    },
    /// Pending migrations were applied.
    Migrated {
        /// Version before.
        from: i32,
        /// Version after.
        to: i32,
    },
}

/// Applies embedded migrations once across every process sharing the database.
#[derive(Clone, Debug)]
pub struct SchemaInitializer {
    provider: ConnectionProvider,
    schema: SchemaName,
}

impl SchemaInitializer {
    /// Create an initializer for `schema`.
    pub fn new(provider: ConnectionProvider, schema: SchemaName) -> Self {
        Self { provider, schema }
    }

    /// Bring the schema up to date unless another session is already doing it.
    pub async fn initialize(&self) -> Result<InitOutcome> {
        let span = telemetry::migrate_span(self.schema.as_str());
        async {
            info!("installing storage schema objects");
            let mut scope = self.provider.acquire().await?;

            if !try_lock(&mut scope).await? {
                info!("schema initialization skipped: lock held by another session");
                return Ok(InitOutcome::Skipped);
            }

            let outcome = self.migrate_locked(&mut scope).await;

            // The session lock must go even when migrating failed.
            if let Err(err) = unlock(&mut scope).await {
                warn!(error = %err, "failed to release schema initialization lock");
            }

            let outcome = outcome?;
            telemetry::record_schema_initialized(self.schema.as_str(), &outcome);
            Ok(outcome)
        }
        .instrument(span)
        .await
    }

    async fn migrate_locked(&self, scope: &mut ScopedConnection) -> Result<InitOutcome> {
        self.ensure_namespace(scope).await?;
        let installed = self.installed_version(scope).await?;
        let pending = migrations::pending(installed);

        let Some(last) = pending.last().map(|m| m.version) else {
            debug!(version = installed, "schema is up to date");
            return Ok(InitOutcome::UpToDate { version: installed });
        };

        let mut tx = scope.begin_transaction(IsolationLevel::Serializable).await?;

        let previous_path: String =
            sqlx::query_scalar("SELECT current_setting('search_path')")
                .fetch_one(tx.connection())
                .await?;
        sqlx::query("SELECT set_config('search_path', $1, true)")
            .bind(self.schema.quoted())
            .execute(tx.connection())
            .await?;

        for migration in &pending {
            info!(version = migration.version, "applying schema migration");
            // A bare `&str` runs over the simple protocol, which allows several statements.
            tx.connection()
                .execute(migration.script)
                .await
                .map_err(|source| Error::Migration {
                    version: migration.version,
                    source,
                })?;
        }

        store_version(tx.connection(), last)
            .await
            .map_err(|source| Error::Migration {
                version: last,
                source,
            })?;

        sqlx::query("SELECT set_config('search_path', $1, true)")
            .bind(&previous_path)
            .execute(tx.connection())
            .await?;

        tx.commit().await?;
        info!(from = installed, to = last, "schema migrated");
        Ok(InitOutcome::Migrated {
            from: installed,
            to: last,
        })
    }

    async fn ensure_namespace(&self, scope: &mut ScopedConnection) -> Result<()> {
        let sql = format!("CREATE SCHEMA IF NOT EXISTS {}", self.schema.quoted());
        let mut attempt = scope.begin_transaction(IsolationLevel::ReadCommitted).await?;
        match sqlx::query(&sql).execute(attempt.connection()).await {
            Ok(_) => attempt.commit().await,
            Err(err) => {
                // A concurrent creator raced us; the namespace exists either way.
                debug!(error = %err, "schema namespace already present");
                attempt.rollback().await
            }
        }
    }

    async fn installed_version(&self, scope: &mut ScopedConnection) -> Result<i32> {
        let sql = format!("SELECT version FROM {} LIMIT 1", self.schema.table("schema"));
        let mut attempt = scope.begin_transaction(IsolationLevel::ReadCommitted).await?;
        let read: std::result::Result<Option<i32>, sqlx::Error> =
            sqlx::query_scalar(&sql).fetch_optional(attempt.connection()).await;
        match read {
            Ok(version) => {
                attempt.commit().await?;
                Ok(version.unwrap_or(BASELINE_VERSION))
            }
            Err(err) => {
                debug!(error = %err, "version table unreadable; assuming baseline");
                attempt.rollback().await?;
                Ok(BASELINE_VERSION)
            }
        }
    }
}

async fn try_lock(scope: &mut ScopedConnection) -> Result<bool> {
    let taken = sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_lock($1)")
        .bind(SCHEMA_LOCK_KEY)
        .fetch_one(scope.connection()?)
        .await;
    scope.observe(taken)
}

async fn unlock(scope: &mut ScopedConnection) -> Result<()> {
    let released = sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
        .bind(SCHEMA_LOCK_KEY)
        .fetch_one(scope.connection()?)
        .await;
    if !scope.observe(released)? {
        warn!("schema initialization lock was not held at release");
    }
    Ok(())
}

async fn store_version(
    conn: &mut sqlx::PgConnection,
    version: i32,
) -> std::result::Result<(), sqlx::Error> {
    let updated = sqlx::query("UPDATE \"schema\" SET version = $1")
        .bind(version)
        .execute(&mut *conn)
        .await?;
    if updated.rows_affected() == 0 {
        sqlx::query("INSERT INTO \"schema\" (version) VALUES ($1)")
            .bind(version)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}
