use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use tracing::info;

use super::StorageConnection;
use crate::error::{Error, Result, require_non_empty};

/// What a processing server reports about itself when it starts.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerContext {
    /// Number of concurrent workers.
    pub worker_count: i32,
    /// Queues the server consumes, in priority order.
    pub queues: Vec<String>,
}

/// Metadata stored in the `server` row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerData {
    /// Number of concurrent workers.
    pub worker_count: i32,
    /// Queues the server consumes.
    pub queues: Vec<String>,
    /// When the server announced itself.
    pub started_at: DateTime<Utc>,
}

impl StorageConnection {
    /// Register `server_id`, or refresh its metadata and heartbeat if already known.
    pub async fn announce_server(&self, server_id: &str, context: &ServerContext) -> Result<()> {
        require_non_empty("server_id", server_id)?;
        let data = ServerData {
            worker_count: context.worker_count,
            queues: context.queues.clone(),
            started_at: Utc::now(),
        };
        let sql = format!(
            r#"
            INSERT INTO {} (id, data, lastheartbeat)
            VALUES ($1, $2, NOW())
            ON CONFLICT (id) DO UPDATE
            SET data = EXCLUDED.data, lastheartbeat = EXCLUDED.lastheartbeat
            "#,
            self.schema.table("server")
        );
        let mut scope = self.provider.acquire().await?;
        let done = sqlx::query(&sql)
            .bind(server_id)
            .bind(Json(&data))
            .execute(scope.connection()?)
            .await;
        scope.observe(done)?;
        info!(server_id, workers = data.worker_count, "server announced");
        Ok(())
    }

    /// Stored metadata for `server_id`.
    pub async fn get_server(&self, server_id: &str) -> Result<Option<ServerData>> {
        require_non_empty("server_id", server_id)?;
        let sql = format!("SELECT data FROM {} WHERE id = $1", self.schema.table("server"));
        let mut scope = self.provider.acquire().await?;
        let data = sqlx::query_scalar::<_, Json<ServerData>>(&sql)
            .bind(server_id)
            .fetch_optional(scope.connection()?)
            .await;
        Ok(scope.observe(data)?.map(|d| d.0))
    }

    /// Refresh the heartbeat of a known server.
    pub async fn heartbeat(&self, server_id: &str) -> Result<()> {
        require_non_empty("server_id", server_id)?;
        let sql = format!(
            "UPDATE {} SET lastheartbeat = NOW() WHERE id = $1",
            self.schema.table("server")
        );
        let mut scope = self.provider.acquire().await?;
        let done = sqlx::query(&sql)
            .bind(server_id)
            .execute(scope.connection()?)
            .await;
        scope.observe(done)?;
        Ok(())
    }

    /// Forget `server_id`.
    pub async fn remove_server(&self, server_id: &str) -> Result<()> {
        require_non_empty("server_id", server_id)?;
        let sql = format!("DELETE FROM {} WHERE id = $1", self.schema.table("server"));
        let mut scope = self.provider.acquire().await?;
        let done = sqlx::query(&sql)
            .bind(server_id)
            .execute(scope.connection()?)
            .await;
        scope.observe(done)?;
        Ok(())
    }

    /// Delete servers whose last heartbeat is older than `timeout`; returns how many.
    pub async fn remove_timed_out_servers(&self, timeout: Duration) -> Result<u64> {
        if timeout.is_zero() {
            return Err(Error::validation("timeout", "must be positive"));
        }
        let sql = format!(
            "DELETE FROM {} WHERE lastheartbeat < NOW() - make_interval(secs => $1)",
            self.schema.table("server")
        );
        let mut scope = self.provider.acquire().await?;
        let done = sqlx::query(&sql)
            .bind(timeout.as_secs_f64())
            .execute(scope.connection()?)
            .await;
        let removed = scope.observe(done)?.rows_affected();
        if removed > 0 {
            info!(removed, "timed out servers removed");
        }
        Ok(removed)
    }
}
