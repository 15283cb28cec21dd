use std::fmt;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::connection::ConnectionProvider;
use crate::error::{Error, Result, require_non_empty};
use crate::schema::SchemaName;

const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_millis(500);

/// A named lock backed by a row in the `lock` table.
///
/// The row is the lock: whoever inserted it holds it until it is deleted by
/// [`release`](Self::release), by drop, or by the expired-lock reaper. A holder
/// must stop relying on the lock once the reap timeout has passed.
pub struct DistributedLock {
    resource: String,
    provider: ConnectionProvider,
    schema: SchemaName,
    held: bool,
}

impl fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedLock")
            .field("resource", &self.resource)
            .field("held", &self.held)
            .finish()
    }
}

impl DistributedLock {
    /// Take the lock on `resource`, retrying until `timeout` has elapsed.
    ///
    /// Fails with [`Error::LockUnavailable`] if another owner still holds it by then.
    pub async fn acquire(
        provider: ConnectionProvider,
        schema: SchemaName,
        resource: &str,
        timeout: Duration,
    ) -> Result<Self> {
        require_non_empty("resource", resource)?;
        let sql = format!(
            "INSERT INTO {} (resource, acquired) VALUES ($1, NOW()) ON CONFLICT (resource) DO NOTHING",
            schema.table("lock")
        );
        let started = Instant::now();
        let mut backoff = INITIAL_BACKOFF;

        loop {
            let inserted = {
                let mut scope = provider.acquire().await?;
                let done = sqlx::query(&sql)
                    .bind(resource)
                    .execute(scope.connection()?)
                    .await;
                scope.observe(done)?.rows_affected()
            };
            if inserted == 1 {
                debug!(resource, "distributed lock acquired");
                return Ok(Self {
                    resource: resource.to_string(),
                    provider,
                    schema,
                    held: true,
                });
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Err(Error::LockUnavailable(resource.to_string()));
            }
            tokio::time::sleep(backoff.min(timeout - elapsed)).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    /// Locked resource name.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Delete the lock row.
    ///
    /// Fails with [`Error::DistributedLock`] if the row is already gone, which
    /// means the lock was reaped or removed while this handle believed it held it.
    pub async fn release(mut self) -> Result<()> {
        self.held = false;
        let removed = delete_row(&self.provider, &self.schema, &self.resource).await?;
        if removed == 0 {
            return Err(Error::DistributedLock(format!(
                "lock on `{}` was no longer held at release",
                self.resource
            )));
        }
        debug!(resource = %self.resource, "distributed lock released");
        Ok(())
    }
}

async fn delete_row(provider: &ConnectionProvider, schema: &SchemaName, resource: &str) -> Result<u64> {
    let sql = format!("DELETE FROM {} WHERE resource = $1", schema.table("lock"));
    let mut scope = provider.acquire().await?;
    let done = sqlx::query(&sql)
        .bind(resource)
        .execute(scope.connection()?)
        .await;
    Ok(scope.observe(done)?.rows_affected())
}

impl Drop for DistributedLock {
    fn drop(&mut self) {
        if !self.held {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(resource = %self.resource, "lock dropped outside a runtime; left for the reaper");
            return;
        };
        let provider = self.provider.clone();
        let schema = self.schema.clone();
        let resource = std::mem::take(&mut self.resource);
        runtime.spawn(async move {
            if let Err(err) = delete_row(&provider, &schema, &resource).await {
                warn!(resource = %resource, error = %err, "failed to release dropped lock");
            }
        });
    }
}
