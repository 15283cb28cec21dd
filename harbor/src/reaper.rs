use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{Instrument, info, warn};

use crate::cancel::CancelToken;
use crate::config::StorageOptions;
use crate::connection::ConnectionProvider;
use crate::error::{Error, Result};
use crate::schema::SchemaName;
use crate::telemetry;

/// Periodically deletes `lock` rows older than the reap timeout.
///
/// This only cleans up after crashed holders; it does not make a lock safe to
/// hold past the timeout.
#[derive(Clone, Debug)]
pub struct ExpiredLockReaper {
    provider: ConnectionProvider,
    schema: SchemaName,
    timeout: Duration,
    interval: Duration,
}

impl ExpiredLockReaper {
    /// Reaper using the schema and lock reap timeout in `options`. Sweeps once per timeout.
    pub fn new(provider: ConnectionProvider, options: &StorageOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            provider,
            schema: options.schema()?,
            timeout: options.lock_reap_timeout(),
            interval: options.lock_reap_timeout(),
        })
    }

    /// Sweep every `interval` instead of once per timeout.
    pub fn with_interval(mut self, interval: Duration) -> Result<Self> {
        if interval.is_zero() {
            return Err(Error::validation("interval", "must be positive"));
        }
        self.interval = interval;
        Ok(self)
    }

    /// Delete every expired lock row once; returns how many were removed.
    pub async fn reap_once(&self) -> Result<u64> {
        let sql = format!(
            "DELETE FROM {} WHERE acquired < NOW() - make_interval(secs => $1)",
            self.schema.table("lock")
        );
        async {
            let mut scope = self.provider.acquire().await?;
            let done = sqlx::query(&sql)
                .bind(self.timeout.as_secs_f64())
                .execute(scope.connection()?)
                .await;
            let removed = scope.observe(done)?.rows_affected();
            telemetry::record_locks_reaped(self.schema.as_str(), removed);
            Ok(removed)
        }
        .instrument(telemetry::reap_span(self.schema.as_str()))
        .await
    }

    /// Sweep, then wait for the next interval, until `cancel` fires.
    pub async fn run(&self, cancel: CancelToken) {
        info!(
            schema = %self.schema,
            interval_ms = self.interval.as_millis() as u64,
            "expired lock reaper started"
        );
        loop {
            if let Err(err) = self.reap_once().await {
                warn!(error = %err, "expired lock sweep failed");
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("expired lock reaper shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }

    /// Run the reaper on its own task.
    pub fn spawn(self, cancel: CancelToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }
}
