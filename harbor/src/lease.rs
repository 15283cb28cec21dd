use std::fmt;

use async_trait::async_trait;
use tracing::{Instrument, warn};

use crate::connection::ConnectionProvider;
use crate::error::Result;
use crate::job::JobId;
use crate::queue::{ClaimedEntry, QueueLease};
use crate::schema::SchemaName;
use crate::telemetry;

/// Where a lease is in its life.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LeaseState {
    /// Claimed and not yet settled.
    Leased,
    /// Entry deleted; terminal.
    Confirmed,
    /// Entry made visible again; terminal.
    Abandoned,
}

#[derive(Clone, Copy, Debug)]
enum Settle {
    Confirm,
    Abandon,
}

impl Settle {
    fn action(self) -> &'static str {
        match self {
            Settle::Confirm => "confirm",
            Settle::Abandon => "abandon",
        }
    }

    fn sql(self, schema: &SchemaName) -> String {
        let table = schema.table("jobqueue");
        match self {
            Settle::Confirm => format!("DELETE FROM {table} WHERE id = $1"),
            Settle::Abandon => format!("UPDATE {table} SET fetchedat = NULL WHERE id = $1"),
        }
    }
}

/// A claimed queue entry.
///
/// Settle it with [`confirm`](Self::confirm) once the job is done, or
/// [`abandon`](Self::abandon) to hand it back. A handle dropped while still
/// [`LeaseState::Leased`] abandons the entry in the background.
pub struct LeaseHandle {
    entry_id: i64,
    job_id: JobId,
    queue: String,
    provider: ConnectionProvider,
    schema: SchemaName,
    state: LeaseState,
}

impl fmt::Debug for LeaseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseHandle")
            .field("entry_id", &self.entry_id)
            .field("job_id", &self.job_id)
            .field("queue", &self.queue)
            .field("state", &self.state)
            .finish()
    }
}

impl LeaseHandle {
    pub(crate) fn new(entry: ClaimedEntry, provider: ConnectionProvider, schema: SchemaName) -> Self {
        Self {
            entry_id: entry.id,
            job_id: entry.job_id,
            queue: entry.queue,
            provider,
            schema,
            state: LeaseState::Leased,
        }
    }

    /// Id of the claimed `jobqueue` row.
    pub fn entry_id(&self) -> i64 {
        self.entry_id
    }

    /// Job the entry points at.
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Queue the entry was claimed from.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Current state.
    pub fn state(&self) -> LeaseState {
        self.state
    }

    /// Delete the entry. Does nothing once the lease is settled.
    pub async fn confirm(&mut self) -> Result<()> {
        self.settle(Settle::Confirm).await
    }

    /// Clear the fetch mark so the entry can be claimed again right away.
    /// Does nothing once the lease is settled.
    pub async fn abandon(&mut self) -> Result<()> {
        self.settle(Settle::Abandon).await
    }

    /// End the lease, abandoning it if it is still held. Failures are logged.
    pub async fn release(mut self) {
        if let Err(err) = self.abandon().await {
            warn!(
                entry_id = self.entry_id,
                job_id = %self.job_id,
                error = %err,
                "failed to requeue released lease; invisibility timeout will recover it"
            );
            // Nothing more the drop hook could do.
            self.state = LeaseState::Abandoned;
        }
    }

    async fn settle(&mut self, how: Settle) -> Result<()> {
        if self.state != LeaseState::Leased {
            return Ok(());
        }
        let span = telemetry::lease_span(self.entry_id, self.job_id.get(), &self.queue, how.action());
        settle_entry(&self.provider, &self.schema, self.entry_id, how)
            .instrument(span)
            .await?;
        self.state = match how {
            Settle::Confirm => LeaseState::Confirmed,
            Settle::Abandon => LeaseState::Abandoned,
        };
        telemetry::record_lease_released(
            &self.queue,
            match how {
                Settle::Confirm => "confirmed",
                Settle::Abandon => "abandoned",
            },
        );
        Ok(())
    }
}

async fn settle_entry(
    provider: &ConnectionProvider,
    schema: &SchemaName,
    entry_id: i64,
    how: Settle,
) -> Result<()> {
    let sql = how.sql(schema);
    let mut scope = provider.acquire().await?;
    let done = sqlx::query(&sql)
        .bind(entry_id)
        .execute(scope.connection()?)
        .await;
    scope.observe(done)?;
    Ok(())
}

#[async_trait]
impl QueueLease for LeaseHandle {
    fn job_id(&self) -> JobId {
        self.job_id
    }

    fn queue(&self) -> &str {
        &self.queue
    }

    async fn confirm(&mut self) -> Result<()> {
        LeaseHandle::confirm(self).await
    }

    async fn abandon(&mut self) -> Result<()> {
        LeaseHandle::abandon(self).await
    }
}

impl Drop for LeaseHandle {
    fn drop(&mut self) {
        if self.state != LeaseState::Leased {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                entry_id = self.entry_id,
                job_id = %self.job_id,
                "lease dropped outside a runtime; entry stays invisible until the timeout"
            );
            return;
        };

        let provider = self.provider.clone();
        let schema = self.schema.clone();
        let entry_id = self.entry_id;
        let job_id = self.job_id;
        let queue = std::mem::take(&mut self.queue);
        let span = telemetry::lease_span(entry_id, job_id.get(), &queue, "drop");
        runtime.spawn(
            async move {
                match settle_entry(&provider, &schema, entry_id, Settle::Abandon).await {
                    Ok(()) => telemetry::record_lease_released(&queue, "dropped"),
                    Err(err) => warn!(
                        entry_id,
                        job_id = %job_id,
                        error = %err,
                        "failed to requeue dropped lease"
                    ),
                }
            }
            .instrument(span),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settle_statements() {
        let schema = SchemaName::new("harbor").unwrap();
        assert_eq!(
            Settle::Confirm.sql(&schema),
            "DELETE FROM \"harbor\".\"jobqueue\" WHERE id = $1"
        );
        assert_eq!(
            Settle::Abandon.sql(&schema),
            "UPDATE \"harbor\".\"jobqueue\" SET fetchedat = NULL WHERE id = $1"
        );
    }
}
