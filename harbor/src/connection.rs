//! Connection and transaction scopes.
//!
//! A [`ConnectionProvider`] hands out [`ScopedConnection`]s. The provider is
//! either backed by a pool, in which case every scope owns its connection and
//! its transactions, or by a caller-supplied transaction, in which case scopes
//! borrow that transaction and nest their own work inside savepoints.

use std::fmt;
use std::sync::Arc;

use sqlx::pool::PoolConnection;
use sqlx::{Connection, PgConnection, PgPool, Postgres, Transaction};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::error::{Error, Result};

/// Transaction isolation level requested for an owned transaction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IsolationLevel {
    /// `READ COMMITTED`
    ReadCommitted,
    /// `REPEATABLE READ`
    RepeatableRead,
    /// `SERIALIZABLE`
    Serializable,
}

impl IsolationLevel {
    fn set_statement(self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => {
                "SET TRANSACTION ISOLATION LEVEL READ COMMITTED"
            }
            IsolationLevel::RepeatableRead => {
                "SET TRANSACTION ISOLATION LEVEL REPEATABLE READ"
            }
            IsolationLevel::Serializable => {
                "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE"
            }
        }
    }
}

/// A caller-owned transaction that storage operations join instead of opening their own.
///
/// Clones share the same transaction; only one scope uses it at a time.
#[derive(Clone)]
pub struct AmbientTransaction {
    inner: Arc<Mutex<Option<Transaction<'static, Postgres>>>>,
}

impl AmbientTransaction {
    /// Wrap a transaction the caller began and will commit itself.
    pub fn new(transaction: Transaction<'static, Postgres>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(transaction))),
        }
    }

    /// Take the transaction back so the caller can commit or roll it back.
    ///
    /// Every clone sees [`Error::ResourceReleased`] afterwards.
    pub async fn into_inner(self) -> Result<Transaction<'static, Postgres>> {
        self.inner
            .lock()
            .await
            .take()
            .ok_or(Error::ResourceReleased("ambient transaction"))
    }
}

impl fmt::Debug for AmbientTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmbientTransaction")
            .field("in_use", &self.inner.try_lock().is_err())
            .finish()
    }
}

/// Source of connections for every storage operation.
#[derive(Clone, Debug)]
pub enum ConnectionProvider {
    /// Each scope checks a connection out of the pool and owns its transactions.
    Pooled(PgPool),
    /// Each scope joins the caller's transaction and nests work in savepoints.
    Ambient(AmbientTransaction),
}

impl ConnectionProvider {
    /// Provider that checks connections out of `pool`.
    pub fn pooled(pool: PgPool) -> Self {
        Self::Pooled(pool)
    }

    /// Provider that joins `transaction`.
    pub fn ambient(transaction: AmbientTransaction) -> Self {
        Self::Ambient(transaction)
    }

    /// Whether scopes from this provider run inside a caller-managed transaction.
    pub fn is_ambient(&self) -> bool {
        matches!(self, Self::Ambient(_))
    }

    /// Acquire a connection scope. The connection goes back when the scope is released or dropped.
    pub async fn acquire(&self) -> Result<ScopedConnection> {
        match self {
            Self::Pooled(pool) => {
                if pool.is_closed() {
                    return Err(Error::ResourceReleased("connection pool"));
                }
                let conn = pool.acquire().await?;
                Ok(ScopedConnection {
                    held: Some(Held::Pooled(conn)),
                    pool: Some(pool.clone()),
                })
            }
            Self::Ambient(ambient) => {
                let guard = Arc::clone(&ambient.inner).lock_owned().await;
                if guard.is_none() {
                    return Err(Error::ResourceReleased("ambient transaction"));
                }
                Ok(ScopedConnection {
                    held: Some(Held::Ambient(guard)),
                    pool: None,
                })
            }
        }
    }
}

enum Held {
    Pooled(PoolConnection<Postgres>),
    Ambient(OwnedMutexGuard<Option<Transaction<'static, Postgres>>>),
}

/// A connection checked out for the duration of one storage operation.
pub struct ScopedConnection {
    held: Option<Held>,
    pool: Option<PgPool>,
}

impl fmt::Debug for ScopedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.held {
            None => "released",
            Some(Held::Pooled(_)) => "pooled",
            Some(Held::Ambient(_)) => "ambient",
        };
        f.debug_struct("ScopedConnection")
            .field("state", &state)
            .finish()
    }
}

impl ScopedConnection {
    /// Whether this scope borrows a caller-managed transaction.
    pub fn is_ambient(&self) -> bool {
        matches!(self.held, Some(Held::Ambient(_)))
    }

    /// Whether the scope has ended.
    pub fn is_released(&self) -> bool {
        self.held.is_none()
    }

    /// The underlying connection.
    ///
    /// Fails with [`Error::ResourceReleased`] once the scope has ended, including
    /// when the pool behind it has been closed since the scope was acquired.
    pub fn connection(&mut self) -> Result<&mut PgConnection> {
        if self.pool.as_ref().is_some_and(|pool| pool.is_closed()) {
            self.mark_lost();
        }
        match self.held.as_mut() {
            None => Err(Error::ResourceReleased("connection")),
            Some(Held::Pooled(conn)) => Ok(&mut **conn),
            Some(Held::Ambient(guard)) => {
                let slot: &mut Option<Transaction<'static, Postgres>> = &mut **guard;
                match slot.as_mut() {
                    Some(tx) => Ok(&mut **tx),
                    None => Err(Error::ResourceReleased("ambient transaction")),
                }
            }
        }
    }

    /// Convert a driver result, ending the scope if it shows the connection is gone.
    pub fn observe<T>(&mut self, result: std::result::Result<T, sqlx::Error>) -> Result<T> {
        result.map_err(|err| {
            let err = Error::from(err);
            if err.is_connection_lost() {
                self.mark_lost();
            }
            err
        })
    }

    /// Start a transaction scope on this connection.
    ///
    /// On a pooled connection this begins a real transaction at `isolation`.
    /// Inside an ambient transaction it opens a savepoint instead; `isolation`
    /// is then inherited from the caller's transaction.
    pub async fn begin_transaction(
        &mut self,
        isolation: IsolationLevel,
    ) -> Result<ScopedTransaction<'_>> {
        let mode = if self.is_ambient() {
            TransactionMode::Savepoint
        } else {
            TransactionMode::Owned
        };
        let conn = self.connection()?;
        let mut tx = conn.begin().await?;
        if mode == TransactionMode::Owned {
            sqlx::query(isolation.set_statement())
                .execute(&mut *tx)
                .await?;
        }
        debug!(?mode, ?isolation, "transaction scope started");
        Ok(ScopedTransaction { tx, mode })
    }

    /// End the scope, returning the connection. Repeated calls do nothing.
    pub fn release(&mut self) {
        self.held = None;
    }

    fn mark_lost(&mut self) {
        if self.held.take().is_some() {
            debug!("connection lost; scope released");
        }
    }
}

/// How a [`ScopedTransaction`] maps onto the database.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransactionMode {
    /// A transaction this scope began and will commit or roll back.
    Owned,
    /// A savepoint inside a caller-managed transaction; commit releases it.
    Savepoint,
}

/// A transaction or savepoint bound to a [`ScopedConnection`].
///
/// Dropping it without [`commit`](Self::commit) rolls back everything done
/// through it, and only that.
pub struct ScopedTransaction<'c> {
    tx: Transaction<'c, Postgres>,
    mode: TransactionMode,
}

impl fmt::Debug for ScopedTransaction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedTransaction")
            .field("mode", &self.mode)
            .finish()
    }
}

impl ScopedTransaction<'_> {
    /// Whether this is a real transaction or a savepoint.
    pub fn mode(&self) -> TransactionMode {
        self.mode
    }

    /// Connection to run statements on inside this scope.
    pub fn connection(&mut self) -> &mut PgConnection {
        &mut self.tx
    }

    /// Commit an owned transaction, or release the savepoint.
    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    /// Roll back an owned transaction, or roll back to the savepoint.
    pub async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn isolation_statements() {
        assert_eq!(
            IsolationLevel::Serializable.set_statement(),
            "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE"
        );
        assert_eq!(
            IsolationLevel::RepeatableRead.set_statement(),
            "SET TRANSACTION ISOLATION LEVEL REPEATABLE READ"
        );
    }

    #[test]
    fn released_scope_rejects_use() {
        let mut scope = ScopedConnection {
            held: None,
            pool: None,
        };
        assert!(scope.is_released());
        assert!(matches!(
            scope.connection(),
            Err(Error::ResourceReleased("connection"))
        ));
        scope.release();
        assert!(scope.is_released());
    }

    #[test]
    fn lost_connection_releases_scope() {
        let mut scope = ScopedConnection {
            held: None,
            pool: None,
        };
        let result: Result<()> = scope.observe(Err(sqlx::Error::PoolClosed));
        assert!(result.unwrap_err().is_connection_lost());
    }
}
