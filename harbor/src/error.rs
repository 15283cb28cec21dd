use thiserror::Error;

/// Errors raised by the storage core.
#[derive(Error, Debug)]
pub enum Error {
    /// A required argument was empty or out of range. Raised before any I/O.
    #[error("invalid argument `{argument}`: {message}")]
    Validation {
        /// Name of the offending argument.
        argument: &'static str,
        /// What was wrong with it.
        message: String,
    },

    /// A connection, transaction, lease or lock was used after its scope ended.
    #[error("{0} has already been released")]
    ResourceReleased(&'static str),

    /// Cooperative cancellation was observed.
    #[error("operation canceled")]
    Canceled,

    /// A pending migration script failed; the migration transaction was rolled back.
    #[error("migration to schema version {version} failed: {source}")]
    Migration {
        /// Version of the script that failed.
        version: i32,
        /// Underlying database error.
        #[source]
        source: sqlx::Error,
    },

    /// A lock is held elsewhere.
    #[error("lock on `{0}` is held by another owner")]
    LockUnavailable(String),

    /// A held distributed lock could not be released.
    #[error("distributed lock error: {0}")]
    DistributedLock(String),

    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn validation(argument: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            argument,
            message: message.into(),
        }
    }

    /// Whether the error means the underlying connection is gone.
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            Self::Database(
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
                    | sqlx::Error::Tls(_)
            )
        )
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

pub(crate) fn require_non_empty(argument: &'static str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::validation(argument, "must not be empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_argument_is_rejected() {
        let err = require_non_empty("key", "").unwrap_err();
        assert!(matches!(err, Error::Validation { argument: "key", .. }));
        assert!(require_non_empty("key", "stats:succeeded").is_ok());
    }

    #[test]
    fn pool_closed_counts_as_lost_connection() {
        assert!(Error::Database(sqlx::Error::PoolClosed).is_connection_lost());
        assert!(!Error::Canceled.is_connection_lost());
        assert!(!Error::Database(sqlx::Error::RowNotFound).is_connection_lost());
    }
}
