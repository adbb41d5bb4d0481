use std::time::Duration;

use thiserror::Error;

/// Errors raised by the pool, the transaction scope and the drivers.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("General error: {0}")]
    General(String),
    #[error("Driver error: {0}")]
    Driver(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Query error: {0}")]
    Query(String),
    #[error("Invalid database URL: {0}")]
    InvalidDatabaseUrl(String),
    #[error("Database error: {0}")]
    Database(String),
    #[error("Configuration error: {0}")]
    Config(String),

    /// No connection became available before the acquire timeout.
    #[error("Connection pool exhausted: no connection available within {0:?}")]
    PoolExhausted(Duration),
    /// Opening a new physical connection failed.
    #[error("Connection unavailable: {0}")]
    ConnectionUnavailable(#[source] Box<DbError>),
    #[error("Commit failed: {0}")]
    CommitFailed(#[source] Box<DbError>),
    #[error("Rollback failed: {0}")]
    RollbackFailed(#[source] Box<DbError>),
    #[error("Connection pool is closed")]
    PoolClosed,
}

impl DbError {
    /// Capacity errors the caller may retry after backing off.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            DbError::PoolExhausted(_) | DbError::ConnectionUnavailable(_)
        )
    }
}

/// Failure of a unit of work run inside a [`TransactionScope`].
///
/// [`TransactionScope`]: crate::transaction::TransactionScope
#[derive(Error, Debug)]
pub enum ScopeError<E> {
    /// The scope itself failed: acquire, `BEGIN` or commit.
    #[error(transparent)]
    Db(#[from] DbError),
    /// The work returned an error. The transaction was rolled back; if that
    /// rollback also failed its error is kept in `rollback`.
    #[error("Unit of work failed: {source}")]
    WorkFailed {
        source: E,
        rollback: Option<DbError>,
    },
}

impl<E> ScopeError<E> {
    pub fn rollback_error(&self) -> Option<&DbError> {
        match self {
            ScopeError::WorkFailed { rollback, .. } => rollback.as_ref(),
            ScopeError::Db(_) => None,
        }
    }

    pub fn work_error(&self) -> Option<&E> {
        match self {
            ScopeError::WorkFailed { source, .. } => Some(source),
            ScopeError::Db(_) => None,
        }
    }

    /// Collapses into the business error type. The rollback failure, if any,
    /// has already been logged by the scope and is dropped here.
    pub fn into_work_error(self) -> E
    where
        E: From<DbError>,
    {
        match self {
            ScopeError::Db(e) => E::from(e),
            ScopeError::WorkFailed { source, .. } => source,
        }
    }
}

#[cfg(feature = "mysql")]
impl From<mysql_async::Error> for DbError {
    fn from(e: mysql_async::Error) -> Self {
        DbError::Database(e.to_string())
    }
}
