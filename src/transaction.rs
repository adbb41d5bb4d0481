use std::collections::HashMap;
use std::fmt::Display;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::error::{DbError, ScopeError};
use crate::pool::{ConnectionPool, PooledConnection};
use crate::udbc::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScopeOutcome {
    Pending,
    Committed,
    RolledBack,
    Failed,
}

/// The connection a unit of work runs its statements on.
///
/// Only statements are exposed. Commit, rollback and close belong to the
/// enclosing [`TransactionScope`].
pub struct Transaction {
    conn: PooledConnection,
}

impl Transaction {
    pub fn connection_id(&self) -> u64 {
        self.conn.id()
    }

    pub async fn query(
        &mut self,
        sql: &str,
        args: &[Value],
    ) -> Result<Vec<HashMap<String, Value>>, DbError> {
        let id = self.conn.id();
        let start = Instant::now();
        let result = self.conn.raw()?.query(sql, args).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;
        match &result {
            Ok(rows) => debug!(connection_id = id, sql, elapsed_ms, rows = rows.len(), "query"),
            Err(e) => debug!(connection_id = id, sql, elapsed_ms, error = %e, "query failed"),
        }
        result
    }

    pub async fn execute(&mut self, sql: &str, args: &[Value]) -> Result<u64, DbError> {
        let id = self.conn.id();
        let start = Instant::now();
        let result = self.conn.raw()?.execute(sql, args).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;
        match &result {
            Ok(affected) => debug!(connection_id = id, sql, elapsed_ms, affected, "execute"),
            Err(e) => debug!(connection_id = id, sql, elapsed_ms, error = %e, "execute failed"),
        }
        result
    }

    pub async fn last_insert_id(&mut self) -> Result<u64, DbError> {
        self.conn.raw()?.last_insert_id().await
    }

    async fn commit(&mut self) -> Result<(), DbError> {
        self.conn.raw()?.commit().await
    }

    async fn rollback(&mut self) -> Result<(), DbError> {
        self.conn.raw()?.rollback().await
    }
}

/// Borrows one connection for one unit of work.
///
/// The work runs inside a transaction that is committed when it returns `Ok`
/// and rolled back when it returns `Err`. Either way the connection goes back
/// to the pool exactly once before [`run`](Self::run) returns: clean
/// connections are reused, connections whose commit or rollback failed are
/// discarded.
///
/// A scope dropped before it finishes (its task was cancelled) still rolls
/// back, on a task spawned from `Drop`, before releasing the connection.
pub struct TransactionScope {
    pool: ConnectionPool,
    tx: Option<Transaction>,
    outcome: ScopeOutcome,
}

impl TransactionScope {
    /// Borrows a connection and starts a transaction on it.
    ///
    /// Acquire errors are returned unchanged. If `BEGIN` fails the connection
    /// is discarded and the driver error is returned.
    pub async fn begin(pool: &ConnectionPool, timeout: Duration) -> Result<Self, DbError> {
        let mut conn = pool.acquire(timeout).await?;
        let begun = match conn.raw() {
            Ok(raw) => raw.begin().await,
            Err(e) => Err(e),
        };
        if let Err(e) = begun {
            warn!(connection_id = conn.id(), error = %e, "BEGIN failed, discarding connection");
            conn.mark_broken();
            pool.release(conn, false).await;
            return Err(e);
        }
        debug!(connection_id = conn.id(), "transaction started");
        Ok(Self {
            pool: pool.clone(),
            tx: Some(Transaction { conn }),
            outcome: ScopeOutcome::Pending,
        })
    }

    /// Runs `work` once, then commits or rolls back and releases the connection.
    ///
    /// ```ignore
    /// let id = scope
    ///     .run(|tx| Box::pin(async move {
    ///         tx.execute("INSERT INTO sms (idpratica, testo) VALUES (?, ?)", &[7.into(), "ok".into()]).await?;
    ///         tx.last_insert_id().await
    ///     }))
    ///     .await?;
    /// ```
    pub async fn run<T, E, F>(self, work: F) -> Result<T, ScopeError<E>>
    where
        F: for<'t> FnOnce(&'t mut Transaction) -> BoxFuture<'t, Result<T, E>>,
        E: Display,
    {
        self.run_with_outcome(work).await.1
    }

    /// Like [`run`](Self::run), also reporting how the scope ended.
    pub async fn run_with_outcome<T, E, F>(mut self, work: F) -> (ScopeOutcome, Result<T, ScopeError<E>>)
    where
        F: for<'t> FnOnce(&'t mut Transaction) -> BoxFuture<'t, Result<T, E>>,
        E: Display,
    {
        let result = self.complete(work).await;
        (self.outcome, result)
    }

    async fn complete<T, E, F>(&mut self, work: F) -> Result<T, ScopeError<E>>
    where
        F: for<'t> FnOnce(&'t mut Transaction) -> BoxFuture<'t, Result<T, E>>,
        E: Display,
    {
        let Some(tx) = self.tx.as_mut() else {
            return Err(DbError::General("transaction scope already finished".into()).into());
        };
        match work(tx).await {
            Ok(value) => {
                self.commit().await?;
                Ok(value)
            }
            Err(source) => {
                warn!(error = %source, "unit of work failed, rolling back");
                let rollback = self.rollback().await.err();
                Err(ScopeError::WorkFailed { source, rollback })
            }
        }
    }

    async fn commit(&mut self) -> Result<(), DbError> {
        let Some(tx) = self.tx.as_mut() else {
            return Ok(());
        };
        let id = tx.connection_id();
        let committed = tx.commit().await;
        let failure = match committed {
            Ok(()) => None,
            Err(e) => {
                error!(connection_id = id, error = %e, "commit failed, rolling back");
                if let Err(rollback) = tx.rollback().await {
                    error!(connection_id = id, error = %rollback, "rollback after failed commit failed");
                }
                Some(e)
            }
        };
        let healthy = failure.is_none();
        self.outcome = if healthy {
            ScopeOutcome::Committed
        } else {
            ScopeOutcome::Failed
        };
        self.finish(healthy).await;
        match failure {
            None => Ok(()),
            Some(e) => Err(DbError::CommitFailed(Box::new(e))),
        }
    }

    async fn rollback(&mut self) -> Result<(), DbError> {
        let Some(tx) = self.tx.as_mut() else {
            return Ok(());
        };
        let id = tx.connection_id();
        let rolled_back = tx.rollback().await;
        if let Err(e) = &rolled_back {
            error!(connection_id = id, error = %e, "rollback failed, discarding connection");
        }
        let healthy = rolled_back.is_ok();
        self.outcome = if healthy {
            ScopeOutcome::RolledBack
        } else {
            ScopeOutcome::Failed
        };
        self.finish(healthy).await;
        rolled_back.map_err(|e| DbError::RollbackFailed(Box::new(e)))
    }

    /// The single release of this scope's connection.
    async fn finish(&mut self, healthy: bool) {
        if let Some(tx) = self.tx.take() {
            let mut conn = tx.conn;
            if !healthy {
                conn.mark_broken();
            }
            debug!(connection_id = conn.id(), outcome = ?self.outcome, "transaction finished");
            self.pool.release(conn, healthy).await;
        }
    }
}

impl Drop for TransactionScope {
    fn drop(&mut self) {
        let Some(mut tx) = self.tx.take() else {
            return;
        };
        warn!(
            connection_id = tx.connection_id(),
            "transaction scope dropped before completion, rolling back"
        );
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let pool = self.pool.clone();
                handle.spawn(async move {
                    let healthy = match tx.rollback().await {
                        Ok(()) => true,
                        Err(e) => {
                            error!(connection_id = tx.connection_id(), error = %e, "rollback of abandoned scope failed");
                            false
                        }
                    };
                    pool.release(tx.conn, healthy).await;
                });
            }
            // No runtime to roll back on: dropping the connection discards it.
            Err(_) => drop(tx),
        }
    }
}

impl ConnectionPool {
    /// Starts a scope using the configured acquire timeout.
    pub async fn begin(&self) -> Result<TransactionScope, DbError> {
        TransactionScope::begin(self, self.options().acquire_timeout).await
    }

    /// Runs `work` in its own transaction on a borrowed connection.
    ///
    /// Commits when `work` returns `Ok`, rolls back when it returns `Err`, and
    /// always returns the connection to the pool before resolving. The error
    /// from `work` is the one reported; a failed rollback is attached to it.
    pub async fn with_scope<T, E, F>(&self, work: F) -> Result<T, ScopeError<E>>
    where
        F: for<'t> FnOnce(&'t mut Transaction) -> BoxFuture<'t, Result<T, E>>,
        E: Display,
    {
        self.begin().await?.run(work).await
    }
}

