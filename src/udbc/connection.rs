use crate::error::DbError;
use crate::udbc::PROBE_SQL;
use crate::udbc::value::Value;
use async_trait::async_trait;
use std::collections::HashMap;

/// A single physical database connection.
///
/// Methods take `&mut self`: a connection is owned by exactly one holder at a
/// time, the pool while idle and one transaction scope while in use.
#[async_trait]
pub trait Connection: Send {
    async fn query(
        &mut self,
        sql: &str,
        args: &[Value],
    ) -> Result<Vec<HashMap<String, Value>>, DbError>;

    async fn execute(&mut self, sql: &str, args: &[Value]) -> Result<u64, DbError>;

    async fn last_insert_id(&mut self) -> Result<u64, DbError>;

    // ---------- transaction ----------
    async fn begin(&mut self) -> Result<(), DbError>;
    async fn commit(&mut self) -> Result<(), DbError>;
    async fn rollback(&mut self) -> Result<(), DbError>;

    /// True between a successful `begin` and a successful `commit`/`rollback`.
    fn in_transaction(&self) -> bool;

    // ---------- lifecycle ----------
    /// Liveness probe run before handing out a long-idle connection.
    async fn ping(&mut self) -> Result<(), DbError> {
        self.query(PROBE_SQL, &[]).await.map(|_| ())
    }

    async fn close(self: Box<Self>) -> Result<(), DbError>;
}
