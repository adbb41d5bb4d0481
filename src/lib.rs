//! Bounded connection pool and scoped transactions.
//!
//! Business code borrows a connection only through
//! [`ConnectionPool::with_scope`]: the work runs in a transaction that is
//! committed on `Ok`, rolled back on `Err`, and the connection is returned to
//! the pool exactly once on every exit path.

pub mod error;
pub mod health;
pub mod models;
pub mod pool;
pub mod transaction;
pub mod udbc;
#[cfg(feature = "mysql")]
pub mod udbc_mysql;

pub use error::{DbError, ScopeError};
pub use models::db_config::PoolOptions;
pub use pool::{ConnectionPool, ConnectionState, PoolStatus, PooledConnection};
pub use transaction::{ScopeOutcome, Transaction, TransactionScope};
