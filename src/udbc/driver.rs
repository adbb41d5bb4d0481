use crate::error::DbError;
use crate::udbc::connection::Connection;
use async_trait::async_trait;

/// Opens physical connections for a [`ConnectionPool`].
///
/// The pool is the only caller of `connect`; it decides when connections are
/// created and when they are closed.
///
/// [`ConnectionPool`]: crate::pool::ConnectionPool
#[async_trait]
pub trait Driver: Send + Sync {
    fn name(&self) -> &str;

    fn r#type(&self) -> &str;

    async fn connect(&self) -> Result<Box<dyn Connection>, DbError>;
}
