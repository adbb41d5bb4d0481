use crate::error::DbError;
use crate::udbc::DEFAULT_DB_NAME;
use crate::udbc::connection::Connection;
use crate::udbc::driver::Driver;
use crate::udbc_mysql::connection::MysqlConnection;
use async_trait::async_trait;
use mysql_async::{Conn, Opts};
use std::time::Duration;
use tracing::debug;

const MYSQL_TYPE: &str = "mysql";

/// Opens physical MySQL connections.
///
/// Pooling is done by [`ConnectionPool`](crate::pool::ConnectionPool), so the
/// driver never uses `mysql_async`'s own pool: every `connect` is one `Conn`.
pub struct MysqlDriver {
    url: String,
    name: String,
    r#type: String,
    connect_timeout: Option<Duration>,
    opts: Option<Opts>,
}

impl MysqlDriver {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            name: DEFAULT_DB_NAME.to_string(),
            r#type: MYSQL_TYPE.to_string(),
            url: url.into(),
            connect_timeout: None,
            opts: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Parses the URL. Must be called before the driver is handed to a pool.
    pub fn build(mut self) -> Result<Self, DbError> {
        let opts =
            Opts::from_url(&self.url).map_err(|e| DbError::InvalidDatabaseUrl(e.to_string()))?;
        self.opts = Some(opts);
        Ok(self)
    }
}

#[async_trait]
impl Driver for MysqlDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn r#type(&self) -> &str {
        &self.r#type
    }

    async fn connect(&self) -> Result<Box<dyn Connection>, DbError> {
        let opts = self
            .opts
            .clone()
            .ok_or_else(|| DbError::Connection("MysqlDriver::build was not called".to_string()))?;
        let conn = match self.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, Conn::new(opts))
                .await
                .map_err(|_| DbError::Connection(format!("connect timed out after {timeout:?}")))??,
            None => Conn::new(opts).await?,
        };
        debug!(driver = %self.name, connection_id = conn.id(), "mysql connection established");
        Ok(Box::new(MysqlConnection::new(conn)))
    }
}
