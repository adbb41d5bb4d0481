pub mod value;

pub mod connection;
pub mod driver;

pub const DEFAULT_DB_NAME: &str = "default";

/// Query used by [`connection::Connection::ping`] unless a driver overrides it.
pub const PROBE_SQL: &str = "SELECT 1";
