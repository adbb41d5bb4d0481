//! Admission-time connection validation.
//!
//! A connection that sat idle for longer than the validation interval is
//! probed before it is handed out; one past its max lifetime is retired
//! without probing.

use std::time::{Duration, Instant};

use crate::error::DbError;
use crate::udbc::connection::Connection;

pub fn is_expired(created_at: Instant, max_lifetime: Option<Duration>) -> bool {
    max_lifetime.is_some_and(|lifetime| created_at.elapsed() > lifetime)
}

pub fn needs_probe(idle_since: Instant, validation_interval: Duration) -> bool {
    idle_since.elapsed() >= validation_interval
}

/// Runs the driver's liveness probe and returns its round-trip time.
///
/// A probe that does not answer within `timeout` counts as a failure.
pub async fn probe(conn: &mut dyn Connection, timeout: Duration) -> Result<Duration, DbError> {
    let start = Instant::now();
    match tokio::time::timeout(timeout, conn.ping()).await {
        Ok(Ok(())) => Ok(start.elapsed()),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(DbError::Connection(format!(
            "liveness probe timed out after {timeout:?}"
        ))),
    }
}
