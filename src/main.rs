use std::sync::Arc;

use collectflow_db::udbc_mysql::MysqlDriver;
use collectflow_db::{ConnectionPool, PoolOptions};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    let options = PoolOptions::from_env()?;
    let driver = MysqlDriver::new(options.url.clone())
        .name("main")
        .connect_timeout(options.acquire_timeout)
        .build()?;
    let pool = ConnectionPool::connect(Arc::new(driver), options).await?;

    let rows = pool
        .with_scope(|tx| Box::pin(async move { tx.query("SELECT 1 AS ok", &[]).await }))
        .await
        .map_err(|e| e.into_work_error())?;
    info!(rows = rows.len(), "database reachable");

    let status = pool.status();
    info!(
        total = status.total,
        idle = status.idle,
        in_use = status.in_use,
        "pool status"
    );

    pool.close().await;
    Ok(())
}
