#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use collectflow_db::udbc::connection::Connection;
use collectflow_db::udbc::driver::Driver;
use collectflow_db::udbc::value::Value;
use collectflow_db::{ConnectionPool, DbError, PoolOptions};
use parking_lot::Mutex;

/// Shared view of every connection a [`MockDriver`] has opened.
#[derive(Default)]
pub struct MockState {
    next_id: AtomicU64,
    pub open_now: AtomicUsize,
    pub max_open: AtomicUsize,
    pub opened: AtomicUsize,
    pub close_calls: AtomicUsize,
    pub begins: AtomicUsize,
    pub commits: AtomicUsize,
    pub rollbacks: AtomicUsize,
    pub pings: AtomicUsize,

    pub fail_connect: AtomicBool,
    pub fail_begin: AtomicBool,
    pub fail_commit: AtomicBool,
    pub fail_rollback: AtomicBool,
    pub fail_ping: AtomicBool,

    /// Rows made durable by a commit.
    pub table: Mutex<Vec<String>>,
    /// Live connection id -> has an open transaction.
    live: Mutex<HashMap<u64, bool>>,
}

impl MockState {
    pub fn set(flag: &AtomicBool, value: bool) {
        flag.store(value, Ordering::SeqCst);
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    /// Live physical connections that still have a transaction open.
    pub fn dirty_connections(&self) -> usize {
        self.live.lock().values().filter(|in_tx| **in_tx).count()
    }

    pub fn live_connections(&self) -> usize {
        self.live.lock().len()
    }

    pub fn rows(&self) -> Vec<String> {
        self.table.lock().clone()
    }
}

pub struct MockDriver {
    pub state: Arc<MockState>,
}

#[async_trait]
impl Driver for MockDriver {
    fn name(&self) -> &str {
        "mock"
    }

    fn r#type(&self) -> &str {
        "mock"
    }

    async fn connect(&self) -> Result<Box<dyn Connection>, DbError> {
        tokio::task::yield_now().await;
        if self.state.fail_connect.load(Ordering::SeqCst) {
            return Err(DbError::Connection("connection refused".into()));
        }
        let id = self.state.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let open = self.state.open_now.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_open.fetch_max(open, Ordering::SeqCst);
        self.state.opened.fetch_add(1, Ordering::SeqCst);
        self.state.live.lock().insert(id, false);
        Ok(Box::new(MockConnection {
            id,
            state: self.state.clone(),
            in_tx: false,
            pending: Vec::new(),
        }))
    }
}

/// In-memory connection: statements executed inside a transaction stay
/// pending until commit and are thrown away on rollback.
pub struct MockConnection {
    id: u64,
    state: Arc<MockState>,
    in_tx: bool,
    pending: Vec<String>,
}

impl MockConnection {
    fn set_in_tx(&mut self, in_tx: bool) {
        self.in_tx = in_tx;
        self.state.live.lock().insert(self.id, in_tx);
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn query(
        &mut self,
        _sql: &str,
        _args: &[Value],
    ) -> Result<Vec<HashMap<String, Value>>, DbError> {
        let table = self.state.table.lock().clone();
        Ok(table
            .into_iter()
            .chain(self.pending.iter().cloned())
            .map(|row| {
                HashMap::from([
                    ("row".to_string(), Value::Str(row)),
                    ("physical_id".to_string(), Value::I64(self.id as i64)),
                ])
            })
            .collect())
    }

    async fn execute(&mut self, sql: &str, _args: &[Value]) -> Result<u64, DbError> {
        if sql.starts_with("FAIL") {
            return Err(DbError::Query(format!("syntax error near {sql:?}")));
        }
        if self.in_tx {
            self.pending.push(sql.to_string());
        } else {
            self.state.table.lock().push(sql.to_string());
        }
        Ok(1)
    }

    async fn last_insert_id(&mut self) -> Result<u64, DbError> {
        Ok((self.state.table.lock().len() + self.pending.len()) as u64)
    }

    async fn begin(&mut self) -> Result<(), DbError> {
        self.state.begins.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_begin.load(Ordering::SeqCst) {
            return Err(DbError::Connection("lost connection during BEGIN".into()));
        }
        self.set_in_tx(true);
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), DbError> {
        self.state.commits.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_commit.load(Ordering::SeqCst) {
            return Err(DbError::Database("deadlock found when trying to commit".into()));
        }
        let pending = std::mem::take(&mut self.pending);
        self.state.table.lock().extend(pending);
        self.set_in_tx(false);
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), DbError> {
        self.state.rollbacks.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_rollback.load(Ordering::SeqCst) {
            return Err(DbError::Connection("server has gone away".into()));
        }
        self.pending.clear();
        self.set_in_tx(false);
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.in_tx
    }

    async fn ping(&mut self) -> Result<(), DbError> {
        self.state.pings.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_ping.load(Ordering::SeqCst) {
            return Err(DbError::Connection("ping failed".into()));
        }
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<(), DbError> {
        self.state.close_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        self.state.open_now.fetch_sub(1, Ordering::SeqCst);
        self.state.live.lock().remove(&self.id);
    }
}

pub fn options(max_size: usize) -> PoolOptions {
    PoolOptions::new("mock://collectflow")
        .max_size(max_size)
        .acquire_timeout(Duration::from_secs(2))
        .validation_interval(Duration::from_secs(3600))
}

pub fn mock_pool(options: PoolOptions) -> (ConnectionPool, Arc<MockState>) {
    let state = Arc::new(MockState::default());
    let driver = Arc::new(MockDriver {
        state: state.clone(),
    });
    let pool = ConnectionPool::new(driver, options).expect("valid pool options");
    (pool, state)
}

/// Polls until `cond` holds; background discards and abandoned-scope
/// rollbacks complete on spawned tasks.
pub async fn eventually<F: Fn() -> bool>(cond: F) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within 1s");
}
