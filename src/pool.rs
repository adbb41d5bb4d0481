//! Bounded pool of physical database connections.
//!
//! The pool never holds its lock across I/O: connects, probes and closes run
//! on the caller's task after the state transition has been recorded. Slots
//! (the right to own one physical connection) are counted in `total`; a slot
//! is either parked with an idle connection, owned by a [`PooledConnection`],
//! or in flight to a queued waiter.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::error::DbError;
use crate::health;
use crate::models::db_config::PoolOptions;
use crate::udbc::connection::Connection;
use crate::udbc::driver::Driver;

/// Lifecycle state of a physical connection.
///
/// `Idle` is only ever held on the pool side: a [`PooledConnection`] in a
/// caller's hands is `InUse` until it is released, or `Broken` once
/// [`mark_broken`](PooledConnection::mark_broken) was called.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    /// Parked in the pool's idle set.
    Idle,
    /// Borrowed by exactly one holder.
    InUse,
    /// Unusable; closed instead of recycled on release.
    Broken,
}

/// A physical connection while it is parked in the idle set or handed to a waiter.
pub(crate) struct Entry {
    id: u64,
    raw: Box<dyn Connection>,
    created_at: Instant,
    last_validated: Instant,
    idle_since: Instant,
}

/// What a release hands to the longest waiter.
enum Grant {
    /// An idle, transaction-clean connection.
    Conn(Entry),
    /// A freed slot; the waiter opens a replacement connection itself.
    Slot,
}

struct PoolState {
    idle: Vec<Entry>,
    total: usize,
    waiters: VecDeque<oneshot::Sender<Grant>>,
    closed: bool,
}

#[derive(Default)]
struct Counters {
    opened: AtomicU64,
    closed: AtomicU64,
    acquired: AtomicU64,
    released: AtomicU64,
    discarded: AtomicU64,
    timed_out: AtomicU64,
    connect_failures: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

pub(crate) struct PoolInner {
    name: String,
    driver: Arc<dyn Driver>,
    options: PoolOptions,
    state: Mutex<PoolState>,
    counters: Counters,
    next_id: AtomicU64,
}

impl PoolInner {
    /// Hands `grant` to the longest waiter that is still listening, otherwise
    /// parks it: a connection goes to the idle set, a slot is freed.
    ///
    /// Returns the connection when the pool is closed and nobody can take it;
    /// the caller must discard it.
    fn dispatch(&self, grant: Grant) -> Option<Entry> {
        let mut state = self.state.lock();
        let mut grant = grant;
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.send(grant) {
                Ok(()) => return None,
                Err(returned) => grant = returned,
            }
        }
        match grant {
            Grant::Conn(entry) if state.closed => Some(entry),
            Grant::Conn(entry) => {
                state.idle.push(entry);
                None
            }
            Grant::Slot => {
                debug_assert!(state.total > 0, "slot freed with no live connections");
                state.total = state.total.saturating_sub(1);
                None
            }
        }
    }

    /// Closes the physical connection, then gives its slot back.
    async fn discard(&self, entry: Entry, slot: SlotGuard) {
        self.close_entry(entry).await;
        drop(slot);
    }

    /// Closes the physical connection only. Whoever owns its slot decides
    /// what happens to it.
    async fn close_entry(&self, entry: Entry) {
        let id = entry.id;
        if let Err(e) = entry.raw.close().await {
            warn!(pool = %self.name, connection_id = id, error = %e, "error closing connection");
        }
        Counters::bump(&self.counters.closed);
        debug!(pool = %self.name, connection_id = id, "connection closed");
    }

    /// Discard from synchronous context (drop paths).
    fn discard_detached(self: &Arc<Self>, entry: Entry) {
        let slot = SlotGuard::new(self.clone());
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let inner = self.clone();
                handle.spawn(async move {
                    inner.discard(entry, slot).await;
                });
            }
            Err(_) => {
                drop(entry);
                Counters::bump(&self.counters.closed);
                drop(slot);
            }
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Owns one slot of `total` until it is either kept (a connection now holds
/// it) or dropped (the slot is handed to a waiter or freed).
struct SlotGuard {
    inner: Option<Arc<PoolInner>>,
}

impl SlotGuard {
    fn new(inner: Arc<PoolInner>) -> Self {
        Self { inner: Some(inner) }
    }

    fn keep(mut self) {
        self.inner = None;
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.dispatch(Grant::Slot);
        }
    }
}

/// A queued acquirer. Anything delivered after the acquirer gave up (timeout
/// or cancellation) is dispatched onwards instead of being lost.
struct Waiter {
    rx: oneshot::Receiver<Grant>,
    inner: Arc<PoolInner>,
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.rx.close();
        if let Ok(grant) = self.rx.try_recv() {
            if let Some(entry) = self.inner.dispatch(grant) {
                self.inner.discard_detached(entry);
            }
        }
    }
}

enum Step {
    Idle(Entry),
    Open(SlotGuard),
    Wait(Waiter),
}

/// A connection borrowed from the pool.
///
/// Give it back with [`ConnectionPool::release`]. Dropping it instead counts
/// as an unhealthy release: the physical connection is closed and never
/// reused, because its transactional state is unknown.
pub struct PooledConnection {
    id: u64,
    raw: Option<Box<dyn Connection>>,
    state: ConnectionState,
    created_at: Instant,
    last_validated: Instant,
    idle_since: Instant,
    pool: Arc<PoolInner>,
}

impl PooledConnection {
    fn new(entry: Entry, pool: Arc<PoolInner>) -> Self {
        Self {
            id: entry.id,
            raw: Some(entry.raw),
            state: ConnectionState::InUse,
            created_at: entry.created_at,
            last_validated: entry.last_validated,
            idle_since: entry.idle_since,
            pool,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_validated(&self) -> Instant {
        self.last_validated
    }

    /// Flags the connection as unusable, e.g. after the driver reported an
    /// unrecoverable error. A broken connection is never returned to the idle set.
    pub fn mark_broken(&mut self) {
        self.state = ConnectionState::Broken;
    }

    pub(crate) fn raw(&mut self) -> Result<&mut dyn Connection, DbError> {
        match self.raw.as_deref_mut() {
            Some(raw) => Ok(raw),
            None => Err(DbError::General(format!(
                "connection {} already returned to the pool",
                self.id
            ))),
        }
    }

    fn take_entry(&mut self) -> Option<Entry> {
        self.raw.take().map(|raw| Entry {
            id: self.id,
            raw,
            created_at: self.created_at,
            last_validated: self.last_validated,
            idle_since: self.idle_since,
        })
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(entry) = self.take_entry() {
            warn!(
                pool = %self.pool.name,
                connection_id = entry.id,
                "connection dropped without release, discarding"
            );
            Counters::bump(&self.pool.counters.discarded);
            self.pool.discard_detached(entry);
        }
    }
}

/// Point-in-time view of the pool, suitable for a health endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub name: String,
    pub max_size: usize,
    pub total: usize,
    pub idle: usize,
    pub in_use: usize,
    pub waiting: usize,
    pub closed: bool,
    pub opened: u64,
    pub closed_connections: u64,
    pub acquired: u64,
    pub released: u64,
    pub discarded: u64,
    pub timed_out: u64,
    pub connect_failures: u64,
}

/// 数据库连接池
/// Bounded pool of physical connections opened through a [`Driver`].
///
/// Cloning is cheap and every clone refers to the same pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Creates an empty pool; connections are opened lazily by `acquire`.
    pub fn new(driver: Arc<dyn Driver>, options: PoolOptions) -> Result<Self, DbError> {
        options.validate()?;
        let name = driver.name().to_string();
        info!(
            pool = %name,
            driver = driver.r#type(),
            max_size = options.max_size,
            "connection pool initialized"
        );
        Ok(Self {
            inner: Arc::new(PoolInner {
                name,
                driver,
                state: Mutex::new(PoolState {
                    idle: Vec::with_capacity(options.max_size),
                    total: 0,
                    waiters: VecDeque::new(),
                    closed: false,
                }),
                options,
                counters: Counters::default(),
                next_id: AtomicU64::new(1),
            }),
        })
    }

    /// Creates a pool and opens `min_idle` connections up front.
    pub async fn connect(driver: Arc<dyn Driver>, options: PoolOptions) -> Result<Self, DbError> {
        let pool = Self::new(driver, options)?;
        let min_idle = pool.inner.options.min_idle;
        let timeout = pool.inner.options.acquire_timeout;
        let mut warm = Vec::with_capacity(min_idle);
        for _ in 0..min_idle {
            warm.push(pool.acquire(timeout).await?);
        }
        for conn in warm {
            pool.release(conn, true).await;
        }
        Ok(pool)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn options(&self) -> &PoolOptions {
        &self.inner.options
    }

    /// Borrows a connection, waiting at most `timeout` for one to be released.
    ///
    /// Waiters are served in arrival order. Fails with
    /// [`DbError::PoolExhausted`] on timeout, [`DbError::ConnectionUnavailable`]
    /// when a new connection cannot be opened and [`DbError::PoolClosed`]
    /// after [`close`](Self::close). None of these is retried here.
    pub async fn acquire(&self, timeout: Duration) -> Result<PooledConnection, DbError> {
        let deadline = tokio::time::Instant::now().checked_add(timeout);
        let step = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(DbError::PoolClosed);
            }
            if let Some(entry) = state.idle.pop() {
                Step::Idle(entry)
            } else if state.total < self.inner.options.max_size {
                state.total += 1;
                Step::Open(SlotGuard::new(self.inner.clone()))
            } else {
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                Step::Wait(Waiter {
                    rx,
                    inner: self.inner.clone(),
                })
            }
        };

        let grant = match step {
            Step::Idle(entry) => Grant::Conn(entry),
            Step::Open(slot) => return self.open(slot).await,
            Step::Wait(mut waiter) => {
                debug!(pool = %self.inner.name, "pool at capacity, waiting for a connection");
                let received = match deadline {
                    Some(deadline) => tokio::time::timeout_at(deadline, &mut waiter.rx).await,
                    None => Ok((&mut waiter.rx).await),
                };
                match received {
                    Ok(Ok(grant)) => grant,
                    Ok(Err(_)) => return Err(DbError::PoolClosed),
                    Err(_) => {
                        Counters::bump(&self.inner.counters.timed_out);
                        warn!(
                            pool = %self.inner.name,
                            timeout_ms = timeout.as_millis() as u64,
                            "connection pool exhausted"
                        );
                        return Err(DbError::PoolExhausted(timeout));
                    }
                }
            }
        };

        match grant {
            Grant::Slot => self.open(SlotGuard::new(self.inner.clone())).await,
            Grant::Conn(entry) => {
                let mut conn = PooledConnection::new(entry, self.inner.clone());
                match self.admit(&mut conn).await {
                    Ok(()) => {
                        Counters::bump(&self.inner.counters.acquired);
                        debug!(pool = %self.inner.name, connection_id = conn.id, "reusing pooled connection");
                        Ok(conn)
                    }
                    Err(e) => {
                        warn!(
                            pool = %self.inner.name,
                            connection_id = conn.id,
                            error = %e,
                            "pooled connection failed validation, replacing it"
                        );
                        // The slot stays with this caller, who opens the replacement.
                        let slot = SlotGuard::new(self.inner.clone());
                        if let Some(entry) = conn.take_entry() {
                            Counters::bump(&self.inner.counters.discarded);
                            self.inner.close_entry(entry).await;
                        }
                        self.open(slot).await
                    }
                }
            }
        }
    }

    async fn open(&self, slot: SlotGuard) -> Result<PooledConnection, DbError> {
        match self.inner.driver.connect().await {
            Ok(raw) => {
                slot.keep();
                let now = Instant::now();
                let entry = Entry {
                    id: self.inner.next_id(),
                    raw,
                    created_at: now,
                    last_validated: now,
                    idle_since: now,
                };
                Counters::bump(&self.inner.counters.opened);
                Counters::bump(&self.inner.counters.acquired);
                debug!(pool = %self.inner.name, connection_id = entry.id, "opened new connection");
                Ok(PooledConnection::new(entry, self.inner.clone()))
            }
            Err(e) => {
                drop(slot);
                Counters::bump(&self.inner.counters.connect_failures);
                error!(pool = %self.inner.name, error = %e, "failed to open connection");
                Err(DbError::ConnectionUnavailable(Box::new(e)))
            }
        }
    }

    /// Admission check for a connection coming out of the idle set.
    async fn admit(&self, conn: &mut PooledConnection) -> Result<(), DbError> {
        let options = &self.inner.options;
        if health::is_expired(conn.created_at, options.max_lifetime) {
            return Err(DbError::Connection("connection exceeded its max lifetime".into()));
        }
        if !health::needs_probe(conn.idle_since, options.validation_interval) {
            return Ok(());
        }
        let latency = health::probe(conn.raw()?, options.probe_timeout).await?;
        conn.last_validated = Instant::now();
        debug!(
            pool = %self.inner.name,
            connection_id = conn.id,
            latency_us = latency.as_micros() as u64,
            "connection validated"
        );
        Ok(())
    }

    /// Returns a borrowed connection.
    ///
    /// A healthy connection with no open transaction goes to the longest
    /// waiter, or back to the idle set. Anything else is closed and its slot
    /// freed, so a replacement is opened by a later `acquire`.
    pub async fn release(&self, mut conn: PooledConnection, healthy: bool) {
        let Some(mut entry) = conn.take_entry() else {
            return;
        };
        let id = entry.id;
        let reason = if !healthy || conn.state == ConnectionState::Broken {
            Some("reported unhealthy")
        } else if entry.raw.in_transaction() {
            error!(
                pool = %self.inner.name,
                connection_id = id,
                "connection released with an open transaction"
            );
            Some("open transaction")
        } else if health::is_expired(entry.created_at, self.inner.options.max_lifetime) {
            Some("max lifetime exceeded")
        } else {
            None
        };

        match reason {
            None => {
                entry.idle_since = Instant::now();
                Counters::bump(&self.inner.counters.released);
                debug!(pool = %self.inner.name, connection_id = id, "connection returned to pool");
                if let Some(entry) = self.inner.dispatch(Grant::Conn(entry)) {
                    self.inner.discard(entry, SlotGuard::new(self.inner.clone())).await;
                }
            }
            Some(reason) => {
                Counters::bump(&self.inner.counters.discarded);
                debug!(pool = %self.inner.name, connection_id = id, reason, "discarding connection");
                self.inner.discard(entry, SlotGuard::new(self.inner.clone())).await;
            }
        }
    }

    pub fn status(&self) -> PoolStatus {
        let counters = &self.inner.counters;
        let state = self.inner.state.lock();
        PoolStatus {
            name: self.inner.name.clone(),
            max_size: self.inner.options.max_size,
            total: state.total,
            idle: state.idle.len(),
            in_use: state.total.saturating_sub(state.idle.len()),
            waiting: state.waiters.iter().filter(|w| !w.is_closed()).count(),
            closed: state.closed,
            opened: Counters::get(&counters.opened),
            closed_connections: Counters::get(&counters.closed),
            acquired: Counters::get(&counters.acquired),
            released: Counters::get(&counters.released),
            discarded: Counters::get(&counters.discarded),
            timed_out: Counters::get(&counters.timed_out),
            connect_failures: Counters::get(&counters.connect_failures),
        }
    }

    /// Shuts the pool down: idle connections are closed, queued acquirers
    /// fail with [`DbError::PoolClosed`] and connections still in use are
    /// closed when they are released.
    pub async fn close(&self) {
        let (idle, waiters) = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            (
                std::mem::take(&mut state.idle),
                std::mem::take(&mut state.waiters),
            )
        };
        drop(waiters);
        info!(pool = %self.inner.name, idle = idle.len(), "closing connection pool");
        for entry in idle {
            self.inner.discard(entry, SlotGuard::new(self.inner.clone())).await;
        }
    }
}
