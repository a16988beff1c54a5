//! Connection pool.
//!
//! The pool owns every physical connection. A semaphore with `max` permits
//! bounds active plus in-flight creations; idle connections hold no permit.
//! Together this keeps `idle + active <= max` under any interleaving of
//! acquire and release.
//!
//! Pool state (idle queue, active and creating counts) lives behind a single
//! `parking_lot::Mutex` that is never held across an `.await`. Cumulative
//! counters are atomics so `stats()` never contends with traffic.

use crate::db::backend::{BackendConnection, Connector, connector_for};
use crate::db::connection::PooledConnection;
use crate::db::observer::{PoolEvent, QueryObserver};
use crate::error::{HarnessError, HarnessResult};
use crate::models::{BackendCapabilities, BackendKind, ConnectionPoolConfig, QueryParam, Record};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Serialize;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, broadcast};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, timeout};
use tracing::{debug, info, warn};

/// Consecutive failed health checks before the pool is marked unhealthy.
pub const UNHEALTHY_THRESHOLD: u32 = 3;

const EVENT_CAPACITY: usize = 64;

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub max: u32,
    pub total: usize,
    pub idle: usize,
    pub active: usize,
    /// Acquisitions currently waiting
    pub pending: usize,
    pub created: u64,
    pub destroyed: u64,
    pub borrowed: u64,
    pub returned: u64,
    /// Acquisitions that ended without a connection, cancelled ones included
    pub failed: u64,
    pub healthy: bool,
}

impl PoolStats {
    /// Active connections as a share of `max`.
    pub fn utilization(&self) -> f64 {
        if self.max == 0 {
            0.0
        } else {
            self.active as f64 / self.max as f64
        }
    }
}

#[derive(Debug, Default)]
struct PoolCounters {
    created: AtomicU64,
    destroyed: AtomicU64,
    borrowed: AtomicU64,
    returned: AtomicU64,
    failed: AtomicU64,
    pending: AtomicUsize,
}

pub(crate) struct IdleConnection {
    pub(crate) id: String,
    pub(crate) conn: Box<dyn BackendConnection>,
    pub(crate) created_at: Instant,
    idle_since: Instant,
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<IdleConnection>,
    active: usize,
    creating: usize,
}

pub(crate) struct PoolInner {
    pub(crate) config: ConnectionPoolConfig,
    connector: Arc<dyn Connector>,
    state: parking_lot::Mutex<PoolState>,
    semaphore: Arc<Semaphore>,
    counters: PoolCounters,
    observer: parking_lot::RwLock<Option<Arc<dyn QueryObserver>>>,
    events: broadcast::Sender<PoolEvent>,
    consecutive_failures: AtomicU32,
    healthy: AtomicBool,
    closed: AtomicBool,
    initialized: AtomicBool,
    next_connection_id: AtomicU64,
    health_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl PoolInner {
    pub(crate) fn name(&self) -> &str {
        &self.config.name
    }

    pub(crate) fn kind(&self) -> BackendKind {
        self.connector.kind()
    }

    pub(crate) fn observer(&self) -> Option<Arc<dyn QueryObserver>> {
        self.observer.read().clone()
    }

    fn emit(&self, event: PoolEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Open one physical connection, bounded by `create_timeout`.
    async fn open_connection(&self) -> HarnessResult<IdleConnection> {
        let create_timeout = self.config.create_timeout;
        let conn = match timeout(create_timeout, self.connector.connect()).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(HarnessError::timeout(
                    "create connection",
                    create_timeout.as_millis() as u64,
                ));
            }
        };
        let id = format!(
            "{}-{}",
            self.config.name,
            self.next_connection_id.fetch_add(1, Ordering::SeqCst) + 1
        );
        self.counters.created.fetch_add(1, Ordering::SeqCst);
        debug!(pool = %self.config.name, connection_id = %id, "Created connection");
        self.emit(PoolEvent::ConnectionCreated {
            pool: self.config.name.clone(),
            connection_id: id.clone(),
        });
        let now = Instant::now();
        Ok(IdleConnection {
            id,
            conn,
            created_at: now,
            idle_since: now,
        })
    }

    /// Close a connection, bounded by `destroy_timeout`.
    pub(crate) async fn destroy(&self, id: String, conn: Box<dyn BackendConnection>) {
        match timeout(self.config.destroy_timeout, conn.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(connection_id = %id, error = %e, "Error while closing connection"),
            Err(_) => warn!(connection_id = %id, "Timed out closing connection"),
        }
        self.counters.destroyed.fetch_add(1, Ordering::SeqCst);
        debug!(pool = %self.config.name, connection_id = %id, "Destroyed connection");
        self.emit(PoolEvent::ConnectionDestroyed {
            pool: self.config.name.clone(),
            connection_id: id,
        });
    }

    /// Destroy from a synchronous context.
    pub(crate) fn spawn_destroy(self: &Arc<Self>, id: String, conn: Box<dyn BackendConnection>) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let inner = Arc::clone(self);
                handle.spawn(async move { inner.destroy(id, conn).await });
            }
            Err(_) => {
                // No runtime left to close on; dropping releases the socket
                drop(conn);
                self.counters.destroyed.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    /// Give up an active slot. `counted` marks connections handed out by `acquire`.
    pub(crate) fn release_slot(&self, counted: bool) {
        let mut state = self.state.lock();
        state.active = state.active.saturating_sub(1);
        if counted {
            self.counters.returned.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Return a connection to the idle set, or destroy it if the pool closed.
    pub(crate) fn checkin(
        self: &Arc<Self>,
        id: String,
        conn: Box<dyn BackendConnection>,
        created_at: Instant,
        counted: bool,
    ) {
        let rejected = {
            let mut state = self.state.lock();
            state.active = state.active.saturating_sub(1);
            if self.is_closed() {
                Some(conn)
            } else {
                state.idle.push_back(IdleConnection {
                    id: id.clone(),
                    conn,
                    created_at,
                    idle_since: Instant::now(),
                });
                None
            }
        };
        if counted {
            self.counters.returned.fetch_add(1, Ordering::SeqCst);
        }
        if let Some(conn) = rejected {
            self.spawn_destroy(id, conn);
        }
    }

    /// Open connections until `idle + active` reaches `target` (capped at `max`).
    async fn fill_to(self: &Arc<Self>, target: usize) -> HarnessResult<usize> {
        let target = target.min(self.config.max_connections as usize);
        let mut opened = 0;
        while !self.is_closed() {
            let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
                break;
            };
            let reserved = {
                let mut state = self.state.lock();
                if state.idle.len() + state.active + state.creating < target {
                    state.creating += 1;
                    true
                } else {
                    false
                }
            };
            if !reserved {
                break;
            }
            let guard = CreatingGuard::new(self);
            let idle = self.open_connection().await?;
            guard.park_idle(idle);
            drop(permit);
            opened += 1;
        }
        Ok(opened)
    }

    pub(crate) fn spawn_replenish(self: &Arc<Self>) {
        if tokio::runtime::Handle::try_current().is_err() {
            return;
        }
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            if let Some(inner) = weak.upgrade() {
                let min = inner.config.min_connections as usize;
                if let Err(e) = inner.fill_to(min).await {
                    warn!(pool = %inner.config.name, error = %e, "Failed to replenish pool");
                }
            }
        });
    }

    /// Destroy idle connections past `idle_timeout`, keeping at least `min`.
    async fn reap_idle(&self) -> usize {
        let expired = {
            let mut state = self.state.lock();
            let now = Instant::now();
            let min = self.config.min_connections as usize;
            let mut total = state.idle.len() + state.active;
            let mut expired = Vec::new();
            let mut i = 0;
            while i < state.idle.len() {
                let stale = now.duration_since(state.idle[i].idle_since) >= self.config.idle_timeout;
                if stale && total > min {
                    if let Some(conn) = state.idle.remove(i) {
                        expired.push(conn);
                        total -= 1;
                    }
                } else {
                    i += 1;
                }
            }
            expired
        };
        let reaped = expired.len();
        for idle in expired {
            self.destroy(idle.id, idle.conn).await;
        }
        if reaped > 0 {
            debug!(pool = %self.config.name, reaped, "Reaped idle connections");
        }
        reaped
    }

    fn record_health(&self, outcome: &HarnessResult<()>) -> bool {
        match outcome {
            Ok(()) => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
                if !self.healthy.swap(true, Ordering::SeqCst) {
                    info!(pool = %self.config.name, "Pool recovered");
                    self.emit(PoolEvent::Recovered {
                        pool: self.config.name.clone(),
                    });
                }
                true
            }
            Err(e) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                debug!(pool = %self.config.name, failures, error = %e, "Health check failed");
                if failures >= UNHEALTHY_THRESHOLD && self.healthy.swap(false, Ordering::SeqCst) {
                    warn!(
                        pool = %self.config.name,
                        consecutive_failures = failures,
                        "Pool marked unhealthy"
                    );
                    self.emit(PoolEvent::Unhealthy {
                        pool: self.config.name.clone(),
                        consecutive_failures: failures,
                    });
                }
                false
            }
        }
    }
}

/// Tracks one in-flight creation; un-reserves the slot if dropped early.
struct CreatingGuard<'a> {
    inner: &'a Arc<PoolInner>,
    settled: bool,
}

impl<'a> CreatingGuard<'a> {
    fn new(inner: &'a Arc<PoolInner>) -> Self {
        Self {
            inner,
            settled: false,
        }
    }

    fn promote_active(mut self) {
        let mut state = self.inner.state.lock();
        state.creating -= 1;
        state.active += 1;
        self.settled = true;
    }

    fn park_idle(mut self, idle: IdleConnection) {
        let rejected = {
            let mut state = self.inner.state.lock();
            state.creating -= 1;
            if self.inner.is_closed() {
                Some(idle)
            } else {
                state.idle.push_back(idle);
                None
            }
        };
        self.settled = true;
        if let Some(idle) = rejected {
            self.inner.spawn_destroy(idle.id, idle.conn);
        }
    }
}

impl Drop for CreatingGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.inner.state.lock().creating -= 1;
        }
    }
}

/// Counts a waiting acquisition; an acquisition that never completes is a failure.
struct PendingGuard<'a> {
    inner: &'a PoolInner,
    completed: bool,
}

impl<'a> PendingGuard<'a> {
    fn new(inner: &'a PoolInner) -> Self {
        inner.counters.pending.fetch_add(1, Ordering::SeqCst);
        Self {
            inner,
            completed: false,
        }
    }

    fn complete(&mut self) {
        self.completed = true;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inner.counters.pending.fetch_sub(1, Ordering::SeqCst);
        if !self.completed {
            self.inner.counters.failed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Non-owning pool handle for background observers.
#[derive(Clone)]
pub struct WeakPool {
    inner: Weak<PoolInner>,
}

impl WeakPool {
    pub fn upgrade(&self) -> Option<ConnectionPool> {
        self.inner.upgrade().map(|inner| ConnectionPool { inner })
    }
}

/// A named pool of backend connections.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("name", &self.inner.config.name)
            .field("kind", &self.inner.kind())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl ConnectionPool {
    /// Create a pool over `connector`. No connection is opened until
    /// [`ConnectionPool::initialize`] or the first acquire.
    pub fn new(config: ConnectionPoolConfig, connector: Arc<dyn Connector>) -> HarnessResult<Self> {
        config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let semaphore = Arc::new(Semaphore::new(config.max_connections as usize));
        Ok(Self {
            inner: Arc::new(PoolInner {
                config,
                connector,
                state: parking_lot::Mutex::new(PoolState::default()),
                semaphore,
                counters: PoolCounters::default(),
                observer: parking_lot::RwLock::new(None),
                events,
                consecutive_failures: AtomicU32::new(0),
                healthy: AtomicBool::new(true),
                closed: AtomicBool::new(false),
                initialized: AtomicBool::new(false),
                next_connection_id: AtomicU64::new(0),
                health_task: parking_lot::Mutex::new(None),
            }),
        })
    }

    /// Create a pool with the connector matching the configured backend.
    pub fn from_config(config: ConnectionPoolConfig) -> HarnessResult<Self> {
        let connector = connector_for(&config.backend);
        Self::new(config, connector)
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn config(&self) -> &ConnectionPoolConfig {
        &self.inner.config
    }

    pub fn kind(&self) -> BackendKind {
        self.inner.kind()
    }

    pub fn capabilities(&self) -> BackendCapabilities {
        self.inner.connector.capabilities()
    }

    /// Install the observer that sees every pooled operation.
    pub fn set_observer(&self, observer: Arc<dyn QueryObserver>) {
        *self.inner.observer.write() = Some(observer);
    }

    pub fn clear_observer(&self) {
        *self.inner.observer.write() = None;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_healthy(&self) -> bool {
        self.inner.healthy.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn downgrade(&self) -> WeakPool {
        WeakPool {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Open `min_connections` connections (at least one, to prove the backend
    /// is reachable) and start the health loop.
    ///
    /// Retries up to `max_retries` times before failing with
    /// [`HarnessError::PoolInitialization`].
    pub async fn initialize(&self) -> HarnessResult<()> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(HarnessError::pool_closed(inner.name()));
        }
        if inner.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }

        let attempts_allowed = inner.config.max_retries + 1;
        let target = (inner.config.min_connections as usize).max(1);
        let mut last_error = None;
        for attempt in 1..=attempts_allowed {
            match inner.fill_to(target).await {
                Ok(opened) => {
                    if !inner.initialized.swap(true, Ordering::SeqCst) {
                        self.spawn_health_task();
                    }
                    info!(
                        pool = %inner.name(),
                        backend = %inner.config.backend.masked_connection_string(),
                        opened,
                        "Pool initialized"
                    );
                    return Ok(());
                }
                Err(e) => {
                    warn!(pool = %inner.name(), attempt, error = %e, "Pool initialization attempt failed");
                    last_error = Some(e);
                    if attempt < attempts_allowed {
                        tokio::time::sleep(inner.config.retry_delay * attempt).await;
                    }
                }
            }
        }

        Err(HarnessError::pool_initialization(
            inner.name(),
            last_error.map(|e| e.to_string()).unwrap_or_default(),
            attempts_allowed,
        ))
    }

    /// Acquire a connection for exclusive use.
    ///
    /// Waits up to `acquire_timeout` per attempt and retries `max_retries`
    /// times with a linearly growing `retry_delay`. Dropping the returned
    /// future abandons the acquisition and counts it as failed.
    pub async fn acquire(&self) -> HarnessResult<PooledConnection> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(HarnessError::pool_closed(inner.name()));
        }

        let started = Instant::now();
        let mut pending = PendingGuard::new(inner);
        let attempts_allowed = inner.config.max_retries + 1;
        let mut last_error: Option<HarnessError> = None;

        for attempt in 1..=attempts_allowed {
            let wait = Arc::clone(&inner.semaphore).acquire_owned();
            match timeout(inner.config.acquire_timeout, wait).await {
                Ok(Ok(permit)) => match self.checkout(permit).await {
                    Ok(mut conn) => {
                        pending.complete();
                        conn.mark_counted();
                        inner.counters.borrowed.fetch_add(1, Ordering::SeqCst);
                        debug!(pool = %inner.name(), connection_id = %conn.id(), "Acquired connection");
                        return Ok(conn);
                    }
                    Err(e) => {
                        warn!(pool = %inner.name(), attempt, error = %e, "Failed to open connection");
                        last_error = Some(e);
                    }
                },
                Ok(Err(_)) => return Err(HarnessError::pool_closed(inner.name())),
                Err(_) => {
                    debug!(pool = %inner.name(), attempt, "Timed out waiting for a connection");
                }
            }
            if inner.is_closed() {
                return Err(HarnessError::pool_closed(inner.name()));
            }
            if attempt < attempts_allowed {
                tokio::time::sleep(inner.config.retry_delay * attempt).await;
            }
        }

        let waited_ms = started.elapsed().as_millis() as u64;
        warn!(
            pool = %inner.name(),
            attempts = attempts_allowed,
            waited_ms,
            last_error = ?last_error.map(|e| e.to_string()),
            "Pool exhausted"
        );
        inner.emit(PoolEvent::Exhausted {
            pool: inner.name().to_string(),
            attempts: attempts_allowed,
        });
        Err(HarnessError::pool_exhausted(
            inner.name(),
            attempts_allowed,
            waited_ms,
        ))
    }

    /// Turn a permit into a connection: reuse an idle one (validated when
    /// `test_on_borrow` is set) or open a new one.
    async fn checkout(&self, mut permit: OwnedSemaphorePermit) -> HarnessResult<PooledConnection> {
        let inner = &self.inner;
        loop {
            let candidate = {
                let mut state = inner.state.lock();
                match state.idle.pop_back() {
                    Some(idle) => {
                        state.active += 1;
                        Some(idle)
                    }
                    None => {
                        state.creating += 1;
                        None
                    }
                }
            };

            match candidate {
                Some(idle) => {
                    let mut conn = PooledConnection::new(Arc::clone(inner), idle, permit);
                    if !inner.config.test_on_borrow {
                        return Ok(conn);
                    }
                    match conn.ping().await {
                        Ok(()) => return Ok(conn),
                        Err(e) => {
                            warn!(
                                pool = %inner.name(),
                                connection_id = %conn.id(),
                                error = %e,
                                "Idle connection failed validation, destroying"
                            );
                            permit = conn.destroy_keep_permit().await?;
                        }
                    }
                }
                None => {
                    let guard = CreatingGuard::new(inner);
                    let idle = inner.open_connection().await?;
                    guard.promote_active();
                    return Ok(PooledConnection::new(Arc::clone(inner), idle, permit));
                }
            }
        }
    }

    /// Acquire, fetch, release.
    pub async fn query(&self, statement: &str, params: &[QueryParam]) -> HarnessResult<Vec<Record>> {
        let mut conn = self.acquire().await?;
        let result = conn.fetch(statement, params).await;
        conn.release().await;
        result
    }

    /// Acquire, execute, release.
    pub async fn execute(&self, statement: &str, params: &[QueryParam]) -> HarnessResult<u64> {
        let mut conn = self.acquire().await?;
        let result = conn.execute(statement, params).await;
        conn.release().await;
        result
    }

    /// Run `f` on a pooled connection and release it on every exit path.
    ///
    /// A panic inside `f` destroys the connection and resumes unwinding.
    pub async fn with_connection<T, F>(&self, f: F) -> HarnessResult<T>
    where
        F: for<'c> FnOnce(&'c mut PooledConnection) -> BoxFuture<'c, HarnessResult<T>>,
    {
        let mut conn = self.acquire().await?;
        let outcome = AssertUnwindSafe(f(&mut conn)).catch_unwind().await;
        match outcome {
            Ok(result) => {
                conn.release().await;
                result
            }
            Err(panic) => {
                conn.discard().await;
                std::panic::resume_unwind(panic)
            }
        }
    }

    /// Run `f` inside a backend transaction: commit on `Ok`, roll back on
    /// `Err` or panic.
    pub async fn transaction<T, F>(&self, f: F) -> HarnessResult<T>
    where
        F: for<'c> FnOnce(&'c mut PooledConnection) -> BoxFuture<'c, HarnessResult<T>>,
    {
        let mut conn = self.acquire().await?;
        if let Err(e) = conn.begin().await {
            conn.release().await;
            return Err(e);
        }

        let outcome = AssertUnwindSafe(f(&mut conn)).catch_unwind().await;
        match outcome {
            Ok(Ok(value)) => match conn.commit().await {
                Ok(()) => {
                    conn.release().await;
                    Ok(value)
                }
                Err(e) => {
                    conn.discard().await;
                    Err(e)
                }
            },
            Ok(Err(e)) => {
                match conn.rollback().await {
                    Ok(()) => conn.release().await,
                    Err(rollback_err) => {
                        warn!(pool = %self.name(), error = %rollback_err, "Rollback failed");
                        conn.discard().await;
                    }
                }
                Err(e)
            }
            Err(panic) => {
                let _ = conn.rollback().await;
                conn.discard().await;
                std::panic::resume_unwind(panic)
            }
        }
    }

    /// Ping the backend once and update the health state.
    ///
    /// Returns `Ok(false)` when the ping failed; three consecutive failures
    /// mark the pool unhealthy and emit [`PoolEvent::Unhealthy`].
    pub async fn health_check(&self) -> HarnessResult<bool> {
        if self.is_closed() {
            return Err(HarnessError::pool_closed(self.name()));
        }
        let outcome = self.ping_backend().await;
        Ok(self.inner.record_health(&outcome))
    }

    async fn ping_backend(&self) -> HarnessResult<()> {
        // Every slot busy: the backend is evidently serving
        let Ok(permit) = Arc::clone(&self.inner.semaphore).try_acquire_owned() else {
            return Ok(());
        };
        let mut conn = self.checkout(permit).await?;
        match conn.ping().await {
            Ok(()) => {
                conn.release().await;
                Ok(())
            }
            Err(e) => {
                conn.discard().await;
                Err(e)
            }
        }
    }

    async fn run_maintenance(&self) {
        if let Err(e) = self.health_check().await {
            debug!(pool = %self.name(), error = %e, "Health check skipped");
        }
        self.inner.reap_idle().await;
        if !self.is_closed() {
            let min = self.inner.config.min_connections as usize;
            if let Err(e) = self.inner.fill_to(min).await {
                debug!(pool = %self.name(), error = %e, "Could not top up pool");
            }
        }
    }

    fn spawn_health_task(&self) {
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.health_check_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if inner.is_closed() {
                    break;
                }
                ConnectionPool { inner }.run_maintenance().await;
            }
        });
        *self.inner.health_task.lock() = Some(handle);
    }

    pub fn stats(&self) -> PoolStats {
        let (idle, active) = {
            let state = self.inner.state.lock();
            (state.idle.len(), state.active)
        };
        let counters = &self.inner.counters;
        PoolStats {
            max: self.inner.config.max_connections,
            total: idle + active,
            idle,
            active,
            pending: counters.pending.load(Ordering::SeqCst),
            created: counters.created.load(Ordering::SeqCst),
            destroyed: counters.destroyed.load(Ordering::SeqCst),
            borrowed: counters.borrowed.load(Ordering::SeqCst),
            returned: counters.returned.load(Ordering::SeqCst),
            failed: counters.failed.load(Ordering::SeqCst),
            healthy: self.is_healthy(),
        }
    }

    /// Stop the health loop and close idle connections. Connections still
    /// checked out are destroyed when they come back.
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        inner.semaphore.close();
        if let Some(handle) = inner.health_task.lock().take() {
            handle.abort();
        }
        let idle: Vec<IdleConnection> = inner.state.lock().idle.drain(..).collect();
        let count = idle.len();
        for conn in idle {
            inner.destroy(conn.id, conn.conn).await;
        }
        info!(pool = %inner.name(), closed_idle = count, "Pool closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::document::{DocumentConnector, DocumentStore};
    use crate::models::BackendDescriptor;
    use std::time::Duration;

    fn pool_with(store: &Arc<DocumentStore>, min: u32, max: u32) -> ConnectionPool {
        let config = ConnectionPoolConfig::new("test", BackendDescriptor::document("t"))
            .with_size(min, max)
            .with_acquire_timeout(Duration::from_millis(50))
            .with_retries(0, Duration::from_millis(1));
        ConnectionPool::new(config, Arc::new(DocumentConnector::new(Arc::clone(store)))).unwrap()
    }

    fn assert_invariants(pool: &ConnectionPool) {
        let stats = pool.stats();
        assert_eq!(stats.total, stats.idle + stats.active);
        assert!(stats.total <= stats.max as usize);
    }

    #[tokio::test]
    async fn test_initialize_opens_min_connections() {
        let store = DocumentStore::new("t");
        let pool = pool_with(&store, 2, 4);
        pool.initialize().await.unwrap();
        let stats = pool.stats();
        assert_eq!(stats.idle, 2);
        assert_eq!(stats.created, 2);
        pool.close().await;
    }

    #[tokio::test]
    async fn test_initialize_fails_when_unreachable() {
        let store = DocumentStore::new("t");
        store.set_available(false);
        let pool = pool_with(&store, 1, 2);
        let err = pool.initialize().await.unwrap_err();
        assert!(matches!(
            err,
            HarnessError::PoolInitialization { attempts: 1, .. }
        ));
    }

    #[tokio::test]
    async fn test_acquire_release_reuses_connection() {
        let store = DocumentStore::new("t");
        let pool = pool_with(&store, 0, 2);
        let conn = pool.acquire().await.unwrap();
        let id = conn.id().to_string();
        assert_eq!(pool.stats().active, 1);
        conn.release().await;
        assert_invariants(&pool);

        let again = pool.acquire().await.unwrap();
        assert_eq!(again.id(), id);
        drop(again);
        let stats = pool.stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.borrowed, 2);
        assert_eq!(stats.returned, 2);
    }

    #[tokio::test]
    async fn test_exhausted_pool_times_out() {
        let store = DocumentStore::new("t");
        let pool = pool_with(&store, 0, 1);
        let _held = pool.acquire().await.unwrap();
        let started = Instant::now();
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, HarnessError::PoolExhausted { .. }));
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(pool.stats().failed, 1);
        assert_invariants(&pool);
    }

    #[tokio::test]
    async fn test_cancelled_acquire_counts_as_failed() {
        let store = DocumentStore::new("t");
        let pool = pool_with(&store, 0, 1);
        let _held = pool.acquire().await.unwrap();
        let cancelled = tokio::time::timeout(Duration::from_millis(10), pool.acquire()).await;
        assert!(cancelled.is_err());
        let stats = pool.stats();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn test_broken_idle_connection_is_replaced_on_borrow() {
        let store = DocumentStore::new("t");
        let pool = pool_with(&store, 1, 2);
        pool.initialize().await.unwrap();
        store.set_available(false);
        assert!(pool.acquire().await.is_err());
        store.set_available(true);
        let conn = pool.acquire().await.unwrap();
        assert!(pool.stats().destroyed >= 1);
        conn.release().await;
        assert_invariants(&pool);
        pool.close().await;
    }

    #[tokio::test]
    async fn test_three_failures_mark_unhealthy() {
        let store = DocumentStore::new("t");
        let pool = pool_with(&store, 1, 2);
        pool.initialize().await.unwrap();
        let mut events = pool.subscribe();

        store.set_available(false);
        for _ in 0..3 {
            assert!(!pool.health_check().await.unwrap());
        }
        assert!(!pool.is_healthy());
        let mut saw_unhealthy = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, PoolEvent::Unhealthy { consecutive_failures: 3, .. }) {
                saw_unhealthy = true;
            }
        }
        assert!(saw_unhealthy);

        store.set_available(true);
        assert!(pool.health_check().await.unwrap());
        assert!(pool.is_healthy());
        pool.close().await;
    }

    #[tokio::test]
    async fn test_with_connection_releases_on_error() {
        let store = DocumentStore::new("t");
        let pool = pool_with(&store, 0, 1);
        let result: HarnessResult<()> = pool
            .with_connection(|conn| {
                Box::pin(async move {
                    conn.execute("SELECT 1", &[]).await?;
                    Ok(())
                })
            })
            .await;
        assert!(matches!(result, Err(HarnessError::Unsupported { .. })));
        let stats = pool.stats();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.idle, 1);
    }

    #[tokio::test]
    async fn test_transaction_wrapper_rolls_back_on_error() {
        let store = DocumentStore::new("t");
        let pool = pool_with(&store, 0, 1);
        let result: HarnessResult<()> = pool
            .transaction(|conn| {
                Box::pin(async move {
                    let record = serde_json::json!({"name": "x"})
                        .as_object()
                        .cloned()
                        .unwrap_or_default();
                    conn.insert("users", &[record]).await?;
                    Err(HarnessError::invalid_input("abort"))
                })
            })
            .await;
        assert!(result.is_err());
        assert!(store.documents("users").is_empty());
        assert_eq!(pool.stats().active, 0);
    }

    #[tokio::test]
    async fn test_closed_pool_rejects_acquire() {
        let store = DocumentStore::new("t");
        let pool = pool_with(&store, 1, 2);
        pool.initialize().await.unwrap();
        let held = pool.acquire().await.unwrap();
        pool.close().await;
        assert!(matches!(
            pool.acquire().await,
            Err(HarnessError::PoolClosed { .. })
        ));
        held.release().await;
        assert_eq!(pool.stats().idle, 0);
    }
}
