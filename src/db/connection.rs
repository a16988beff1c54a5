//! A connection checked out of a [`ConnectionPool`](crate::db::ConnectionPool).

use crate::db::backend::{BackendConnection, ClearMode};
use crate::db::observer::QueryObserver;
use crate::db::pool::{IdleConnection, PoolInner};
use crate::error::{HarnessError, HarnessResult};
use crate::models::{BackendCapabilities, BackendKind, ForeignKey, QueryParam, Record};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OwnedSemaphorePermit;
use tracing::warn;

/// Error reported for an operation whose future was dropped mid-flight.
pub const CANCELLED: &str = "cancelled";

/// An operation reported to the pool's observer.
///
/// Dropped without [`QueryTrace::finish`] (the caller's future was
/// cancelled), it reports the operation as [`CANCELLED`].
struct QueryTrace {
    observer: Arc<dyn QueryObserver>,
    query_id: String,
    finished: bool,
}

impl QueryTrace {
    fn finish<T>(mut self, result: &HarnessResult<T>, rows: impl FnOnce(&T) -> Option<u64>) {
        self.finished = true;
        match result {
            Ok(value) => self.observer.on_query_end(&self.query_id, rows(value), None),
            Err(e) => self
                .observer
                .on_query_end(&self.query_id, None, Some(&e.to_string())),
        }
    }
}

impl Drop for QueryTrace {
    fn drop(&mut self) {
        if !self.finished {
            self.observer.on_query_end(&self.query_id, None, Some(CANCELLED));
        }
    }
}

/// Run a backend call, or fail if the connection was already handed back.
macro_rules! on_backend {
    ($self:ident, $conn:ident => $call:expr) => {
        match $self.conn.as_mut() {
            Some($conn) => $call.await,
            None => Err(HarnessError::internal(format!(
                "Connection '{}' was already released",
                $self.id
            ))),
        }
    };
}

/// Exclusive handle on one pooled connection.
///
/// Dropping the handle returns the connection to the pool; a connection
/// dropped with an open transaction is destroyed instead, which makes the
/// backend roll the transaction back. Prefer [`PooledConnection::release`]
/// in async code so `test_on_return` validation can run.
pub struct PooledConnection {
    id: String,
    kind: BackendKind,
    conn: Option<Box<dyn BackendConnection>>,
    created_at: Instant,
    in_transaction: bool,
    counted: bool,
    pool: Arc<PoolInner>,
    permit: Option<OwnedSemaphorePermit>,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("pool", &self.pool.name())
            .field("kind", &self.kind)
            .field("in_transaction", &self.in_transaction)
            .finish_non_exhaustive()
    }
}

impl PooledConnection {
    pub(crate) fn new(pool: Arc<PoolInner>, idle: IdleConnection, permit: OwnedSemaphorePermit) -> Self {
        Self {
            id: idle.id,
            kind: pool.kind(),
            conn: Some(idle.conn),
            created_at: idle.created_at,
            in_transaction: false,
            counted: false,
            pool,
            permit: Some(permit),
        }
    }

    pub(crate) fn mark_counted(&mut self) {
        self.counted = true;
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pool_name(&self) -> &str {
        self.pool.name()
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn capabilities(&self) -> BackendCapabilities {
        self.conn
            .as_ref()
            .map(|c| c.capabilities())
            .unwrap_or_else(|| self.kind.capabilities())
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    fn trace(&self, label: &str, params: &[QueryParam]) -> Option<QueryTrace> {
        let observer = self.pool.observer()?;
        let query_id = observer.on_query_start(label, params, self.kind, &self.id);
        Some(QueryTrace {
            observer,
            query_id,
            finished: false,
        })
    }

    fn finish<T>(trace: Option<QueryTrace>, result: &HarnessResult<T>, rows: impl FnOnce(&T) -> Option<u64>) {
        if let Some(trace) = trace {
            trace.finish(result, rows);
        }
    }

    pub async fn ping(&mut self) -> HarnessResult<()> {
        on_backend!(self, conn => conn.ping())
    }

    pub async fn execute(&mut self, statement: &str, params: &[QueryParam]) -> HarnessResult<u64> {
        let trace = self.trace(statement, params);
        let result = on_backend!(self, conn => conn.execute(statement, params));
        Self::finish(trace, &result, |n| Some(*n));
        result
    }

    pub async fn fetch(&mut self, statement: &str, params: &[QueryParam]) -> HarnessResult<Vec<Record>> {
        let trace = self.trace(statement, params);
        let result = on_backend!(self, conn => conn.fetch(statement, params));
        Self::finish(trace, &result, |rows| Some(rows.len() as u64));
        result
    }

    pub async fn execute_script(&mut self, script: &str) -> HarnessResult<()> {
        let trace = self.trace(script, &[]);
        let result = on_backend!(self, conn => conn.execute_script(script));
        Self::finish(trace, &result, |_| None);
        result
    }

    pub async fn begin(&mut self) -> HarnessResult<()> {
        let trace = self.trace("BEGIN", &[]);
        let result = on_backend!(self, conn => conn.begin());
        Self::finish(trace, &result, |_| None);
        if result.is_ok() {
            self.in_transaction = true;
        }
        result
    }

    pub async fn commit(&mut self) -> HarnessResult<()> {
        let trace = self.trace("COMMIT", &[]);
        let result = on_backend!(self, conn => conn.commit());
        Self::finish(trace, &result, |_| None);
        if result.is_ok() {
            self.in_transaction = false;
        }
        result
    }

    pub async fn rollback(&mut self) -> HarnessResult<()> {
        let trace = self.trace("ROLLBACK", &[]);
        let result = on_backend!(self, conn => conn.rollback());
        Self::finish(trace, &result, |_| None);
        if result.is_ok() {
            self.in_transaction = false;
        }
        result
    }

    pub async fn savepoint(&mut self, name: &str) -> HarnessResult<()> {
        let trace = self.trace(&format!("SAVEPOINT {name}"), &[]);
        let result = on_backend!(self, conn => conn.savepoint(name));
        Self::finish(trace, &result, |_| None);
        result
    }

    pub async fn rollback_to_savepoint(&mut self, name: &str) -> HarnessResult<()> {
        let trace = self.trace(&format!("ROLLBACK TO SAVEPOINT {name}"), &[]);
        let result = on_backend!(self, conn => conn.rollback_to_savepoint(name));
        Self::finish(trace, &result, |_| None);
        result
    }

    pub async fn release_savepoint(&mut self, name: &str) -> HarnessResult<()> {
        let trace = self.trace(&format!("RELEASE SAVEPOINT {name}"), &[]);
        let result = on_backend!(self, conn => conn.release_savepoint(name));
        Self::finish(trace, &result, |_| None);
        result
    }

    /// Insert `records` and return them as stored, generated keys included.
    pub async fn insert(&mut self, collection: &str, records: &[Record]) -> HarnessResult<Vec<Record>> {
        let trace = self.trace(&format!("INSERT INTO {collection}"), &[]);
        let result = on_backend!(self, conn => conn.insert(collection, records));
        Self::finish(trace, &result, |rows| Some(rows.len() as u64));
        result
    }

    pub async fn list_collections(&mut self) -> HarnessResult<Vec<String>> {
        on_backend!(self, conn => conn.list_collections())
    }

    pub async fn count(&mut self, collection: &str) -> HarnessResult<u64> {
        let trace = self.trace(&format!("SELECT COUNT(*) FROM {collection}"), &[]);
        let result = on_backend!(self, conn => conn.count(collection));
        Self::finish(trace, &result, |_| None);
        result
    }

    pub async fn clear(&mut self, collection: &str, mode: ClearMode) -> HarnessResult<u64> {
        let label = match mode {
            ClearMode::Truncate { .. } => format!("TRUNCATE TABLE {collection}"),
            ClearMode::Delete => format!("DELETE FROM {collection}"),
        };
        let trace = self.trace(&label, &[]);
        let result = on_backend!(self, conn => conn.clear(collection, mode));
        Self::finish(trace, &result, |n| Some(*n));
        result
    }

    pub async fn reset_sequence(&mut self, collection: &str) -> HarnessResult<()> {
        let trace = self.trace(&format!("RESET SEQUENCE {collection}"), &[]);
        let result = on_backend!(self, conn => conn.reset_sequence(collection));
        Self::finish(trace, &result, |_| None);
        result
    }

    pub async fn foreign_keys(&mut self) -> HarnessResult<Vec<ForeignKey>> {
        on_backend!(self, conn => conn.foreign_keys())
    }

    /// Return the connection to the pool, validating it first when the pool
    /// tests on return. A connection that fails validation is destroyed and
    /// the pool refills toward its minimum in the background.
    pub async fn release(mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        let pool = Arc::clone(&self.pool);
        if self.in_transaction {
            warn!(
                pool = %pool.name(),
                connection_id = %self.id,
                "Connection released inside an open transaction, destroying"
            );
            pool.release_slot(self.counted);
            pool.destroy(self.id.clone(), conn).await;
            return;
        }
        if pool.config.test_on_return {
            if let Err(e) = conn.ping().await {
                warn!(
                    pool = %pool.name(),
                    connection_id = %self.id,
                    error = %e,
                    "Connection failed validation on return, destroying"
                );
                pool.release_slot(self.counted);
                pool.destroy(self.id.clone(), conn).await;
                pool.spawn_replenish();
                return;
            }
        }
        pool.checkin(self.id.clone(), conn, self.created_at, self.counted);
    }

    /// Destroy the connection instead of returning it.
    pub async fn discard(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release_slot(self.counted);
            self.pool.destroy(self.id.clone(), conn).await;
        }
    }

    /// Destroy the connection but hand its permit back to the caller.
    pub(crate) async fn destroy_keep_permit(mut self) -> HarnessResult<OwnedSemaphorePermit> {
        let permit = self
            .permit
            .take()
            .ok_or_else(|| HarnessError::internal("Connection permit already released"))?;
        if let Some(conn) = self.conn.take() {
            self.pool.release_slot(false);
            self.pool.destroy(self.id.clone(), conn).await;
        }
        Ok(permit)
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if self.in_transaction {
            warn!(
                pool = %self.pool.name(),
                connection_id = %self.id,
                "Connection dropped inside an open transaction, destroying"
            );
            self.pool.release_slot(self.counted);
            self.pool.spawn_destroy(self.id.clone(), conn);
        } else {
            self.pool
                .checkin(self.id.clone(), conn, self.created_at, self.counted);
        }
    }
}
