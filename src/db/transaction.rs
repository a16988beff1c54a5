//! Per-test transactions with named savepoints.
//!
//! Each active transaction owns one pooled connection for its whole life.
//! The connection sits behind its own async mutex so unrelated transactions
//! never contend; the registry map is only locked to look entries up.
//!
//! Backends without savepoints get a degraded strategy: rolling back to a
//! savepoint aborts and restarts the whole transaction, and the caller is
//! told so through [`SavepointRollback::degraded`].

use crate::db::connection::PooledConnection;
use crate::db::dialect::validate_identifier;
use crate::db::pool::ConnectionPool;
use crate::error::{HarnessError, HarnessResult};
use crate::models::{BackendCapabilities, BackendKind, QueryParam, Record};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMappedMutexGuard, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Default age after which the expiry task rolls a transaction back.
pub const DEFAULT_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(300);

const EXPIRY_INTERVAL: Duration = Duration::from_secs(5);

/// Exclusive access to a transaction's connection.
pub type TransactionConnection = OwnedMappedMutexGuard<Option<PooledConnection>, PooledConnection>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Starting,
    Active,
    Committed,
    RolledBack,
}

#[derive(Debug)]
struct ContextShared {
    state: parking_lot::Mutex<TransactionState>,
    savepoints: parking_lot::Mutex<Vec<String>>,
}

/// Handle on one test's transaction. Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct TransactionContext {
    id: String,
    test_id: String,
    started_at: DateTime<Utc>,
    backend: BackendKind,
    capabilities: BackendCapabilities,
    connection_id: String,
    shared: Arc<ContextShared>,
}

impl TransactionContext {
    fn new(test_id: &str, conn: &PooledConnection) -> Self {
        Self {
            id: generate_transaction_id(),
            test_id: test_id.to_string(),
            started_at: Utc::now(),
            backend: conn.kind(),
            capabilities: conn.capabilities(),
            connection_id: conn.id().to_string(),
            shared: Arc::new(ContextShared {
                state: parking_lot::Mutex::new(TransactionState::Starting),
                savepoints: parking_lot::Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn test_id(&self) -> &str {
        &self.test_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    pub fn capabilities(&self) -> BackendCapabilities {
        self.capabilities
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn state(&self) -> TransactionState {
        *self.shared.state.lock()
    }

    pub fn is_active(&self) -> bool {
        self.state() == TransactionState::Active
    }

    /// Savepoint names, oldest first.
    pub fn savepoints(&self) -> Vec<String> {
        self.shared.savepoints.lock().clone()
    }

    fn set_state(&self, state: TransactionState) {
        *self.shared.state.lock() = state;
    }

    fn ensure_active(&self) -> HarnessResult<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(HarnessError::transaction_inactive(&self.id))
        }
    }

    fn savepoint_position(&self, name: &str) -> HarnessResult<usize> {
        self.shared
            .savepoints
            .lock()
            .iter()
            .position(|sp| sp == name)
            .ok_or_else(|| HarnessError::savepoint_not_found(name, &self.id))
    }
}

/// Outcome of [`TransactionManager::rollback_to_savepoint`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SavepointRollback {
    pub savepoint: String,
    /// The backend has no savepoints; the whole transaction was restarted
    pub degraded: bool,
    /// Savepoints created after the target, now gone
    pub discarded: Vec<String>,
}

/// Listing entry for [`TransactionManager::list_active`].
#[derive(Debug, Clone, Serialize)]
pub struct TransactionMetadata {
    pub transaction_id: String,
    pub test_id: String,
    pub connection_id: String,
    pub backend: BackendKind,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub savepoints: Vec<String>,
}

/// Result of [`TransactionManager::cleanup_all_transactions`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct TransactionCleanupReport {
    pub rolled_back: usize,
    /// `(transaction_id, error)` for rollbacks the backend rejected
    pub failed: Vec<(String, String)>,
}

struct ActiveTransaction {
    context: TransactionContext,
    connection: Arc<Mutex<Option<PooledConnection>>>,
    created_at: Instant,
}

type Registry = Arc<RwLock<HashMap<String, ActiveTransaction>>>;

/// Tracks every open test transaction on one pool.
#[derive(Clone)]
pub struct TransactionManager {
    pool: ConnectionPool,
    transactions: Registry,
    timeout: Duration,
    expiry_task: Arc<parking_lot::Mutex<Option<JoinHandle<()>>>>,
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("pool", &self.pool.name())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl TransactionManager {
    pub fn new(pool: ConnectionPool) -> Self {
        Self::with_timeout(pool, DEFAULT_TRANSACTION_TIMEOUT)
    }

    pub fn with_timeout(pool: ConnectionPool, timeout: Duration) -> Self {
        Self {
            pool,
            transactions: Arc::new(RwLock::new(HashMap::new())),
            timeout,
            expiry_task: Arc::new(parking_lot::Mutex::new(None)),
        }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Acquire a connection, begin a transaction on it and register it.
    pub async fn start_transaction(&self, test_id: &str) -> HarnessResult<TransactionContext> {
        let mut conn = self.pool.acquire().await?;
        if let Err(e) = conn.begin().await {
            warn!(test_id = %test_id, error = %e, "Failed to begin transaction");
            conn.release().await;
            return Err(e);
        }

        let context = TransactionContext::new(test_id, &conn);
        let entry = ActiveTransaction {
            context: context.clone(),
            connection: Arc::new(Mutex::new(Some(conn))),
            created_at: Instant::now(),
        };
        {
            let mut txs = self.transactions.write().await;
            txs.insert(context.id.clone(), entry);
        }
        context.set_state(TransactionState::Active);

        info!(
            transaction_id = %context.id,
            test_id = %test_id,
            connection_id = %context.connection_id,
            backend = %context.backend,
            "Transaction started"
        );
        Ok(context)
    }

    async fn slot(&self, ctx: &TransactionContext) -> HarnessResult<Arc<Mutex<Option<PooledConnection>>>> {
        ctx.ensure_active()?;
        let txs = self.transactions.read().await;
        txs.get(&ctx.id)
            .map(|entry| Arc::clone(&entry.connection))
            .ok_or_else(|| HarnessError::transaction_inactive(&ctx.id))
    }

    /// Lock the transaction's connection for one call chain.
    pub async fn connection(&self, ctx: &TransactionContext) -> HarnessResult<TransactionConnection> {
        let slot = self.slot(ctx).await?;
        let guard = slot.lock_owned().await;
        tokio::sync::OwnedMutexGuard::try_map(guard, |conn| conn.as_mut())
            .map_err(|_| HarnessError::transaction_inactive(&ctx.id))
    }

    pub async fn execute(
        &self,
        ctx: &TransactionContext,
        statement: &str,
        params: &[QueryParam],
    ) -> HarnessResult<u64> {
        let mut conn = self.connection(ctx).await?;
        let rows_affected = conn.execute(statement, params).await?;
        debug!(transaction_id = %ctx.id, rows_affected, "Executed in transaction");
        Ok(rows_affected)
    }

    pub async fn fetch(
        &self,
        ctx: &TransactionContext,
        statement: &str,
        params: &[QueryParam],
    ) -> HarnessResult<Vec<Record>> {
        let mut conn = self.connection(ctx).await?;
        conn.fetch(statement, params).await
    }

    /// Create a savepoint; `None` picks `sp_<n>`.
    ///
    /// On backends without savepoints the name is only recorded.
    pub async fn create_savepoint(
        &self,
        ctx: &TransactionContext,
        name: Option<&str>,
    ) -> HarnessResult<String> {
        let mut conn = self.connection(ctx).await?;
        let name = match name {
            Some(name) => name.to_string(),
            None => format!("sp_{}", ctx.shared.savepoints.lock().len() + 1),
        };
        if name.contains('.') {
            return Err(HarnessError::invalid_input(format!(
                "Savepoint name '{name}' must be a plain identifier"
            )));
        }
        validate_identifier(&name)?;
        if ctx.shared.savepoints.lock().contains(&name) {
            return Err(HarnessError::invalid_input(format!(
                "Savepoint '{name}' already exists in transaction {}",
                ctx.id
            )));
        }

        if ctx.capabilities.supports_savepoints {
            conn.savepoint(&name).await?;
        } else {
            debug!(
                transaction_id = %ctx.id,
                savepoint = %name,
                "Backend has no savepoints, recording name only"
            );
        }
        ctx.shared.savepoints.lock().push(name.clone());
        debug!(transaction_id = %ctx.id, savepoint = %name, "Savepoint created");
        Ok(name)
    }

    /// Undo everything after savepoint `name`. The savepoint itself stays.
    pub async fn rollback_to_savepoint(
        &self,
        ctx: &TransactionContext,
        name: &str,
    ) -> HarnessResult<SavepointRollback> {
        let mut conn = self.connection(ctx).await?;
        let position = ctx.savepoint_position(name)?;

        if ctx.capabilities.supports_savepoints {
            conn.rollback_to_savepoint(name).await?;
            let discarded = ctx.shared.savepoints.lock().split_off(position + 1);
            debug!(transaction_id = %ctx.id, savepoint = %name, "Rolled back to savepoint");
            return Ok(SavepointRollback {
                savepoint: name.to_string(),
                degraded: false,
                discarded,
            });
        }

        warn!(
            transaction_id = %ctx.id,
            savepoint = %name,
            backend = %ctx.backend,
            "No savepoint support, restarting the whole transaction"
        );
        let restarted = match conn.rollback().await {
            Ok(()) => conn.begin().await,
            Err(e) => Err(e),
        };
        if let Err(e) = restarted {
            drop(conn);
            self.abandon(ctx).await;
            return Err(e);
        }
        let discarded = ctx.shared.savepoints.lock().split_off(position + 1);
        Ok(SavepointRollback {
            savepoint: name.to_string(),
            degraded: true,
            discarded,
        })
    }

    /// Drop savepoint `name` and every later one, keeping their work.
    pub async fn release_savepoint(&self, ctx: &TransactionContext, name: &str) -> HarnessResult<()> {
        let mut conn = self.connection(ctx).await?;
        let position = ctx.savepoint_position(name)?;
        if ctx.capabilities.supports_savepoints {
            conn.release_savepoint(name).await?;
        }
        ctx.shared.savepoints.lock().truncate(position);
        debug!(transaction_id = %ctx.id, savepoint = %name, "Savepoint released");
        Ok(())
    }

    pub async fn commit_transaction(&self, ctx: &TransactionContext) -> HarnessResult<()> {
        self.finish(ctx, true).await
    }

    pub async fn rollback_transaction(&self, ctx: &TransactionContext) -> HarnessResult<()> {
        self.finish(ctx, false).await
    }

    async fn take(&self, ctx: &TransactionContext) -> HarnessResult<ActiveTransaction> {
        ctx.ensure_active()?;
        let mut txs = self.transactions.write().await;
        txs.remove(&ctx.id)
            .ok_or_else(|| HarnessError::transaction_inactive(&ctx.id))
    }

    /// Terminate the context and hand its connection back exactly once.
    async fn finish(&self, ctx: &TransactionContext, commit: bool) -> HarnessResult<()> {
        let entry = self.take(ctx).await?;
        let final_state = if commit {
            TransactionState::Committed
        } else {
            TransactionState::RolledBack
        };
        ctx.set_state(final_state);

        let conn = entry.connection.lock().await.take();
        let Some(mut conn) = conn else {
            return Err(HarnessError::transaction_inactive(&ctx.id));
        };
        let result = if commit {
            conn.commit().await
        } else {
            conn.rollback().await
        };
        let duration_ms = entry.created_at.elapsed().as_millis() as u64;

        match result {
            Ok(()) => {
                conn.release().await;
                info!(
                    transaction_id = %ctx.id,
                    state = ?final_state,
                    duration_ms,
                    "Transaction finished"
                );
                Ok(())
            }
            Err(e) => {
                error!(
                    transaction_id = %ctx.id,
                    commit,
                    error = %e,
                    "Transaction end failed, destroying connection"
                );
                if commit {
                    ctx.set_state(TransactionState::RolledBack);
                }
                conn.discard().await;
                Err(e)
            }
        }
    }

    /// Drop a transaction whose connection is in an unknown state.
    async fn abandon(&self, ctx: &TransactionContext) {
        let entry = {
            let mut txs = self.transactions.write().await;
            txs.remove(&ctx.id)
        };
        ctx.set_state(TransactionState::RolledBack);
        if let Some(entry) = entry {
            if let Some(conn) = entry.connection.lock().await.take() {
                conn.discard().await;
            }
        }
    }

    /// Roll back every tracked transaction.
    pub async fn cleanup_all_transactions(&self) -> TransactionCleanupReport {
        let entries: Vec<ActiveTransaction> = {
            let mut txs = self.transactions.write().await;
            txs.drain().map(|(_, entry)| entry).collect()
        };
        if !entries.is_empty() {
            info!(count = entries.len(), "Rolling back remaining transactions");
        }
        rollback_entries(entries).await
    }

    pub async fn active_count(&self) -> usize {
        self.transactions.read().await.len()
    }

    pub async fn list_active(&self) -> Vec<TransactionMetadata> {
        let txs = self.transactions.read().await;
        let mut listed: Vec<TransactionMetadata> = txs
            .values()
            .map(|entry| TransactionMetadata {
                transaction_id: entry.context.id.clone(),
                test_id: entry.context.test_id.clone(),
                connection_id: entry.context.connection_id.clone(),
                backend: entry.context.backend,
                started_at: entry.context.started_at,
                duration_ms: entry.created_at.elapsed().as_millis() as u64,
                savepoints: entry.context.savepoints(),
            })
            .collect();
        listed.sort_by_key(|meta| meta.started_at);
        listed
    }

    /// Roll back transactions older than the configured timeout every few
    /// seconds. Restarting replaces the previous task.
    pub fn start_expiry_task(&self) {
        let weak = Arc::downgrade(&self.transactions);
        let timeout = self.timeout;
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(EXPIRY_INTERVAL);
            loop {
                interval.tick().await;
                let Some(transactions) = weak.upgrade() else {
                    break;
                };
                let expired = take_expired(&transactions, timeout).await;
                drop(transactions);
                if !expired.is_empty() {
                    warn!(count = expired.len(), "Rolling back expired transactions");
                    rollback_entries(expired).await;
                }
            }
        });
        if let Some(previous) = self.expiry_task.lock().replace(handle) {
            previous.abort();
        }
    }

    pub fn stop_expiry_task(&self) {
        if let Some(handle) = self.expiry_task.lock().take() {
            handle.abort();
        }
    }

    /// Roll back transactions older than the configured timeout now.
    pub async fn expire_now(&self) -> usize {
        let expired = take_expired(&self.transactions, self.timeout).await;
        rollback_entries(expired).await.rolled_back
    }
}

async fn take_expired(transactions: &Registry, timeout: Duration) -> Vec<ActiveTransaction> {
    let mut txs = transactions.write().await;
    let expired_ids: Vec<String> = txs
        .iter()
        .filter(|(_, entry)| entry.created_at.elapsed() > timeout)
        .map(|(id, _)| id.clone())
        .collect();
    expired_ids
        .iter()
        .filter_map(|id| txs.remove(id))
        .collect()
}

async fn rollback_entries(entries: Vec<ActiveTransaction>) -> TransactionCleanupReport {
    let mut report = TransactionCleanupReport::default();
    for entry in entries {
        let id = entry.context.id.clone();
        entry.context.set_state(TransactionState::RolledBack);
        let Some(mut conn) = entry.connection.lock().await.take() else {
            continue;
        };
        match conn.rollback().await {
            Ok(()) => {
                conn.release().await;
                report.rolled_back += 1;
                debug!(transaction_id = %id, "Rolled back");
            }
            Err(e) => {
                error!(transaction_id = %id, error = %e, "Rollback failed, destroying connection");
                conn.discard().await;
                report.failed.push((id, e.to_string()));
            }
        }
    }
    report
}

fn generate_transaction_id() -> String {
    format!("tx_{}", uuid::Uuid::new_v4().simple())
}
