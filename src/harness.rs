//! One-stop test harness.
//!
//! Bundles a pool with the transaction manager, seeder, cleaner and
//! performance monitor that work against it. Each test runs inside its own
//! transaction, which is rolled back when the test ends.

use crate::cleaner::{Cleaner, CleanupConfig, CleanupResult};
use crate::db::pool::ConnectionPool;
use crate::db::transaction::{
    DEFAULT_TRANSACTION_TIMEOUT, TransactionCleanupReport, TransactionContext, TransactionManager,
};
use crate::error::HarnessResult;
use crate::fixtures::{SeedReport, Seeder, SeederConfig};
use crate::models::ConnectionPoolConfig;
use crate::monitor::{PerformanceMonitor, PerformanceThresholds};
use chrono::Utc;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub pool: ConnectionPoolConfig,
    pub seeder: SeederConfig,
    pub cleanup: CleanupConfig,
    pub thresholds: PerformanceThresholds,
    pub transaction_timeout: Duration,
    /// Run the monitor's background load sampler
    pub sample_load: bool,
}

impl HarnessConfig {
    pub fn new(pool: ConnectionPoolConfig) -> Self {
        Self {
            pool,
            seeder: SeederConfig::default(),
            cleanup: CleanupConfig::default(),
            thresholds: PerformanceThresholds::default(),
            transaction_timeout: DEFAULT_TRANSACTION_TIMEOUT,
            sample_load: true,
        }
    }
}

pub struct TestHarness {
    pool: ConnectionPool,
    transactions: TransactionManager,
    seeder: Mutex<Seeder>,
    cleaner: Cleaner,
    monitor: PerformanceMonitor,
}

impl std::fmt::Debug for TestHarness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestHarness")
            .field("pool", &self.pool)
            .field("monitor", &self.monitor)
            .finish_non_exhaustive()
    }
}

impl TestHarness {
    /// Build the pool from `config.pool` and start everything.
    pub async fn start(config: HarnessConfig) -> HarnessResult<Self> {
        let pool = ConnectionPool::from_config(config.pool.clone())?;
        Self::with_pool(pool, config).await
    }

    /// Start on an existing pool, initializing it if needed.
    pub async fn with_pool(pool: ConnectionPool, config: HarnessConfig) -> HarnessResult<Self> {
        pool.initialize().await?;

        let monitor = PerformanceMonitor::new(config.thresholds);
        monitor.attach_pool(&pool);
        if config.sample_load {
            monitor.start_sampling();
        }

        let transactions = TransactionManager::with_timeout(pool.clone(), config.transaction_timeout);
        transactions.start_expiry_task();

        let cleaner = Cleaner::new(pool.clone(), config.cleanup)?;
        info!(pool = %pool.name(), backend = %pool.kind(), "Test harness ready");
        Ok(Self {
            transactions,
            seeder: Mutex::new(Seeder::new(config.seeder)),
            cleaner,
            monitor,
            pool,
        })
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    pub fn cleaner(&self) -> &Cleaner {
        &self.cleaner
    }

    pub fn monitor(&self) -> &PerformanceMonitor {
        &self.monitor
    }

    /// Exclusive access to the seeder for registration or lookups.
    pub async fn seeder(&self) -> MutexGuard<'_, Seeder> {
        self.seeder.lock().await
    }

    pub async fn begin_test(&self, test_id: &str) -> HarnessResult<TransactionContext> {
        self.transactions.start_transaction(test_id).await
    }

    /// Seed `names` (everything registered when `None`) inside the test's
    /// transaction.
    pub async fn seed(
        &self,
        ctx: &TransactionContext,
        names: Option<&[&str]>,
    ) -> HarnessResult<SeedReport> {
        let mut seeder = self.seeder.lock().await;
        seeder.seed_in(&self.transactions, ctx, names).await
    }

    /// End the test: commit when `commit` is set, roll back otherwise.
    ///
    /// The records seeded inside `ctx` are forgotten either way; other
    /// running tests keep theirs.
    pub async fn end_test(&self, ctx: &TransactionContext, commit: bool) -> HarnessResult<()> {
        let result = if commit {
            self.transactions.commit_transaction(ctx).await
        } else {
            self.transactions.rollback_transaction(ctx).await
        };
        self.seeder.lock().await.clear_seeded_data_for(ctx);
        result
    }

    /// Run `f` inside a fresh transaction that is always rolled back.
    ///
    /// A panic in `f` rolls back and then resumes unwinding.
    pub async fn run_isolated<T, F>(&self, test_id: &str, f: F) -> HarnessResult<T>
    where
        F: for<'a> FnOnce(&'a TestHarness, &'a TransactionContext) -> BoxFuture<'a, HarnessResult<T>>,
    {
        let ctx = self.begin_test(test_id).await?;
        let outcome = AssertUnwindSafe(f(self, &ctx)).catch_unwind().await;
        if ctx.is_active() {
            if let Err(e) = self.end_test(&ctx, false).await {
                warn!(test_id = %test_id, error = %e, "Rollback after isolated test failed");
            }
        } else {
            self.seeder.lock().await.clear_seeded_data_for(&ctx);
        }
        match outcome {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    /// Run `f` and count the operations it issued on the test's connection.
    pub async fn count_queries<T, F>(&self, ctx: &TransactionContext, f: F) -> HarnessResult<(T, usize)>
    where
        F: for<'a> FnOnce(&'a TestHarness, &'a TransactionContext) -> BoxFuture<'a, HarnessResult<T>>,
    {
        let mark = Utc::now();
        let value = f(self, ctx).await?;
        let count = self
            .monitor
            .records()
            .iter()
            .filter(|r| r.connection_id == ctx.connection_id() && r.started_at >= mark)
            .count();
        Ok((value, count))
    }

    /// Delete-based cleanup of everything not preserved.
    pub async fn clean(&self) -> HarnessResult<CleanupResult> {
        self.cleaner.cleanup().await
    }

    /// Roll back whatever is still open, stop background tasks and close the
    /// pool.
    pub async fn shutdown(&self) -> TransactionCleanupReport {
        self.transactions.stop_expiry_task();
        let report = self.transactions.cleanup_all_transactions().await;
        if !report.failed.is_empty() {
            warn!(failed = report.failed.len(), "Some transactions failed to roll back at shutdown");
        }
        self.monitor.stop_sampling();
        self.pool.clear_observer();
        self.pool.close().await;
        info!(pool = %self.pool.name(), rolled_back = report.rolled_back, "Test harness shut down");
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::document::{DocumentConnector, DocumentStore};
    use crate::fixtures::blueprints;
    use crate::models::BackendDescriptor;
    use std::sync::Arc;

    async fn harness(store: &Arc<DocumentStore>) -> TestHarness {
        let pool_config = ConnectionPoolConfig::new("docs", BackendDescriptor::document("t"))
            .with_size(1, 4)
            .with_acquire_timeout(Duration::from_millis(200));
        let pool = ConnectionPool::new(
            pool_config.clone(),
            Arc::new(DocumentConnector::new(Arc::clone(store))),
        )
        .unwrap();
        let mut config = HarnessConfig::new(pool_config);
        config.sample_load = false;
        config.seeder.rng_seed = Some(7);
        TestHarness::with_pool(pool, config).await.unwrap()
    }

    #[tokio::test]
    async fn test_run_isolated_rolls_back() {
        let store = DocumentStore::new("t");
        store.create_collection("users");
        let harness = harness(&store).await;
        harness.seeder().await.register(blueprints::users(3)).unwrap();

        let seeded = harness
            .run_isolated("seeds_users", |h, ctx| {
                Box::pin(async move {
                    let report = h.seed(ctx, None).await?;
                    assert_eq!(h.seeder().await.get_seeded_data_in(ctx, "users")?.len(), 3);
                    Ok(report.total())
                })
            })
            .await
            .unwrap();
        assert_eq!(seeded, 3);
        assert!(store.documents("users").is_empty());
        assert_eq!(harness.transactions().active_count().await, 0);
        assert!(harness.seeder().await.get_seeded_data("users").is_err());

        let report = harness.shutdown().await;
        assert_eq!(report.rolled_back, 0);
        assert!(harness.pool().is_closed());
    }

    #[tokio::test]
    async fn test_end_test_commit_keeps_data() {
        let store = DocumentStore::new("t");
        store.create_collection("users");
        let harness = harness(&store).await;
        harness.seeder().await.register(blueprints::users(2)).unwrap();

        let ctx = harness.begin_test("commits").await.unwrap();
        harness.seed(&ctx, None).await.unwrap();
        harness.end_test(&ctx, true).await.unwrap();
        assert_eq!(store.documents("users").len(), 2);
        assert!(!ctx.is_active());
        harness.shutdown().await;
    }

    #[tokio::test]
    async fn test_count_queries() {
        let store = DocumentStore::new("t");
        store.create_collection("users");
        let harness = harness(&store).await;

        let ctx = harness.begin_test("counts").await.unwrap();
        let ((), count) = harness
            .count_queries(&ctx, |h, ctx| {
                Box::pin(async move {
                    let mut conn = h.transactions().connection(ctx).await?;
                    conn.count("users").await?;
                    conn.count("users").await?;
                    Ok(())
                })
            })
            .await
            .unwrap();
        assert_eq!(count, 2);
        harness.end_test(&ctx, false).await.unwrap();
        harness.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_rolls_back_open_tests() {
        let store = DocumentStore::new("t");
        let harness = harness(&store).await;
        let ctx = harness.begin_test("left_open").await.unwrap();
        let report = harness.shutdown().await;
        assert_eq!(report.rolled_back, 1);
        assert!(!ctx.is_active());
    }

    #[tokio::test]
    async fn test_concurrent_tests_keep_their_own_fixtures() {
        let store = DocumentStore::new("t");
        let harness = harness(&store).await;
        {
            let mut seeder = harness.seeder().await;
            seeder.register(blueprints::users(3)).unwrap();
            seeder.register(blueprints::posts(6)).unwrap();
        }

        let a = harness.begin_test("writer_a").await.unwrap();
        let b = harness.begin_test("writer_b").await.unwrap();
        harness.seed(&a, Some(&["users"])).await.unwrap();
        harness.seed(&b, Some(&["posts"])).await.unwrap();

        let own_users: Vec<_> = harness
            .seeder()
            .await
            .get_seeded_data_in(&b, "users")
            .unwrap()
            .iter()
            .map(|u| u["id"].clone())
            .collect();
        assert_eq!(own_users.len(), 3);

        harness.end_test(&a, false).await.unwrap();

        {
            let mut seeder = harness.seeder().await;
            assert!(seeder.get_seeded_data_in(&a, "users").is_err());
            assert_eq!(seeder.get_seeded_data_in(&b, "users").unwrap().len(), 3);
            assert!(seeder.get_random_record_in(&b, "posts").is_ok());
        }
        let users: Vec<_> = store.documents("users").iter().map(|u| u["id"].clone()).collect();
        assert_eq!(users, own_users);
        let posts = store.documents("posts");
        assert_eq!(posts.len(), 6);
        for post in &posts {
            assert!(own_users.contains(&post["user_id"]), "{post:?}");
        }

        harness.end_test(&b, false).await.unwrap();
        assert!(store.documents("users").is_empty());
        assert!(store.documents("posts").is_empty());
        harness.shutdown().await;
    }
}
