//! End-to-end tests against a file-backed SQLite database.
//!
//! Tests verify that:
//! - Savepoints roll back only the work after them
//! - Seeding honours foreign keys and cleanup restores the row counts
//! - Migrations round-trip back to the original schema
//! - The harness rolls every isolated test back

use db_test_harness::cleaner::{Cleaner, CleanupConfig};
use db_test_harness::db::{ConnectionPool, TransactionManager};
use db_test_harness::error::HarnessError;
use db_test_harness::fixtures::{Seeder, SeederConfig, blueprints};
use db_test_harness::harness::{HarnessConfig, TestHarness};
use db_test_harness::migration::{self, Migration, MigrationTester};
use db_test_harness::models::{BackendDescriptor, ConnectionPoolConfig, QueryParam};
use std::collections::HashSet;
use std::time::Duration;
use tempfile::{NamedTempFile, tempdir};

const SCHEMA: &str = "
CREATE TABLE users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    email TEXT NOT NULL,
    username TEXT NOT NULL,
    first_name TEXT,
    last_name TEXT,
    is_active BOOLEAN,
    is_verified BOOLEAN,
    created_at TEXT
);
CREATE TABLE posts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL REFERENCES users(id),
    title TEXT,
    slug TEXT,
    content TEXT,
    status TEXT,
    view_count INTEGER,
    created_at TEXT
);
CREATE TABLE schema_migrations (version TEXT PRIMARY KEY);
INSERT INTO schema_migrations (version) VALUES ('1');
";

/// Create a SQLite database file that outlives the test's temp handle.
fn sqlite_config(name: &str) -> ConnectionPoolConfig {
    let temp_file = NamedTempFile::new().unwrap();
    let db_path = temp_file
        .into_temp_path()
        .keep()
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    let backend = BackendDescriptor::new(format!("sqlite:{}", db_path)).unwrap();
    ConnectionPoolConfig::new(name, backend)
        .with_size(1, 2)
        .with_acquire_timeout(Duration::from_secs(5))
}

async fn setup_pool(name: &str, schema: &str) -> ConnectionPool {
    let pool = ConnectionPool::from_config(sqlite_config(name)).unwrap();
    pool.initialize().await.unwrap();
    if !schema.is_empty() {
        let mut conn = pool.acquire().await.unwrap();
        conn.execute_script(schema).await.unwrap();
        conn.release().await;
    }
    pool
}

async fn count(pool: &ConnectionPool, table: &str) -> u64 {
    let mut conn = pool.acquire().await.unwrap();
    let rows = conn.count(table).await.unwrap();
    conn.release().await;
    rows
}

#[tokio::test]
async fn test_savepoint_rollback() {
    let pool = setup_pool(
        "savepoints",
        "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT NOT NULL);",
    )
    .await;
    let tx = TransactionManager::new(pool.clone());
    let insert = "INSERT INTO items (name) VALUES (?)";

    let ctx = tx.start_transaction("savepoints").await.unwrap();
    assert!(ctx.capabilities().supports_savepoints);
    tx.execute(&ctx, insert, &[QueryParam::String("kept".into())])
        .await
        .unwrap();
    let savepoint = tx.create_savepoint(&ctx, Some("before_extra")).await.unwrap();
    tx.execute(&ctx, insert, &[QueryParam::String("dropped".into())])
        .await
        .unwrap();

    let outcome = tx.rollback_to_savepoint(&ctx, &savepoint).await.unwrap();
    assert!(!outcome.degraded);
    let rows = tx
        .fetch(&ctx, "SELECT name FROM items ORDER BY id", &[])
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["name"], "kept");

    let err = tx
        .create_savepoint(&ctx, Some("before_extra"))
        .await
        .unwrap_err();
    assert!(matches!(err, HarnessError::InvalidInput { .. }), "{err:?}");

    tx.commit_transaction(&ctx).await.unwrap();
    assert_eq!(count(&pool, "items").await, 1);
    pool.close().await;
}

#[tokio::test]
async fn test_rollback_discards_writes() {
    let pool = setup_pool("rollback", "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT);").await;
    let tx = TransactionManager::new(pool.clone());

    let ctx = tx.start_transaction("rollback").await.unwrap();
    let affected = tx
        .execute(&ctx, "INSERT INTO items (name) VALUES ('a'), ('b')", &[])
        .await
        .unwrap();
    assert_eq!(affected, 2);
    tx.rollback_transaction(&ctx).await.unwrap();

    assert_eq!(count(&pool, "items").await, 0);
    assert_eq!(pool.stats().active, 0);
    pool.close().await;
}

#[tokio::test]
async fn test_seed_then_cleanup_restores_counts() {
    let pool = setup_pool("seed_clean", SCHEMA).await;
    let baseline = (count(&pool, "users").await, count(&pool, "posts").await);
    assert_eq!(baseline, (0, 0));

    let mut seeder = Seeder::new(SeederConfig {
        rng_seed: Some(3),
        batch_size: 4,
        ..SeederConfig::default()
    });
    seeder.register(blueprints::users(5)).unwrap();
    seeder.register(blueprints::posts(10)).unwrap();

    let mut conn = pool.acquire().await.unwrap();
    let report = seeder.seed(&mut conn, None).await.unwrap();
    conn.release().await;
    assert_eq!(report.order, vec!["users".to_string(), "posts".to_string()]);

    let user_ids: HashSet<i64> = seeder
        .get_seeded_data("users")
        .unwrap()
        .iter()
        .map(|u| u["id"].as_i64().unwrap())
        .collect();
    assert_eq!(user_ids.len(), 5);
    for post in seeder.get_seeded_data("posts").unwrap() {
        assert!(user_ids.contains(&post["user_id"].as_i64().unwrap()));
    }
    assert_eq!(count(&pool, "users").await, 5);
    assert_eq!(count(&pool, "posts").await, 10);

    let cleaner = Cleaner::new(pool.clone(), CleanupConfig::default()).unwrap();
    let mut conn = pool.acquire().await.unwrap();
    let tables = vec!["users".to_string(), "posts".to_string()];
    let order = cleaner.clear_order(&mut conn, &tables).await.unwrap();
    conn.release().await;
    assert_eq!(order, vec!["posts".to_string(), "users".to_string()]);

    let result = cleaner.cleanup().await.unwrap().ensure_success().unwrap();
    assert_eq!(result.records_removed, 15);
    assert!(!result.cleared_tables.contains(&"schema_migrations".to_string()));
    assert_eq!(
        (count(&pool, "users").await, count(&pool, "posts").await),
        baseline
    );
    assert_eq!(count(&pool, "schema_migrations").await, 1);

    let again = cleaner.cleanup().await.unwrap();
    assert!(again.success);
    assert_eq!(again.records_removed, 0);
    pool.close().await;
}

#[tokio::test]
async fn test_migration_round_trip() {
    let dir = tempdir().unwrap();
    std::fs::write(
        dir.path().join("001_create_authors.sql"),
        "-- UP\nCREATE TABLE authors (id INTEGER PRIMARY KEY, name TEXT);\n-- DOWN\nDROP TABLE authors;\n",
    )
    .unwrap();
    std::fs::write(
        dir.path().join("002_create_books.sql"),
        "-- up\nCREATE TABLE books (id INTEGER PRIMARY KEY, author_id INTEGER REFERENCES authors(id));\nCREATE INDEX books_author ON books (author_id);\n-- down\nDROP INDEX books_author;\nDROP TABLE books;\n",
    )
    .unwrap();
    std::fs::write(dir.path().join("README.md"), "not a migration").unwrap();

    let migrations = migration::load_dir(dir.path()).await.unwrap();
    assert_eq!(migrations.len(), 2);
    assert_eq!(migrations[0].id(), "001_create_authors");

    let pool = setup_pool("migrations", "CREATE TABLE existing (id INTEGER);").await;
    let tester = MigrationTester::new(pool.clone());
    let report = tester.verify_round_trip(&migrations).await.unwrap();
    assert_eq!(report.created, vec!["authors".to_string(), "books".to_string()]);
    assert!(report.restored(), "{report:?}");
    assert_eq!(report.tables_after_down, vec!["existing".to_string()]);

    // A down block that leaves a table behind is reported
    let leaky = Migration::parse(
        "003_leaky.sql",
        "-- UP\nCREATE TABLE leaky (id INTEGER);\n-- DOWN\nSELECT 1;\n",
    )
    .unwrap();
    let report = tester.verify_round_trip(&[leaky]).await.unwrap();
    assert_eq!(report.leftover, vec!["leaky".to_string()]);
    let err = report.ensure_restored().unwrap_err();
    assert!(matches!(err, HarnessError::Migration { .. }), "{err:?}");
    pool.close().await;
}

#[tokio::test]
async fn test_harness_isolates_tests() {
    let config = sqlite_config("harness");
    let mut harness_config = HarnessConfig::new(config);
    harness_config.sample_load = false;
    harness_config.seeder.rng_seed = Some(5);
    let harness = TestHarness::start(harness_config).await.unwrap();

    let mut conn = harness.pool().acquire().await.unwrap();
    conn.execute_script(SCHEMA).await.unwrap();
    conn.release().await;

    {
        let mut seeder = harness.seeder().await;
        seeder.register(blueprints::users(3)).unwrap();
        seeder.register(blueprints::posts(6)).unwrap();
    }

    let seen = harness
        .run_isolated("seeds_blog", |h, ctx| {
            Box::pin(async move {
                h.seed(ctx, Some(&["posts"])).await?;
                let rows = h
                    .transactions()
                    .fetch(ctx, "SELECT COUNT(*) AS n FROM posts", &[])
                    .await?;
                Ok(rows[0]["n"].as_i64().unwrap_or_default())
            })
        })
        .await
        .unwrap();
    assert_eq!(seen, 6);
    assert_eq!(count(harness.pool(), "posts").await, 0);
    assert_eq!(count(harness.pool(), "users").await, 0);

    let summary = harness.monitor().get_performance_summary(5);
    assert!(summary.total_queries > 0);
    assert_eq!(summary.error_count, 0);

    let report = harness.shutdown().await;
    assert_eq!(report.rolled_back, 0);
}
