//! Pool behaviour against the embedded document store.
//!
//! Tests verify that:
//! - `idle + active <= max` holds under random acquire/release traffic
//! - An exhausted pool fails with `PoolExhausted` after the acquire timeout
//! - Dropped and cancelled acquisitions are accounted for
//! - Unreachable backends fail initialization

use db_test_harness::db::{ConnectionPool, DocumentConnector, DocumentStore, PoolManager};
use db_test_harness::error::HarnessError;
use db_test_harness::models::{BackendDescriptor, ConnectionPoolConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_test::{assert_err, assert_ok};

fn document_pool(store: &Arc<DocumentStore>, min: u32, max: u32, timeout_ms: u64) -> ConnectionPool {
    let config = ConnectionPoolConfig::new("docs", BackendDescriptor::document(store.name()))
        .with_size(min, max)
        .with_acquire_timeout(Duration::from_millis(timeout_ms))
        .with_retries(0, Duration::from_millis(10));
    ConnectionPool::new(config, Arc::new(DocumentConnector::new(Arc::clone(store)))).unwrap()
}

#[tokio::test]
async fn test_initialize_opens_min_connections() {
    let store = DocumentStore::new("init");
    let pool = document_pool(&store, 2, 4, 100);
    pool.initialize().await.unwrap();

    let stats = pool.stats();
    assert_eq!(stats.idle, 2);
    assert_eq!(stats.active, 0);
    assert_eq!(stats.created, 2);
    assert!(stats.healthy);
    assert!(pool.health_check().await.unwrap());
    pool.close().await;
}

#[tokio::test]
async fn test_invariant_under_random_traffic() {
    let store = DocumentStore::new("traffic");
    let pool = document_pool(&store, 1, 3, 50);
    pool.initialize().await.unwrap();

    let mut rng = StdRng::seed_from_u64(42);
    let mut held = Vec::new();
    for _ in 0..200 {
        if held.is_empty() || (held.len() < 3 && rng.gen_bool(0.5)) {
            held.push(pool.acquire().await.unwrap());
        } else {
            let index = rng.gen_range(0..held.len());
            let conn = held.swap_remove(index);
            if rng.gen_bool(0.5) {
                conn.release().await;
            } else {
                drop(conn);
            }
        }
        let stats = pool.stats();
        assert!(stats.idle + stats.active <= 3, "{stats:?}");
        assert_eq!(stats.active, held.len());
    }

    for conn in held {
        conn.release().await;
    }
    let stats = pool.stats();
    assert_eq!(stats.active, 0);
    assert_eq!(stats.borrowed, stats.returned);
    pool.close().await;
}

#[tokio::test]
async fn test_exhausted_after_acquire_timeout() {
    let store = DocumentStore::new("exhaust");
    let pool = document_pool(&store, 0, 1, 100);
    pool.initialize().await.unwrap();

    let held = pool.acquire().await.unwrap();
    let started = Instant::now();
    let err = pool.acquire().await.unwrap_err();
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert!(matches!(err, HarnessError::PoolExhausted { .. }), "{err:?}");
    assert!(err.is_retryable());
    assert_eq!(pool.stats().failed, 1);

    held.release().await;
    let conn = assert_ok!(pool.acquire().await);
    conn.release().await;
    pool.close().await;
}

#[tokio::test]
async fn test_cancelled_acquire_counts_as_failed() {
    let store = DocumentStore::new("cancel");
    let pool = document_pool(&store, 0, 1, 1_000);
    pool.initialize().await.unwrap();

    let held = pool.acquire().await.unwrap();
    assert_err!(tokio::time::timeout(Duration::from_millis(50), pool.acquire()).await);

    let stats = pool.stats();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.active, 1);
    held.release().await;
    pool.close().await;
}

#[tokio::test]
async fn test_unavailable_backend_fails_initialization() {
    let store = DocumentStore::new("down");
    store.set_available(false);
    let pool = document_pool(&store, 1, 2, 100);

    let err = pool.initialize().await.unwrap_err();
    assert!(matches!(err, HarnessError::PoolInitialization { .. }), "{err:?}");
}

#[tokio::test]
async fn test_closed_pool_rejects_acquire() {
    let store = DocumentStore::new("closed");
    let pool = document_pool(&store, 1, 2, 100);
    pool.initialize().await.unwrap();
    pool.close().await;

    assert!(pool.is_closed());
    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(err, HarnessError::PoolClosed { .. }));
}

#[tokio::test]
async fn test_manager_registry() {
    let store = DocumentStore::new("registry");
    let manager = PoolManager::new();
    manager.register(document_pool(&store, 1, 2, 100)).await.unwrap();

    let err = manager
        .register(document_pool(&store, 1, 2, 100))
        .await
        .unwrap_err();
    assert!(matches!(err, HarnessError::Configuration { .. }), "{err:?}");
    assert_eq!(manager.names().await, vec!["docs".to_string()]);

    let health = manager.health_check_all().await;
    assert_eq!(health.get("docs"), Some(&true));
    assert!(matches!(
        manager.get("missing").await.unwrap_err(),
        HarnessError::PoolNotFound { .. }
    ));

    manager.close_all().await;
    assert!(manager.names().await.is_empty());
}
