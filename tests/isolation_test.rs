//! Per-test isolation against the embedded document store.
//!
//! Tests verify that:
//! - Seeding inserts parents before dependents and links them
//! - Concurrent transactions resolve foreign keys against their own fixtures
//! - A dependency cycle is reported before anything is written
//! - A finished transaction rejects further use and frees its connection once
//! - Savepoint rollback degrades to a full restart without savepoint support
//! - Expired transactions are rolled back

use db_test_harness::db::{
    ConnectionPool, DocumentConnector, DocumentStore, TransactionManager, TransactionState,
};
use db_test_harness::error::HarnessError;
use db_test_harness::fixtures::{FieldGenerator, Seeder, SeederConfig, SeederSchema, blueprints};
use db_test_harness::models::{BackendDescriptor, ConnectionPoolConfig, Record};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

async fn setup(name: &str) -> (Arc<DocumentStore>, TransactionManager) {
    let store = DocumentStore::new(name);
    let config = ConnectionPoolConfig::new(name, BackendDescriptor::document(name))
        .with_size(1, 4)
        .with_acquire_timeout(Duration::from_millis(200));
    let pool =
        ConnectionPool::new(config, Arc::new(DocumentConnector::new(Arc::clone(&store)))).unwrap();
    pool.initialize().await.unwrap();
    (store, TransactionManager::new(pool))
}

fn seeded_seeder() -> Seeder {
    let mut seeder = Seeder::new(SeederConfig {
        rng_seed: Some(11),
        ..SeederConfig::default()
    });
    seeder.register(blueprints::posts(10)).unwrap();
    seeder.register(blueprints::users(5)).unwrap();
    seeder
}

#[tokio::test]
async fn test_seeding_respects_dependencies() {
    let (store, tx) = setup("seed_order").await;
    let mut seeder = seeded_seeder();

    let ctx = tx.start_transaction("seeds_posts").await.unwrap();
    let report = seeder.seed_in(&tx, &ctx, Some(&["posts"])).await.unwrap();
    assert_eq!(report.order, vec!["users".to_string(), "posts".to_string()]);
    assert_eq!(report.inserted["users"], 5);
    assert_eq!(report.inserted["posts"], 10);

    let user_ids: HashSet<i64> = store
        .documents("users")
        .iter()
        .map(|u| u["id"].as_i64().unwrap())
        .collect();
    assert_eq!(user_ids.len(), 5);
    for post in store.documents("posts") {
        let user_id = post["user_id"].as_i64().unwrap();
        assert!(user_ids.contains(&user_id), "dangling user_id {user_id}");
    }

    let seeded_posts = seeder.get_seeded_data_in(&ctx, "posts").unwrap();
    assert_eq!(seeded_posts.len(), 10);
    let random = seeder.get_random_record_in(&ctx, "users").unwrap();
    assert!(user_ids.contains(&random["id"].as_i64().unwrap()));
    // Nothing was seeded outside the transaction
    assert!(seeder.get_seeded_data("users").is_err());

    tx.rollback_transaction(&ctx).await.unwrap();
    seeder.clear_seeded_data_for(&ctx);
    assert!(seeder.get_seeded_data_in(&ctx, "posts").is_err());
    assert!(store.documents("users").is_empty());
    assert!(store.documents("posts").is_empty());
}

#[tokio::test]
async fn test_interleaved_seeding_stays_per_transaction() {
    let (store, tx) = setup("interleaved").await;
    let mut seeder = seeded_seeder();

    let a = tx.start_transaction("seeds_users").await.unwrap();
    let b = tx.start_transaction("seeds_posts").await.unwrap();
    seeder.seed_in(&tx, &a, Some(&["users"])).await.unwrap();
    seeder.seed_in(&tx, &b, Some(&["posts"])).await.unwrap();

    let ids = |records: &[Record]| -> HashSet<i64> {
        records.iter().map(|r| r["id"].as_i64().unwrap()).collect()
    };
    let a_users = ids(seeder.get_seeded_data_in(&a, "users").unwrap());
    let b_users = ids(seeder.get_seeded_data_in(&b, "users").unwrap());
    assert!(a_users.is_disjoint(&b_users));
    assert!(seeder.get_seeded_data_in(&a, "posts").is_err());

    tx.rollback_transaction(&a).await.unwrap();
    seeder.clear_seeded_data_for(&a);

    assert_eq!(seeder.get_seeded_data_in(&b, "posts").unwrap().len(), 10);
    let remaining: Vec<Record> = store.documents("users");
    assert_eq!(ids(remaining.as_slice()), b_users);
    for post in store.documents("posts") {
        let user_id = post["user_id"].as_i64().unwrap();
        assert!(b_users.contains(&user_id), "post of b points at {user_id}");
    }

    tx.commit_transaction(&b).await.unwrap();
    assert_eq!(store.documents("posts").len(), 10);
}

#[tokio::test]
async fn test_cycle_detected_before_insert() {
    let (store, tx) = setup("cycle").await;
    let mut seeder = Seeder::default();
    seeder
        .register(SeederSchema::new("teams").count(2).depends_on("leagues"))
        .unwrap();
    seeder
        .register(SeederSchema::new("leagues").count(2).depends_on("teams"))
        .unwrap();
    seeder
        .register(
            SeederSchema::new("venues")
                .count(1)
                .field("city", FieldGenerator::Constant(json!("Oslo"))),
        )
        .unwrap();

    let ctx = tx.start_transaction("cycle").await.unwrap();
    let err = seeder.seed_in(&tx, &ctx, None).await.unwrap_err();
    match err {
        HarnessError::CircularDependency { path, .. } => {
            assert!(path.contains(&"teams".to_string()));
            assert!(path.contains(&"leagues".to_string()));
        }
        other => panic!("expected a cycle, got {other:?}"),
    }
    for collection in ["teams", "leagues", "venues"] {
        assert!(store.documents(collection).is_empty());
    }
    tx.rollback_transaction(&ctx).await.unwrap();
}

#[tokio::test]
async fn test_seeded_data_missing_schema() {
    let seeder = seeded_seeder();
    let err = seeder.get_seeded_data("users").unwrap_err();
    assert!(matches!(err, HarnessError::NoSeededData { .. }), "{err:?}");
}

#[tokio::test]
async fn test_finished_transaction_is_inactive() {
    let (_store, tx) = setup("inactive").await;
    let pool = tx.pool().clone();

    let committed = tx.start_transaction("commits").await.unwrap();
    let rolled_back = tx.start_transaction("rolls_back").await.unwrap();
    assert_eq!(tx.active_count().await, 2);
    assert_eq!(pool.stats().active, 2);

    tx.commit_transaction(&committed).await.unwrap();
    tx.rollback_transaction(&rolled_back).await.unwrap();
    assert_eq!(committed.state(), TransactionState::Committed);
    assert_eq!(rolled_back.state(), TransactionState::RolledBack);
    assert_eq!(tx.active_count().await, 0);
    assert_eq!(pool.stats().active, 0);

    for ctx in [&committed, &rolled_back] {
        let err = tx.commit_transaction(ctx).await.unwrap_err();
        assert!(matches!(err, HarnessError::TransactionInactive { .. }), "{err:?}");
        let err = tx.rollback_transaction(ctx).await.unwrap_err();
        assert!(matches!(err, HarnessError::TransactionInactive { .. }), "{err:?}");
        assert!(tx.create_savepoint(ctx, None).await.is_err());
        assert!(tx.connection(ctx).await.is_err());
    }
    assert_eq!(pool.stats().active, 0);
}

#[tokio::test]
async fn test_degraded_savepoint_rollback() {
    let (store, tx) = setup("degraded").await;
    let ctx = tx.start_transaction("savepoints").await.unwrap();
    assert!(!ctx.capabilities().supports_savepoints);

    let insert = |name: &'static str| {
        let mut record = Record::new();
        record.insert("name".into(), json!(name));
        record
    };

    tx.connection(&ctx)
        .await
        .unwrap()
        .insert("tags", &[insert("before")])
        .await
        .unwrap();
    let first = tx.create_savepoint(&ctx, None).await.unwrap();
    assert_eq!(first, "sp_1");
    tx.connection(&ctx)
        .await
        .unwrap()
        .insert("tags", &[insert("after")])
        .await
        .unwrap();
    let second = tx.create_savepoint(&ctx, Some("later")).await.unwrap();

    let outcome = tx.rollback_to_savepoint(&ctx, &first).await.unwrap();
    assert!(outcome.degraded);
    assert_eq!(outcome.discarded, vec![second]);
    assert_eq!(ctx.savepoints(), vec![first.clone()]);
    // The whole transaction restarted, so work before the savepoint is gone too
    assert!(store.documents("tags").is_empty());
    assert!(ctx.is_active());

    let err = tx.rollback_to_savepoint(&ctx, "missing").await.unwrap_err();
    assert!(matches!(err, HarnessError::SavepointNotFound { .. }), "{err:?}");

    tx.release_savepoint(&ctx, &first).await.unwrap();
    assert!(ctx.savepoints().is_empty());
    tx.commit_transaction(&ctx).await.unwrap();
}

#[tokio::test]
async fn test_expired_transactions_roll_back() {
    let store = DocumentStore::new("expiry");
    let config = ConnectionPoolConfig::new("expiry", BackendDescriptor::document("expiry"))
        .with_size(1, 2);
    let pool =
        ConnectionPool::new(config, Arc::new(DocumentConnector::new(Arc::clone(&store)))).unwrap();
    pool.initialize().await.unwrap();
    let tx = TransactionManager::with_timeout(pool.clone(), Duration::from_millis(20));

    let ctx = tx.start_transaction("slow_test").await.unwrap();
    tx.connection(&ctx)
        .await
        .unwrap()
        .insert("jobs", &[Record::new()])
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;

    assert_eq!(tx.expire_now().await, 1);
    assert!(!ctx.is_active());
    assert!(store.documents("jobs").is_empty());
    assert_eq!(pool.stats().active, 0);
    let err = tx.commit_transaction(&ctx).await.unwrap_err();
    assert!(matches!(err, HarnessError::TransactionInactive { .. }));
}

#[tokio::test]
async fn test_list_active() {
    let (_store, tx) = setup("listing").await;
    let ctx = tx.start_transaction("listed").await.unwrap();
    tx.create_savepoint(&ctx, Some("checkpoint")).await.unwrap();

    let listed = tx.list_active().await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].test_id, "listed");
    assert_eq!(listed[0].connection_id, ctx.connection_id());
    assert_eq!(listed[0].savepoints, vec!["checkpoint".to_string()]);

    let report = tx.cleanup_all_transactions().await;
    assert_eq!(report.rolled_back, 1);
    assert!(report.failed.is_empty());
    assert!(tx.list_active().await.is_empty());
}
