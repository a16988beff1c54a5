//! Database test-isolation harness.
//!
//! Gives test suites a private, reproducible view of a shared database:
//! pooled connections, one transaction per test with savepoints, fixture
//! seeding in dependency order, cleanup between tests and query telemetry.
//! PostgreSQL, MySQL and SQLite are supported through sqlx; an embedded
//! document store without savepoints exercises the degraded paths.

pub mod cleaner;
pub mod config;
pub mod db;
pub mod error;
pub mod fixtures;
pub mod format;
pub mod harness;
pub mod migration;
pub mod models;
pub mod monitor;

pub use cleaner::{Cleaner, CleanupConfig, CleanupResult};
pub use db::{
    ConnectionPool, PoolManager, PooledConnection, TransactionContext, TransactionManager,
};
pub use error::{HarnessError, HarnessResult};
pub use fixtures::{Seeder, SeederConfig, SeederSchema};
pub use harness::{HarnessConfig, TestHarness};
pub use monitor::{PerformanceMonitor, PerformanceThresholds};
