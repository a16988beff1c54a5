//! Database access layer.
//!
//! - Backend abstraction over SQL engines and the embedded document store
//! - Connection pools and the named pool registry
//! - Per-test transactions with savepoints
//! - Row decoding, parameter binding and per-dialect SQL

pub mod backend;
pub mod connection;
pub mod dialect;
pub mod document;
#[macro_use]
pub mod macros;
pub mod manager;
pub mod observer;
pub mod params;
pub mod pool;
pub mod sql;
pub mod transaction;
pub mod types;

pub use backend::{BackendConnection, ClearMode, Connector, connector_for};
pub use connection::PooledConnection;
pub use document::{DocumentConnector, DocumentStore};
pub use manager::PoolManager;
pub use observer::{PoolEvent, QueryObserver};
pub use pool::{ConnectionPool, PoolStats, WeakPool};
pub use sql::SqlConnector;
pub use transaction::{
    SavepointRollback, TransactionCleanupReport, TransactionConnection, TransactionContext,
    TransactionManager, TransactionMetadata, TransactionState,
};
