//! Backend abstraction.
//!
//! A [`Connector`] opens physical connections; a [`BackendConnection`] is one
//! of them. The pool, transaction manager, seeder and cleaner only talk to
//! these traits and branch on [`BackendCapabilities`], never on the kind.

use crate::db::document::{DocumentConnector, DocumentStore};
use crate::db::sql::SqlConnector;
use crate::error::HarnessResult;
use crate::models::{
    BackendCapabilities, BackendDescriptor, BackendKind, ForeignKey, QueryParam, Record,
};
use async_trait::async_trait;
use std::sync::Arc;

/// How a collection should be emptied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearMode {
    /// Bulk clear. Backends without a truncate fall back to a row delete
    /// followed by a counter reset when `reset_identity` is set.
    Truncate { cascade: bool, reset_identity: bool },
    /// Row-by-row delete, identity counters untouched.
    Delete,
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    fn kind(&self) -> BackendKind;

    fn capabilities(&self) -> BackendCapabilities {
        self.kind().capabilities()
    }

    async fn connect(&self) -> HarnessResult<Box<dyn BackendConnection>>;
}

#[async_trait]
pub trait BackendConnection: Send + 'static {
    fn kind(&self) -> BackendKind;

    fn capabilities(&self) -> BackendCapabilities {
        self.kind().capabilities()
    }

    async fn ping(&mut self) -> HarnessResult<()>;

    /// Run one statement, returning the affected row count.
    async fn execute(&mut self, statement: &str, params: &[QueryParam]) -> HarnessResult<u64>;

    async fn fetch(&mut self, statement: &str, params: &[QueryParam])
    -> HarnessResult<Vec<Record>>;

    /// Run several `;`-separated statements without parameters.
    async fn execute_script(&mut self, script: &str) -> HarnessResult<()>;

    async fn begin(&mut self) -> HarnessResult<()>;
    async fn commit(&mut self) -> HarnessResult<()>;
    async fn rollback(&mut self) -> HarnessResult<()>;
    async fn savepoint(&mut self, name: &str) -> HarnessResult<()>;
    async fn rollback_to_savepoint(&mut self, name: &str) -> HarnessResult<()>;
    async fn release_savepoint(&mut self, name: &str) -> HarnessResult<()>;

    /// Insert `records` and return them as stored, generated keys included.
    async fn insert(&mut self, collection: &str, records: &[Record]) -> HarnessResult<Vec<Record>>;

    async fn list_collections(&mut self) -> HarnessResult<Vec<String>>;
    async fn count(&mut self, collection: &str) -> HarnessResult<u64>;

    /// Empty a collection, returning how many records were removed.
    async fn clear(&mut self, collection: &str, mode: ClearMode) -> HarnessResult<u64>;

    async fn reset_sequence(&mut self, collection: &str) -> HarnessResult<()>;

    /// Every reference edge between collections.
    async fn foreign_keys(&mut self) -> HarnessResult<Vec<ForeignKey>>;

    async fn close(self: Box<Self>) -> HarnessResult<()>;
}

/// Build the connector for a descriptor.
///
/// Document descriptors get a fresh embedded store; share one store between
/// pools by constructing [`DocumentConnector`] directly.
pub fn connector_for(descriptor: &BackendDescriptor) -> Arc<dyn Connector> {
    match descriptor.kind {
        BackendKind::Document => {
            let name = descriptor.database.as_deref().unwrap_or("default");
            Arc::new(DocumentConnector::new(DocumentStore::new(name)))
        }
        _ => Arc::new(SqlConnector::new(descriptor.clone())),
    }
}
