//! Embedded document store backend.
//!
//! Collections hold schemaless JSON records. The store supports whole
//! transactions through an undo journal but has no savepoints, so the
//! transaction manager degrades rollback-to-savepoint to abort and restart.
//! Writes are visible to other connections before commit: isolation is
//! best-effort only.
//!
//! Stores are explicitly constructed and shared through `Arc`; there is no
//! process-wide registry.

use crate::db::backend::{BackendConnection, ClearMode, Connector};
use crate::error::{HarnessError, HarnessResult};
use crate::models::{BackendKind, ForeignKey, QueryParam, Record};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

/// Field assigned when an inserted record carries no key.
pub const ID_FIELD: &str = "id";

#[derive(Debug, Clone)]
struct Collection {
    next_key: u64,
    next_id: i64,
    docs: BTreeMap<u64, Record>,
}

impl Default for Collection {
    fn default() -> Self {
        Self {
            next_key: 0,
            next_id: 1,
            docs: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Default)]
struct StoreState {
    collections: BTreeMap<String, Collection>,
    references: Vec<ForeignKey>,
}

/// A single reversible change, recorded while a transaction is open.
///
/// Undo touches only the documents this session wrote or removed, so
/// documents other sessions added in the meantime survive a rollback.
#[derive(Debug, Clone)]
enum Change {
    Created { collection: String },
    Inserted { collection: String, key: u64 },
    Cleared {
        collection: String,
        removed: Vec<(u64, Record)>,
        next_id: i64,
    },
    SequenceReset { collection: String, next_id: i64 },
}

impl Change {
    fn undo(self, state: &mut StoreState) {
        match self {
            Change::Created { collection } => {
                if state
                    .collections
                    .get(&collection)
                    .is_some_and(|c| c.docs.is_empty())
                {
                    state.collections.remove(&collection);
                }
            }
            Change::Inserted { collection, key } => {
                if let Some(coll) = state.collections.get_mut(&collection) {
                    coll.docs.remove(&key);
                }
            }
            Change::Cleared {
                collection,
                removed,
                next_id,
            } => {
                let coll = state.collections.entry(collection).or_default();
                for (key, record) in removed {
                    coll.docs.entry(key).or_insert(record);
                }
                // Never hand out an id twice
                coll.next_id = coll.next_id.max(next_id);
            }
            Change::SequenceReset {
                collection,
                next_id,
            } => {
                if let Some(coll) = state.collections.get_mut(&collection) {
                    coll.next_id = coll.next_id.max(next_id);
                }
            }
        }
    }
}

/// In-process document database.
#[derive(Debug)]
pub struct DocumentStore {
    name: String,
    state: Mutex<StoreState>,
    available: AtomicBool,
    latency_ms: AtomicU64,
}

impl DocumentStore {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            state: Mutex::new(StoreState::default()),
            available: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Make the store refuse (or accept again) connections and operations.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Delay every operation by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn create_collection(&self, name: &str) {
        self.state
            .lock()
            .collections
            .entry(name.to_string())
            .or_default();
    }

    pub fn drop_collection(&self, name: &str) -> bool {
        self.state.lock().collections.remove(name).is_some()
    }

    /// Declare that `reference.table.column` points at
    /// `reference.references_table.references_column`.
    pub fn declare_reference(&self, reference: ForeignKey) {
        let mut state = self.state.lock();
        if !state.references.contains(&reference) {
            state.references.push(reference);
        }
    }

    /// Snapshot of a collection's records in insertion order.
    pub fn documents(&self, collection: &str) -> Vec<Record> {
        self.state
            .lock()
            .collections
            .get(collection)
            .map(|c| c.docs.values().cloned().collect())
            .unwrap_or_default()
    }

    fn check_available(&self) -> HarnessResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(HarnessError::connection(
                format!("Document store '{}' is unavailable", self.name),
                "Check that the store has not been taken offline",
            ))
        }
    }

    async fn simulate_latency(&self) {
        let ms = self.latency_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

/// Opens connections to a shared [`DocumentStore`].
#[derive(Debug, Clone)]
pub struct DocumentConnector {
    store: Arc<DocumentStore>,
}

impl DocumentConnector {
    pub fn new(store: Arc<DocumentStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }
}

#[async_trait]
impl Connector for DocumentConnector {
    fn kind(&self) -> BackendKind {
        BackendKind::Document
    }

    async fn connect(&self) -> HarnessResult<Box<dyn BackendConnection>> {
        self.store.simulate_latency().await;
        self.store.check_available()?;
        Ok(Box::new(DocumentConnection {
            store: Arc::clone(&self.store),
            journal: None,
        }))
    }
}

/// One session against a document store.
#[derive(Debug)]
pub struct DocumentConnection {
    store: Arc<DocumentStore>,
    /// Undo log of the open transaction, if any.
    journal: Option<Vec<Change>>,
}

impl DocumentConnection {
    async fn enter(&self) -> HarnessResult<()> {
        self.store.simulate_latency().await;
        self.store.check_available()
    }

    fn record(&mut self, change: Change) {
        if let Some(journal) = self.journal.as_mut() {
            journal.push(change);
        }
    }

    fn undo_all(&mut self) -> usize {
        let Some(journal) = self.journal.take() else {
            return 0;
        };
        let undone = journal.len();
        let mut state = self.store.state.lock();
        for change in journal.into_iter().rev() {
            change.undo(&mut state);
        }
        undone
    }

    fn unsupported(operation: &str) -> HarnessError {
        HarnessError::unsupported(BackendKind::Document.display_name(), operation)
    }
}

#[async_trait]
impl BackendConnection for DocumentConnection {
    fn kind(&self) -> BackendKind {
        BackendKind::Document
    }

    async fn ping(&mut self) -> HarnessResult<()> {
        self.enter().await
    }

    async fn execute(&mut self, _statement: &str, _params: &[QueryParam]) -> HarnessResult<u64> {
        Err(Self::unsupported("raw statements"))
    }

    async fn fetch(
        &mut self,
        _statement: &str,
        _params: &[QueryParam],
    ) -> HarnessResult<Vec<Record>> {
        Err(Self::unsupported("raw statements"))
    }

    async fn execute_script(&mut self, _script: &str) -> HarnessResult<()> {
        Err(Self::unsupported("scripts"))
    }

    async fn begin(&mut self) -> HarnessResult<()> {
        self.enter().await?;
        if self.journal.is_some() {
            return Err(HarnessError::transaction(
                "A transaction is already open on this connection",
                self.store.name.clone(),
            ));
        }
        self.journal = Some(Vec::new());
        Ok(())
    }

    async fn commit(&mut self) -> HarnessResult<()> {
        self.enter().await?;
        match self.journal.take() {
            Some(_) => Ok(()),
            None => Err(HarnessError::transaction(
                "No transaction is open on this connection",
                self.store.name.clone(),
            )),
        }
    }

    async fn rollback(&mut self) -> HarnessResult<()> {
        self.enter().await?;
        if self.journal.is_none() {
            return Err(HarnessError::transaction(
                "No transaction is open on this connection",
                self.store.name.clone(),
            ));
        }
        let undone = self.undo_all();
        debug!(store = %self.store.name, undone, "Rolled back document transaction");
        Ok(())
    }

    async fn savepoint(&mut self, _name: &str) -> HarnessResult<()> {
        Err(Self::unsupported("savepoints"))
    }

    async fn rollback_to_savepoint(&mut self, _name: &str) -> HarnessResult<()> {
        Err(Self::unsupported("savepoints"))
    }

    async fn release_savepoint(&mut self, _name: &str) -> HarnessResult<()> {
        Err(Self::unsupported("savepoints"))
    }

    async fn insert(&mut self, collection: &str, records: &[Record]) -> HarnessResult<Vec<Record>> {
        self.enter().await?;
        let mut changes = Vec::with_capacity(records.len() + 1);
        let mut stored = Vec::with_capacity(records.len());
        {
            let mut state = self.store.state.lock();
            if !state.collections.contains_key(collection) {
                changes.push(Change::Created {
                    collection: collection.to_string(),
                });
            }
            let coll = state.collections.entry(collection.to_string()).or_default();
            for record in records {
                let mut record = record.clone();
                match record.get(ID_FIELD).and_then(JsonValue::as_i64) {
                    Some(id) => coll.next_id = coll.next_id.max(id + 1),
                    None if !record.contains_key(ID_FIELD) => {
                        record.insert(ID_FIELD.to_string(), JsonValue::from(coll.next_id));
                        coll.next_id += 1;
                    }
                    None => {}
                }
                let key = coll.next_key;
                coll.next_key += 1;
                coll.docs.insert(key, record.clone());
                changes.push(Change::Inserted {
                    collection: collection.to_string(),
                    key,
                });
                stored.push(record);
            }
        }
        for change in changes {
            self.record(change);
        }
        Ok(stored)
    }

    async fn list_collections(&mut self) -> HarnessResult<Vec<String>> {
        self.enter().await?;
        Ok(self.store.state.lock().collections.keys().cloned().collect())
    }

    async fn count(&mut self, collection: &str) -> HarnessResult<u64> {
        self.enter().await?;
        Ok(self
            .store
            .state
            .lock()
            .collections
            .get(collection)
            .map_or(0, |c| c.docs.len() as u64))
    }

    async fn clear(&mut self, collection: &str, mode: ClearMode) -> HarnessResult<u64> {
        self.enter().await?;
        let (removed, next_id) = {
            let mut state = self.store.state.lock();
            let Some(coll) = state.collections.get_mut(collection) else {
                return Ok(0);
            };
            let removed: Vec<(u64, Record)> = std::mem::take(&mut coll.docs).into_iter().collect();
            let next_id = coll.next_id;
            if let ClearMode::Truncate {
                reset_identity: true,
                ..
            } = mode
            {
                coll.next_id = 1;
            }
            (removed, next_id)
        };
        let count = removed.len() as u64;
        self.record(Change::Cleared {
            collection: collection.to_string(),
            removed,
            next_id,
        });
        Ok(count)
    }

    async fn reset_sequence(&mut self, collection: &str) -> HarnessResult<()> {
        self.enter().await?;
        let change = {
            let mut state = self.store.state.lock();
            let Some(coll) = state.collections.get_mut(collection) else {
                return Ok(());
            };
            let old = coll.next_id;
            coll.next_id = coll
                .docs
                .values()
                .filter_map(|r| r.get(ID_FIELD).and_then(JsonValue::as_i64))
                .max()
                .map_or(1, |max| max + 1);
            Change::SequenceReset {
                collection: collection.to_string(),
                next_id: old,
            }
        };
        self.record(change);
        Ok(())
    }

    async fn foreign_keys(&mut self) -> HarnessResult<Vec<ForeignKey>> {
        self.enter().await?;
        Ok(self.store.state.lock().references.clone())
    }

    async fn close(self: Box<Self>) -> HarnessResult<()> {
        let mut this = self;
        // An open transaction dies with its session
        if this.journal.is_some() {
            let undone = this.undo_all();
            debug!(store = %this.store.name, undone, "Discarded open transaction on close");
        }
        Ok(())
    }
}
