//! Dependency-ordered fixture insertion.

use crate::db::backend::ClearMode;
use crate::db::connection::PooledConnection;
use crate::db::dialect::validate_identifier;
use crate::db::transaction::{TransactionContext, TransactionManager};
use crate::error::{HarnessError, HarnessResult};
use crate::fixtures::graph::DependencyGraph;
use crate::fixtures::schema::{RelationshipDefinition, RelationshipKind, SeederSchema};
use crate::models::Record;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use chrono::{DateTime, Utc};
use rand::{Rng, SeedableRng};
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;
use tracing::{debug, info};

pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Anchor for generated timestamps when an RNG seed is set, in Unix seconds
/// (2024-01-01T00:00:00Z).
pub const SEEDED_EPOCH: i64 = 1_704_067_200;

/// Largest number of distinct targets linked per record in a many-to-many.
const MAX_PIVOT_LINKS: usize = 3;

#[derive(Debug, Clone)]
pub struct SeederConfig {
    pub batch_size: usize,
    /// Empty every affected collection before inserting
    pub truncate_before_seeding: bool,
    /// Fixed RNG seed for reproducible fixtures
    pub rng_seed: Option<u64>,
    /// "Now" for generated timestamps. Seeded runs default to
    /// [`SEEDED_EPOCH`], unseeded ones to the wall clock.
    pub reference_time: Option<DateTime<Utc>>,
}

impl Default for SeederConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            truncate_before_seeding: false,
            rng_seed: None,
            reference_time: None,
        }
    }
}

/// What a [`Seeder::seed`] call inserted.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SeedReport {
    /// Schemas in the order they were seeded
    pub order: Vec<String>,
    /// Records inserted per schema (pivot tables by table name)
    pub inserted: BTreeMap<String, usize>,
    /// Child and pivot rows written for relationships
    pub relationship_rows: usize,
    pub duration_ms: u64,
}

impl SeedReport {
    pub fn total(&self) -> usize {
        self.inserted.values().sum()
    }
}

/// Seeded records per schema name.
type SeededRecords = HashMap<String, Vec<Record>>;

/// Scope of records seeded outside any test transaction.
const UNSCOPED: &str = "";

/// Registry of fixture schemas plus the records seeded from them.
///
/// Records are remembered per transaction: seeding inside one test never
/// resolves foreign keys against rows another test wrote, and ending one
/// test forgets only its own records.
#[derive(Debug)]
pub struct Seeder {
    config: SeederConfig,
    schemas: BTreeMap<String, SeederSchema>,
    seeded: HashMap<String, SeededRecords>,
    rng: StdRng,
}

impl Default for Seeder {
    fn default() -> Self {
        Self::new(SeederConfig::default())
    }
}

impl Seeder {
    pub fn new(config: SeederConfig) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            schemas: BTreeMap::new(),
            seeded: HashMap::new(),
            rng,
        }
    }

    pub fn config(&self) -> &SeederConfig {
        &self.config
    }

    /// The instant generated timestamps count back from.
    fn clock(&self) -> DateTime<Utc> {
        match (self.config.reference_time, self.config.rng_seed) {
            (Some(at), _) => at,
            (None, Some(_)) => DateTime::from_timestamp(SEEDED_EPOCH, 0).unwrap_or_default(),
            (None, None) => Utc::now(),
        }
    }

    pub fn register(&mut self, schema: SeederSchema) -> HarnessResult<()> {
        if self.schemas.contains_key(&schema.name) {
            return Err(HarnessError::configuration(format!(
                "Seeder schema '{}' is already registered",
                schema.name
            )));
        }
        validate_identifier(&schema.table)?;
        for rel in &schema.relationships {
            validate_identifier(&rel.foreign_key)?;
            validate_identifier(&rel.local_key)?;
            if rel.kind == RelationshipKind::ManyToMany {
                let pivot = rel.pivot.as_ref().ok_or_else(|| {
                    HarnessError::configuration(format!(
                        "Many-to-many relationship from '{}' to '{}' needs a pivot table",
                        schema.name, rel.target
                    ))
                })?;
                validate_identifier(&pivot.table)?;
            }
        }
        debug!(schema = %schema.name, table = %schema.table, "Registered seeder schema");
        self.schemas.insert(schema.name.clone(), schema);
        Ok(())
    }

    pub fn schema_names(&self) -> Vec<String> {
        self.schemas.keys().cloned().collect()
    }

    fn schema(&self, name: &str) -> HarnessResult<&SeederSchema> {
        self.schemas.get(name).ok_or_else(|| {
            HarnessError::configuration(format!("Seeder schema '{name}' is not registered"))
        })
    }

    /// Seeding order for `names` (every schema when `None`), dependencies first.
    pub fn resolve_order(&self, names: Option<&[&str]>) -> HarnessResult<Vec<String>> {
        let mut graph = DependencyGraph::new();
        for (name, schema) in &self.schemas {
            graph.add_node(name.clone());
            for dep in schema.dependency_names() {
                self.schema(&dep).map_err(|_| {
                    HarnessError::configuration(format!(
                        "Seeder schema '{name}' depends on unregistered schema '{dep}'"
                    ))
                })?;
                graph.add_edge(name.clone(), dep);
            }
            for rel in &schema.relationships {
                if rel.kind == RelationshipKind::OneToMany {
                    self.schema(&rel.target)?;
                }
            }
        }

        match names {
            Some(names) => {
                for name in names {
                    self.schema(name)?;
                }
                graph.order_from(names)
            }
            None => graph.order(),
        }
    }

    /// Seed `names` (every registered schema when `None`) on `conn`,
    /// outside any test transaction.
    ///
    /// A dependency cycle is reported before anything is written.
    pub async fn seed(
        &mut self,
        conn: &mut PooledConnection,
        names: Option<&[&str]>,
    ) -> HarnessResult<SeedReport> {
        self.seed_scoped(conn, UNSCOPED, names).await
    }

    /// Seed through an active test transaction. Foreign keys resolve only
    /// against records seeded in the same transaction.
    pub async fn seed_in(
        &mut self,
        tx: &TransactionManager,
        ctx: &TransactionContext,
        names: Option<&[&str]>,
    ) -> HarnessResult<SeedReport> {
        let mut conn = tx.connection(ctx).await?;
        self.seed_scoped(&mut conn, ctx.id(), names).await
    }

    async fn seed_scoped(
        &mut self,
        conn: &mut PooledConnection,
        scope: &str,
        names: Option<&[&str]>,
    ) -> HarnessResult<SeedReport> {
        let started = Instant::now();
        let order = self.resolve_order(names)?;
        let mut report = SeedReport {
            order: order.clone(),
            ..SeedReport::default()
        };

        if self.config.truncate_before_seeding {
            self.clear_targets(conn, scope, &order).await?;
        }

        let now = self.clock();
        let mut this_run: HashMap<String, Vec<Record>> = HashMap::new();
        for name in &order {
            let schema = self.schema(name)?.clone();
            let mut records = schema.build_records(&mut self.rng, now);
            assign_parent_keys(
                &schema,
                &mut records,
                self.seeded.get(scope),
                &mut self.rng,
                None,
            )?;
            let stored = self.insert_batched(conn, &schema.table, &records).await?;
            debug!(schema = %name, records = stored.len(), scope, "Seeded schema");
            *report.inserted.entry(name.clone()).or_default() += stored.len();
            self.remember(scope, name, stored.iter().cloned());
            this_run.insert(name.clone(), stored);
        }

        for name in &order {
            let schema = self.schema(name)?.clone();
            let parents = this_run.get(name).cloned().unwrap_or_default();
            for rel in &schema.relationships {
                match rel.kind {
                    RelationshipKind::OneToMany => {
                        self.seed_children(conn, scope, rel, &parents, &mut report)
                            .await?;
                    }
                    RelationshipKind::ManyToMany => {
                        self.seed_pivot(conn, scope, rel, &parents, &mut report)
                            .await?;
                    }
                    RelationshipKind::ManyToOne | RelationshipKind::OneToOne => {}
                }
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            schemas = report.order.len(),
            records = report.total(),
            relationship_rows = report.relationship_rows,
            duration_ms = report.duration_ms,
            "Seeding complete"
        );
        Ok(report)
    }

    fn remember(&mut self, scope: &str, name: &str, records: impl IntoIterator<Item = Record>) {
        self.seeded
            .entry(scope.to_string())
            .or_default()
            .entry(name.to_string())
            .or_default()
            .extend(records);
    }

    async fn clear_targets(
        &mut self,
        conn: &mut PooledConnection,
        scope: &str,
        order: &[String],
    ) -> HarnessResult<()> {
        let mut tables: Vec<(String, Option<String>)> = Vec::new();
        for name in order {
            let schema = self.schema(name)?;
            for rel in &schema.relationships {
                match (&rel.kind, &rel.pivot) {
                    (RelationshipKind::ManyToMany, Some(pivot)) => {
                        tables.push((pivot.table.clone(), None));
                    }
                    (RelationshipKind::OneToMany, _) => {
                        let child = self.schema(&rel.target)?;
                        tables.push((child.table.clone(), Some(child.name.clone())));
                    }
                    _ => {}
                }
            }
        }
        // Dependents go first
        for name in order.iter().rev() {
            let schema = self.schema(name)?;
            tables.push((schema.table.clone(), Some(schema.name.clone())));
        }

        let mode = ClearMode::Truncate {
            cascade: true,
            reset_identity: true,
        };
        let mut cleared: Vec<&str> = Vec::new();
        for (table, schema) in &tables {
            if cleared.contains(&table.as_str()) {
                continue;
            }
            let removed = conn.clear(table, mode).await?;
            debug!(table = %table, removed, "Cleared before seeding");
            cleared.push(table);
            if let Some(records) = self.seeded.get_mut(scope) {
                records.remove(schema.as_deref().unwrap_or(table.as_str()));
            }
        }
        Ok(())
    }

    async fn insert_batched(
        &self,
        conn: &mut PooledConnection,
        table: &str,
        records: &[Record],
    ) -> HarnessResult<Vec<Record>> {
        let batch_size = self.config.batch_size.max(1);
        let mut stored = Vec::with_capacity(records.len());
        for batch in records.chunks(batch_size) {
            stored.extend(conn.insert(table, batch).await?);
        }
        Ok(stored)
    }

    async fn seed_children(
        &mut self,
        conn: &mut PooledConnection,
        scope: &str,
        rel: &RelationshipDefinition,
        parents: &[Record],
        report: &mut SeedReport,
    ) -> HarnessResult<()> {
        let child_schema = self.schema(&rel.target)?.clone();
        let now = self.clock();
        let mut children = Vec::with_capacity(parents.len() * rel.per_parent);
        for parent in parents {
            let key = record_key(parent, &rel.local_key)?;
            for _ in 0..rel.per_parent {
                let mut child = child_schema.build_record(&mut self.rng, children.len(), now);
                child.insert(rel.foreign_key.clone(), key.clone());
                children.push(child);
            }
        }
        assign_parent_keys(
            &child_schema,
            &mut children,
            self.seeded.get(scope),
            &mut self.rng,
            Some(&rel.foreign_key),
        )?;

        let stored = self.insert_batched(conn, &child_schema.table, &children).await?;
        report.relationship_rows += stored.len();
        *report.inserted.entry(child_schema.name.clone()).or_default() += stored.len();
        self.remember(scope, &child_schema.name, stored);
        Ok(())
    }

    async fn seed_pivot(
        &mut self,
        conn: &mut PooledConnection,
        scope: &str,
        rel: &RelationshipDefinition,
        parents: &[Record],
        report: &mut SeedReport,
    ) -> HarnessResult<()> {
        let Some(pivot) = rel.pivot.as_ref() else {
            return Ok(());
        };
        let targets = seeded_records(self.seeded.get(scope), &rel.target)?;
        let mut rows = Vec::new();
        for parent in parents {
            let source_key = record_key(parent, &rel.local_key)?;
            let links = self.rng.gen_range(1..=MAX_PIVOT_LINKS).min(targets.len());
            for target in targets.choose_multiple(&mut self.rng, links) {
                let mut row = Record::new();
                row.insert(pivot.source_column.clone(), source_key.clone());
                row.insert(pivot.target_column.clone(), record_key(target, &rel.local_key)?);
                rows.push(row);
            }
        }

        let stored = self.insert_batched(conn, &pivot.table, &rows).await?;
        report.relationship_rows += stored.len();
        *report.inserted.entry(pivot.table.clone()).or_default() += stored.len();
        self.remember(scope, &pivot.table, stored);
        Ok(())
    }

    /// Records [`Seeder::seed`] inserted for `name`, in insertion order.
    pub fn get_seeded_data(&self, name: &str) -> HarnessResult<&[Record]> {
        seeded_records(self.seeded.get(UNSCOPED), name)
    }

    /// Records seeded for `name` inside the transaction `ctx`.
    pub fn get_seeded_data_in(&self, ctx: &TransactionContext, name: &str) -> HarnessResult<&[Record]> {
        seeded_records(self.seeded.get(ctx.id()), name)
    }

    pub fn get_random_record(&mut self, name: &str) -> HarnessResult<Record> {
        self.random_record(UNSCOPED, name)
    }

    pub fn get_random_record_in(&mut self, ctx: &TransactionContext, name: &str) -> HarnessResult<Record> {
        self.random_record(ctx.id(), name)
    }

    fn random_record(&mut self, scope: &str, name: &str) -> HarnessResult<Record> {
        let records = seeded_records(self.seeded.get(scope), name)?;
        records
            .choose(&mut self.rng)
            .cloned()
            .ok_or_else(|| HarnessError::no_seeded_data(name))
    }

    /// Forget every seeded record. The database is untouched.
    pub fn clear_seeded_data(&mut self) {
        self.seeded.clear();
    }

    /// Forget the records seeded inside `ctx` only.
    pub fn clear_seeded_data_for(&mut self, ctx: &TransactionContext) {
        if self.seeded.remove(ctx.id()).is_some() {
            debug!(transaction = %ctx.id(), "Forgot seeded records");
        }
    }
}

fn seeded_records<'a>(seeded: Option<&'a SeededRecords>, name: &str) -> HarnessResult<&'a [Record]> {
    match seeded.and_then(|records| records.get(name)) {
        Some(records) if !records.is_empty() => Ok(records),
        _ => Err(HarnessError::no_seeded_data(name)),
    }
}

fn record_key(record: &Record, key: &str) -> HarnessResult<JsonValue> {
    match record.get(key) {
        Some(value) if !value.is_null() => Ok(value.clone()),
        _ => Err(HarnessError::invalid_input(format!(
            "Seeded record has no '{key}' value to reference"
        ))),
    }
}

/// Fill many-to-one and one-to-one foreign keys from already seeded targets.
fn assign_parent_keys(
    schema: &SeederSchema,
    records: &mut [Record],
    seeded: Option<&SeededRecords>,
    rng: &mut StdRng,
    skip_key: Option<&str>,
) -> HarnessResult<()> {
    for rel in &schema.relationships {
        if skip_key == Some(rel.foreign_key.as_str()) {
            continue;
        }
        match rel.kind {
            RelationshipKind::ManyToOne => {
                let targets = seeded_records(seeded, &rel.target)?;
                for record in records.iter_mut() {
                    if let Some(target) = targets.choose(rng) {
                        record.insert(rel.foreign_key.clone(), record_key(target, &rel.local_key)?);
                    }
                }
            }
            RelationshipKind::OneToOne => {
                let targets = seeded_records(seeded, &rel.target)?;
                if records.len() > targets.len() {
                    return Err(HarnessError::invalid_input(format!(
                        "One-to-one relationship from '{}' needs {} '{}' records, found {}",
                        schema.name,
                        records.len(),
                        rel.target,
                        targets.len()
                    )));
                }
                for (record, target) in records.iter_mut().zip(targets) {
                    record.insert(rel.foreign_key.clone(), record_key(target, &rel.local_key)?);
                }
            }
            RelationshipKind::OneToMany | RelationshipKind::ManyToMany => {}
        }
    }
    Ok(())
}
