//! Dependency-aware data removal between tests.
//!
//! Tables are cleared one at a time, dependents before the tables they
//! reference. Failures on individual tables are collected into the
//! [`CleanupResult`] instead of aborting the run; a reference cycle between
//! the selected tables aborts it before anything is cleared.

use crate::db::backend::ClearMode;
use crate::db::connection::PooledConnection;
use crate::db::dialect::validate_identifier;
use crate::db::pool::ConnectionPool;
use crate::db::transaction::{TransactionContext, TransactionManager};
use crate::error::{HarnessError, HarnessResult};
use crate::fixtures::graph::DependencyGraph;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeSet;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Row count above which a table is truncated rather than deleted from.
pub const DEFAULT_TRUNCATE_THRESHOLD: u64 = 10_000;

#[derive(Debug, Clone)]
pub struct CleanupConfig {
    /// Clear dependents before the tables they reference
    pub respect_dependencies: bool,
    /// Let truncation cascade to referencing tables
    pub cascade: bool,
    pub reset_sequences: bool,
    /// Exact table names never touched
    pub preserve: Vec<String>,
    /// Regular expressions; matching tables are never touched
    pub preserve_patterns: Vec<String>,
    /// Re-count after clearing and report leftovers
    pub verify: bool,
    pub truncate_threshold: u64,
    /// Extra `(dependent, dependency)` edges the catalog does not declare
    pub extra_dependencies: Vec<(String, String)>,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            respect_dependencies: true,
            cascade: true,
            reset_sequences: true,
            preserve: vec!["schema_migrations".to_string(), "_sqlx_migrations".to_string()],
            preserve_patterns: Vec::new(),
            verify: true,
            truncate_threshold: DEFAULT_TRUNCATE_THRESHOLD,
            extra_dependencies: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupResult {
    pub success: bool,
    pub cleared_tables: Vec<String>,
    pub errors: Vec<String>,
    pub duration_ms: u64,
    pub records_removed: u64,
}

impl CleanupResult {
    /// Turn an unsuccessful result into [`HarnessError::CleanupVerificationFailed`].
    pub fn ensure_success(self) -> HarnessResult<Self> {
        if self.success {
            Ok(self)
        } else {
            Err(HarnessError::cleanup_verification_failed(self.errors))
        }
    }
}

/// Clears test data from one pool's database.
#[derive(Debug, Clone)]
pub struct Cleaner {
    pool: ConnectionPool,
    config: CleanupConfig,
    patterns: Vec<Regex>,
}

impl Cleaner {
    pub fn new(pool: ConnectionPool, config: CleanupConfig) -> HarnessResult<Self> {
        let patterns = config
            .preserve_patterns
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            pool,
            config,
            patterns,
        })
    }

    pub fn config(&self) -> &CleanupConfig {
        &self.config
    }

    pub fn is_preserved(&self, table: &str) -> bool {
        self.config.preserve.iter().any(|p| p == table)
            || self.patterns.iter().any(|re| re.is_match(table))
    }

    /// Clear every non-preserved table.
    pub async fn cleanup(&self) -> HarnessResult<CleanupResult> {
        let mut conn = self.pool.acquire().await?;
        let result = self.cleanup_with(&mut conn).await;
        conn.release().await;
        result
    }

    /// [`Cleaner::cleanup`] on a caller-held connection.
    pub async fn cleanup_with(&self, conn: &mut PooledConnection) -> HarnessResult<CleanupResult> {
        let tables: Vec<String> = conn
            .list_collections()
            .await?
            .into_iter()
            .filter(|t| !self.is_preserved(t))
            .collect();
        self.run(conn, tables).await
    }

    /// Clear only `tables`. Preserved names are skipped.
    pub async fn clean_tables(&self, tables: &[&str]) -> HarnessResult<CleanupResult> {
        let mut conn = self.pool.acquire().await?;
        let result = self.clean_tables_with(&mut conn, tables).await;
        conn.release().await;
        result
    }

    pub async fn clean_tables_with(
        &self,
        conn: &mut PooledConnection,
        tables: &[&str],
    ) -> HarnessResult<CleanupResult> {
        let mut selected = Vec::with_capacity(tables.len());
        for table in tables {
            validate_identifier(table)?;
            if self.is_preserved(table) {
                debug!(table = %table, "Skipping preserved table");
            } else if !selected.iter().any(|t: &String| t.as_str() == *table) {
                selected.push(table.to_string());
            }
        }
        self.run(conn, selected).await
    }

    /// Roll the test transaction back instead of deleting rows.
    pub async fn cleanup_transaction(
        &self,
        tx: &TransactionManager,
        ctx: &TransactionContext,
    ) -> CleanupResult {
        let started = Instant::now();
        let mut result = CleanupResult::default();
        if let Err(e) = tx.rollback_transaction(ctx).await {
            error!(transaction_id = %ctx.id(), error = %e, "Rollback cleanup failed");
            result.errors.push(format!("rollback of {}: {e}", ctx.id()));
        }
        result.success = result.errors.is_empty();
        result.duration_ms = started.elapsed().as_millis() as u64;
        result
    }

    /// Order in which `tables` would be cleared: dependents first.
    ///
    /// Fails with [`HarnessError::CircularDependency`] when the selected
    /// tables reference each other in a cycle.
    pub async fn clear_order(
        &self,
        conn: &mut PooledConnection,
        tables: &[String],
    ) -> HarnessResult<Vec<String>> {
        if !self.config.respect_dependencies {
            return Ok(tables.to_vec());
        }
        let members: BTreeSet<&str> = tables.iter().map(String::as_str).collect();
        let mut graph = DependencyGraph::new();
        for table in tables {
            graph.add_node(table.clone());
        }

        let edges = conn
            .foreign_keys()
            .await?
            .into_iter()
            .filter(|fk| !fk.is_self_reference())
            .map(|fk| (fk.table, fk.references_table))
            .chain(self.config.extra_dependencies.iter().cloned());
        for (dependent, dependency) in edges {
            if dependent != dependency
                && members.contains(dependent.as_str())
                && members.contains(dependency.as_str())
            {
                graph.add_edge(dependent, dependency);
            }
        }

        let mut order = graph.order()?;
        order.reverse();
        Ok(order)
    }

    async fn run(&self, conn: &mut PooledConnection, tables: Vec<String>) -> HarnessResult<CleanupResult> {
        let started = Instant::now();
        let mut result = CleanupResult::default();

        let order = match self.clear_order(conn, &tables).await {
            Ok(order) => order,
            Err(e @ HarnessError::CircularDependency { .. }) => {
                error!(error = %e, "Reference cycle between tables, nothing cleared");
                return Err(e);
            }
            Err(e) => {
                warn!(error = %e, "Could not read references, clearing in listed order");
                result.errors.push(format!("reference lookup: {e}"));
                tables.clone()
            }
        };

        for table in &order {
            match self.clear_table(conn, table).await {
                Ok(removed) => {
                    result.records_removed += removed;
                    result.cleared_tables.push(table.clone());
                }
                Err(e) => {
                    error!(table = %table, error = %e, "Failed to clear table");
                    result.errors.push(format!("{table}: {e}"));
                }
            }
        }

        if self.config.verify {
            for table in &result.cleared_tables {
                match conn.count(table).await {
                    Ok(0) => {}
                    Ok(left) => result.errors.push(format!("{table}: {left} rows remain")),
                    Err(e) => result.errors.push(format!("{table}: verification failed: {e}")),
                }
            }
        }

        result.success = result.errors.is_empty();
        result.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            tables = result.cleared_tables.len(),
            records_removed = result.records_removed,
            errors = result.errors.len(),
            duration_ms = result.duration_ms,
            "Cleanup finished"
        );
        Ok(result)
    }

    async fn clear_table(&self, conn: &mut PooledConnection, table: &str) -> HarnessResult<u64> {
        let rows = conn.count(table).await?;
        if rows > self.config.truncate_threshold {
            let mode = ClearMode::Truncate {
                cascade: self.config.cascade,
                reset_identity: self.config.reset_sequences,
            };
            let removed = conn.clear(table, mode).await?;
            debug!(table = %table, removed, "Truncated table");
            return Ok(removed);
        }

        let removed = if rows > 0 {
            conn.clear(table, ClearMode::Delete).await?
        } else {
            0
        };
        if self.config.reset_sequences {
            match conn.reset_sequence(table).await {
                Ok(()) => {}
                Err(HarnessError::Unsupported { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        debug!(table = %table, removed, "Deleted rows");
        Ok(removed)
    }
}
