//! Query telemetry for pooled connections.
//!
//! [`PerformanceMonitor`] is installed on pools as their [`QueryObserver`].
//! It times every operation, keeps completed records for a retention window,
//! raises [`MonitorEvent`]s on a broadcast channel, and summarizes the
//! window on demand. It never blocks or fails the operations it watches.

pub mod export;
pub mod normalize;
mod sampler;

pub use export::ExportFormat;

use crate::db::observer::QueryObserver;
use crate::db::pool::{ConnectionPool, WeakPool};
use crate::models::{BackendKind, QueryParam};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How often the sampler records pool activity and resident memory.
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

/// How long completed records and load samples are kept.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(3600);

const EVENT_CAPACITY: usize = 256;
const SLOWEST_LIMIT: usize = 10;
/// Executions of one shape in a window that suggest an N+1 access pattern.
const REPEATED_SHAPE_LIMIT: usize = 50;
const ERROR_RATE_LIMIT: f64 = 0.05;
/// Share of slow executions in a window worth a recommendation.
const SLOW_QUERY_RATIO: f64 = 0.10;
/// Share of `max_concurrent_connections` above which pool usage is high.
pub(crate) const POOL_USAGE_LIMIT: f64 = 0.8;

/// Alert thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceThresholds {
    pub slow_query_ms: u64,
    pub high_memory_bytes: u64,
    pub max_concurrent_connections: usize,
    pub lock_wait_ms: u64,
    pub min_cache_hit_ratio: f64,
}

impl Default for PerformanceThresholds {
    fn default() -> Self {
        Self {
            slow_query_ms: 1000,
            high_memory_bytes: 512 * 1024 * 1024,
            max_concurrent_connections: 10,
            lock_wait_ms: 5000,
            min_cache_hit_ratio: 0.9,
        }
    }
}

impl PerformanceThresholds {
    pub fn with_slow_query(mut self, threshold: Duration) -> Self {
        self.slow_query_ms = threshold.as_millis() as u64;
        self
    }

    pub fn with_max_concurrent_connections(mut self, max: usize) -> Self {
        self.max_concurrent_connections = max;
        self
    }

    pub fn with_high_memory(mut self, bytes: u64) -> Self {
        self.high_memory_bytes = bytes;
        self
    }
}

/// One completed operation. Never mutated after completion.
#[derive(Debug, Clone, Serialize)]
pub struct QueryPerformanceRecord {
    pub id: String,
    /// Literal-free shape, see [`normalize::normalize`]
    pub query: String,
    pub sql: String,
    pub params: Vec<QueryParam>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: f64,
    pub rows_affected: Option<u64>,
    pub backend: BackendKind,
    pub connection_id: String,
    pub plan: Option<String>,
    pub error: Option<String>,
}

impl QueryPerformanceRecord {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Alerts raised by the monitor.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MonitorEvent {
    SlowQuery {
        query_id: String,
        query: String,
        duration_ms: f64,
        threshold_ms: u64,
    },
    QueryError {
        query_id: String,
        query: String,
        error: String,
    },
    HighMemory {
        resident_bytes: u64,
        threshold_bytes: u64,
    },
    ConnectionPressure {
        pool: String,
        active: usize,
        limit: usize,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolLoad {
    pub pool: String,
    pub active: usize,
    pub idle: usize,
    pub pending: usize,
}

/// One background sample.
#[derive(Debug, Clone, Serialize)]
pub struct LoadSample {
    pub at: DateTime<Utc>,
    /// `None` where the platform does not expose it
    pub resident_bytes: Option<u64>,
    pub pools: Vec<PoolLoad>,
}

impl LoadSample {
    pub fn active_connections(&self) -> usize {
        self.pools.iter().map(|p| p.active).sum()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceSummary {
    pub window_minutes: u64,
    pub generated_at: DateTime<Utc>,
    pub total_queries: usize,
    pub slow_queries: usize,
    pub error_count: usize,
    pub average_duration_ms: f64,
    pub min_duration_ms: f64,
    pub max_duration_ms: f64,
    /// Share of executions whose shape had already run in the window
    pub cache_hit_ratio: f64,
    pub peak_concurrent_connections: usize,
    /// Peak concurrency as a share of `max_concurrent_connections`
    pub pool_usage_ratio: f64,
    pub lock_waits: usize,
    pub peak_resident_bytes: Option<u64>,
    pub slowest_queries: Vec<QueryPerformanceRecord>,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryPattern {
    pub shape: String,
    pub count: usize,
    pub total_duration_ms: f64,
    pub average_duration_ms: f64,
    pub max_duration_ms: f64,
    pub errors: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableUsage {
    pub table: String,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryPatterns {
    pub window_minutes: u64,
    pub patterns: Vec<QueryPattern>,
    pub tables: Vec<TableUsage>,
}

struct InFlight {
    sql: String,
    params: Vec<QueryParam>,
    backend: BackendKind,
    connection_id: String,
    started_at: DateTime<Utc>,
    start: Instant,
}

#[derive(Default)]
struct MonitorState {
    in_flight: HashMap<String, InFlight>,
    completed: VecDeque<QueryPerformanceRecord>,
    load_history: VecDeque<LoadSample>,
    pools: Vec<WeakPool>,
}

struct MonitorInner {
    thresholds: PerformanceThresholds,
    sample_interval: Duration,
    retention: Duration,
    state: parking_lot::Mutex<MonitorState>,
    events: broadcast::Sender<MonitorEvent>,
    sampler: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Drop for MonitorInner {
    fn drop(&mut self) {
        if let Some(handle) = self.sampler.get_mut().take() {
            handle.abort();
        }
    }
}

/// Collects timing for every operation run through the attached pools.
///
/// Cheap to clone; clones share records and subscribers.
#[derive(Clone)]
pub struct PerformanceMonitor {
    inner: Arc<MonitorInner>,
}

impl std::fmt::Debug for PerformanceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("PerformanceMonitor")
            .field("thresholds", &self.inner.thresholds)
            .field("in_flight", &state.in_flight.len())
            .field("completed", &state.completed.len())
            .finish_non_exhaustive()
    }
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new(PerformanceThresholds::default())
    }
}

impl PerformanceMonitor {
    pub fn new(thresholds: PerformanceThresholds) -> Self {
        Self::with_sampling(thresholds, DEFAULT_SAMPLE_INTERVAL, DEFAULT_RETENTION)
    }

    pub fn with_sampling(
        thresholds: PerformanceThresholds,
        sample_interval: Duration,
        retention: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(MonitorInner {
                thresholds,
                sample_interval,
                retention,
                state: parking_lot::Mutex::new(MonitorState::default()),
                events,
                sampler: parking_lot::Mutex::new(None),
            }),
        }
    }

    pub fn thresholds(&self) -> &PerformanceThresholds {
        &self.inner.thresholds
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.inner.events.subscribe()
    }

    /// Observe every operation on `pool` and include it in load samples.
    pub fn attach_pool(&self, pool: &ConnectionPool) {
        pool.set_observer(Arc::new(self.clone()));
        self.inner.state.lock().pools.push(pool.downgrade());
        debug!(pool = %pool.name(), "Performance monitor attached");
    }

    /// Start timing an operation. Returns the id for [`Self::complete_query`].
    pub fn record_query(
        &self,
        query: &str,
        params: &[QueryParam],
        backend: BackendKind,
        connection_id: &str,
    ) -> String {
        let id = format!("q_{}", uuid::Uuid::new_v4().simple());
        let entry = InFlight {
            sql: query.to_string(),
            params: params.to_vec(),
            backend,
            connection_id: connection_id.to_string(),
            started_at: Utc::now(),
            start: Instant::now(),
        };
        self.inner.state.lock().in_flight.insert(id.clone(), entry);
        id
    }

    /// Finish timing an operation and raise `SlowQuery` / `QueryError`.
    ///
    /// Returns `None` for an unknown or already completed id.
    pub fn complete_query(
        &self,
        query_id: &str,
        rows_affected: Option<u64>,
        plan: Option<String>,
        error: Option<&str>,
    ) -> Option<QueryPerformanceRecord> {
        let Some(entry) = self.inner.state.lock().in_flight.remove(query_id) else {
            debug!(query_id, "Completion for unknown query ignored");
            return None;
        };
        let duration_ms = entry.start.elapsed().as_secs_f64() * 1000.0;
        let record = QueryPerformanceRecord {
            id: query_id.to_string(),
            query: normalize::normalize(&entry.sql, entry.backend),
            sql: entry.sql,
            params: entry.params,
            started_at: entry.started_at,
            ended_at: Utc::now(),
            duration_ms,
            rows_affected,
            backend: entry.backend,
            connection_id: entry.connection_id,
            plan,
            error: error.map(str::to_string),
        };

        {
            let mut state = self.inner.state.lock();
            state.completed.push_back(record.clone());
            self.prune(&mut state, record.ended_at);
        }

        let threshold_ms = self.inner.thresholds.slow_query_ms;
        if duration_ms >= threshold_ms as f64 {
            warn!(
                query = %record.query,
                duration_ms = duration_ms as u64,
                threshold_ms,
                "Slow query"
            );
            let _ = self.inner.events.send(MonitorEvent::SlowQuery {
                query_id: record.id.clone(),
                query: record.query.clone(),
                duration_ms,
                threshold_ms,
            });
        }
        if let Some(error) = &record.error {
            debug!(query = %record.query, error = %error, "Query failed");
            let _ = self.inner.events.send(MonitorEvent::QueryError {
                query_id: record.id.clone(),
                query: record.query.clone(),
                error: error.clone(),
            });
        }
        Some(record)
    }

    pub fn in_flight_count(&self) -> usize {
        self.inner.state.lock().in_flight.len()
    }

    /// Every retained record, oldest first.
    pub fn records(&self) -> Vec<QueryPerformanceRecord> {
        self.inner.state.lock().completed.iter().cloned().collect()
    }

    pub fn load_history(&self) -> Vec<LoadSample> {
        self.inner.state.lock().load_history.iter().cloned().collect()
    }

    /// Drop all records and samples. Attached pools stay attached.
    pub fn reset(&self) {
        let mut state = self.inner.state.lock();
        state.in_flight.clear();
        state.completed.clear();
        state.load_history.clear();
    }

    fn prune(&self, state: &mut MonitorState, now: DateTime<Utc>) {
        let retention =
            chrono::Duration::from_std(self.inner.retention).unwrap_or(chrono::Duration::hours(1));
        let cutoff = now - retention;
        // Operations whose completion never arrived
        state.in_flight.retain(|_, entry| entry.started_at >= cutoff);
        while state.completed.front().is_some_and(|r| r.ended_at < cutoff) {
            state.completed.pop_front();
        }
        while state.load_history.front().is_some_and(|s| s.at < cutoff) {
            state.load_history.pop_front();
        }
    }

    fn window(
        &self,
        window_minutes: u64,
    ) -> (Vec<QueryPerformanceRecord>, Vec<LoadSample>, usize) {
        let cutoff = i64::try_from(window_minutes)
            .ok()
            .and_then(chrono::Duration::try_minutes)
            .and_then(|span| Utc::now().checked_sub_signed(span))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let state = self.inner.state.lock();
        let records = state
            .completed
            .iter()
            .filter(|r| r.ended_at >= cutoff)
            .cloned()
            .collect();
        let samples = state
            .load_history
            .iter()
            .filter(|s| s.at >= cutoff)
            .cloned()
            .collect();
        (records, samples, state.in_flight.len())
    }

    /// Aggregate the records completed in the last `window_minutes`.
    pub fn get_performance_summary(&self, window_minutes: u64) -> PerformanceSummary {
        let (records, samples, in_flight) = self.window(window_minutes);
        let thresholds = &self.inner.thresholds;

        let total = records.len();
        let slow_queries = records
            .iter()
            .filter(|r| r.duration_ms >= thresholds.slow_query_ms as f64)
            .count();
        let error_count = records.iter().filter(|r| r.is_error()).count();
        let (average, min, max) = if total == 0 {
            (0.0, 0.0, 0.0)
        } else {
            let sum: f64 = records.iter().map(|r| r.duration_ms).sum();
            let min = records.iter().map(|r| r.duration_ms).fold(f64::INFINITY, f64::min);
            let max = records.iter().map(|r| r.duration_ms).fold(0.0, f64::max);
            (sum / total as f64, min, max)
        };

        let cache_hit_ratio = cache_hit_ratio(&records);
        let peak_concurrent_connections = peak_concurrency(&records)
            .max(samples.iter().map(LoadSample::active_connections).max().unwrap_or(0))
            .max(in_flight);
        let pool_usage_ratio = match thresholds.max_concurrent_connections {
            0 => 0.0,
            limit => peak_concurrent_connections as f64 / limit as f64,
        };
        let lock_waits = records
            .iter()
            .filter(|r| is_lock_wait(r, thresholds.lock_wait_ms))
            .count();
        let peak_resident_bytes = samples.iter().filter_map(|s| s.resident_bytes).max();

        let mut slowest = records.clone();
        slowest.sort_by(|a, b| b.duration_ms.total_cmp(&a.duration_ms));
        slowest.truncate(SLOWEST_LIMIT);

        let mut summary = PerformanceSummary {
            window_minutes,
            generated_at: Utc::now(),
            total_queries: total,
            slow_queries,
            error_count,
            average_duration_ms: average,
            min_duration_ms: min,
            max_duration_ms: max,
            cache_hit_ratio,
            peak_concurrent_connections,
            pool_usage_ratio,
            lock_waits,
            peak_resident_bytes,
            slowest_queries: slowest,
            recommendations: Vec::new(),
        };
        summary.recommendations = self.recommend(&summary, &records);
        summary
    }

    fn recommend(
        &self,
        summary: &PerformanceSummary,
        records: &[QueryPerformanceRecord],
    ) -> Vec<String> {
        let thresholds = &self.inner.thresholds;
        let mut out = Vec::new();
        if summary.total_queries == 0 {
            return out;
        }

        let slow_ratio = summary.slow_queries as f64 / summary.total_queries as f64;
        let slowest = summary.slowest_queries.first();
        if let (true, Some(slowest)) = (slow_ratio > SLOW_QUERY_RATIO, slowest) {
            out.push(format!(
                "{} quer{} ({:.0}%) took longer than {}ms; review indexes and plans starting with `{}`",
                summary.slow_queries,
                if summary.slow_queries == 1 { "y" } else { "ies" },
                slow_ratio * 100.0,
                thresholds.slow_query_ms,
                slowest.query
            ));
        }

        let error_rate = summary.error_count as f64 / summary.total_queries as f64;
        if error_rate > ERROR_RATE_LIMIT {
            out.push(format!(
                "{:.1}% of queries failed; check test data setup and schema drift",
                error_rate * 100.0
            ));
        }

        if summary.cache_hit_ratio < thresholds.min_cache_hit_ratio {
            out.push(format!(
                "Only {:.0}% of executions reuse a known query shape; prefer parameterized statements",
                summary.cache_hit_ratio * 100.0
            ));
        }

        if summary.pool_usage_ratio > POOL_USAGE_LIMIT {
            out.push(format!(
                "Connection pool usage peaked at {:.0}% ({} of {}); reduce test parallelism or raise pool size",
                summary.pool_usage_ratio * 100.0,
                summary.peak_concurrent_connections,
                thresholds.max_concurrent_connections
            ));
        }

        if summary.lock_waits > 0 {
            out.push(format!(
                "{} lock wait(s) observed; keep per-test transactions short and touch tables in a consistent order",
                summary.lock_waits
            ));
        }

        if summary
            .peak_resident_bytes
            .is_some_and(|bytes| bytes > thresholds.high_memory_bytes)
        {
            out.push(format!(
                "Resident memory exceeded {}; reduce fixture sizes or batch results",
                humansize::format_size(thresholds.high_memory_bytes, humansize::BINARY)
            ));
        }

        let mut counts: HashMap<&str, usize> = HashMap::new();
        for record in records {
            *counts.entry(record.query.as_str()).or_default() += 1;
        }
        let mut repeated: Vec<(&str, usize)> = counts
            .into_iter()
            .filter(|(_, count)| *count > REPEATED_SHAPE_LIMIT)
            .collect();
        repeated.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
        for (shape, count) in repeated {
            out.push(format!(
                "`{shape}` ran {count} times; this looks like an N+1 pattern, consider batching or a join"
            ));
        }
        out
    }

    /// Query shapes ranked by frequency, plus the most-touched tables.
    pub fn get_query_patterns(&self, window_minutes: u64, limit: usize) -> QueryPatterns {
        let (records, _, _) = self.window(window_minutes);

        let mut by_shape: HashMap<&str, QueryPattern> = HashMap::new();
        let mut by_table: HashMap<String, usize> = HashMap::new();
        for record in &records {
            let pattern = by_shape
                .entry(record.query.as_str())
                .or_insert_with(|| QueryPattern {
                    shape: record.query.clone(),
                    count: 0,
                    total_duration_ms: 0.0,
                    average_duration_ms: 0.0,
                    max_duration_ms: 0.0,
                    errors: 0,
                });
            pattern.count += 1;
            pattern.total_duration_ms += record.duration_ms;
            pattern.max_duration_ms = pattern.max_duration_ms.max(record.duration_ms);
            if record.is_error() {
                pattern.errors += 1;
            }
            for table in normalize::referenced_tables(&record.sql, record.backend) {
                *by_table.entry(table).or_default() += 1;
            }
        }

        let mut patterns: Vec<QueryPattern> = by_shape
            .into_values()
            .map(|mut p| {
                p.average_duration_ms = p.total_duration_ms / p.count as f64;
                p
            })
            .collect();
        patterns.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then(b.total_duration_ms.total_cmp(&a.total_duration_ms))
                .then(a.shape.cmp(&b.shape))
        });
        patterns.truncate(limit);

        let mut tables: Vec<TableUsage> = by_table
            .into_iter()
            .map(|(table, count)| TableUsage { table, count })
            .collect();
        tables.sort_by(|a, b| b.count.cmp(&a.count).then(a.table.cmp(&b.table)));
        tables.truncate(limit);

        QueryPatterns {
            window_minutes,
            patterns,
            tables,
        }
    }
}

impl QueryObserver for PerformanceMonitor {
    fn on_query_start(
        &self,
        query: &str,
        params: &[QueryParam],
        backend: BackendKind,
        connection_id: &str,
    ) -> String {
        self.record_query(query, params, backend, connection_id)
    }

    fn on_query_end(&self, query_id: &str, rows_affected: Option<u64>, error: Option<&str>) {
        self.complete_query(query_id, rows_affected, None, error);
    }
}

fn cache_hit_ratio(records: &[QueryPerformanceRecord]) -> f64 {
    if records.is_empty() {
        return 0.0;
    }
    let mut ordered: Vec<&QueryPerformanceRecord> = records.iter().collect();
    ordered.sort_by_key(|r| r.started_at);
    let mut seen = HashSet::new();
    let hits = ordered
        .into_iter()
        .filter(|r| !seen.insert(r.query.as_str()))
        .count();
    hits as f64 / records.len() as f64
}

/// Largest number of overlapping records.
fn peak_concurrency(records: &[QueryPerformanceRecord]) -> usize {
    let mut edges: Vec<(DateTime<Utc>, i32)> = records
        .iter()
        .flat_map(|r| [(r.started_at, 1), (r.ended_at, -1)])
        .collect();
    // Ends sort before starts at the same instant
    edges.sort();
    let mut current = 0i32;
    let mut peak = 0i32;
    for (_, delta) in edges {
        current += delta;
        peak = peak.max(current);
    }
    peak as usize
}

fn is_lock_wait(record: &QueryPerformanceRecord, lock_wait_ms: u64) -> bool {
    let lock_error = record.error.as_deref().is_some_and(|e| {
        let lower = e.to_lowercase();
        lower.contains("lock") || lower.contains("deadlock")
    });
    lock_error || record.duration_ms >= lock_wait_ms as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(slow_ms: u64) -> PerformanceMonitor {
        PerformanceMonitor::new(
            PerformanceThresholds::default().with_slow_query(Duration::from_millis(slow_ms)),
        )
    }

    fn run(monitor: &PerformanceMonitor, sql: &str) -> QueryPerformanceRecord {
        let id = monitor.record_query(sql, &[], BackendKind::SQLite, "c-1");
        monitor.complete_query(&id, Some(1), None, None).unwrap()
    }

    #[test]
    fn test_complete_query_normalizes() {
        let monitor = monitor(1000);
        let record = run(&monitor, "SELECT * FROM widgets WHERE qty = 5");
        assert_eq!(record.query, "SELECT * FROM widgets WHERE qty = ?");
        assert_eq!(record.sql, "SELECT * FROM widgets WHERE qty = 5");
        assert_eq!(monitor.in_flight_count(), 0);
        assert_eq!(monitor.records().len(), 1);
    }

    #[test]
    fn test_unknown_id_ignored() {
        let monitor = monitor(1000);
        assert!(monitor.complete_query("missing", None, None, None).is_none());
        let id = monitor.record_query("SELECT 1", &[], BackendKind::SQLite, "c");
        assert!(monitor.complete_query(&id, None, None, None).is_some());
        assert!(monitor.complete_query(&id, None, None, None).is_none());
    }

    #[tokio::test]
    async fn test_slow_query_event_and_summary() {
        let monitor = monitor(20);
        let mut events = monitor.subscribe();

        let id = monitor.record_query("SELECT * FROM widgets", &[], BackendKind::SQLite, "c-1");
        tokio::time::sleep(Duration::from_millis(40)).await;
        monitor.complete_query(&id, Some(3), Some("SCAN widgets".into()), None);
        run(&monitor, "SELECT 1");

        match events.try_recv().unwrap() {
            MonitorEvent::SlowQuery { query_id, threshold_ms, .. } => {
                assert_eq!(query_id, id);
                assert_eq!(threshold_ms, 20);
            }
            other => panic!("unexpected event {other:?}"),
        }

        let summary = monitor.get_performance_summary(5);
        assert_eq!(summary.total_queries, 2);
        assert_eq!(summary.slow_queries, 1);
        assert_eq!(summary.slowest_queries[0].id, id);
        assert_eq!(summary.slowest_queries[0].plan.as_deref(), Some("SCAN widgets"));
        assert!(summary.max_duration_ms >= 40.0);
        assert!(summary.min_duration_ms <= summary.average_duration_ms);
        assert!(summary.recommendations.iter().any(|r| r.contains("longer than 20ms")));
    }

    #[test]
    fn test_error_event() {
        let monitor = monitor(1000);
        let mut events = monitor.subscribe();
        let id = monitor.record_query("DELETE FROM widgets", &[], BackendKind::SQLite, "c-1");
        monitor.complete_query(&id, None, None, Some("database is locked"));

        assert!(matches!(events.try_recv().unwrap(), MonitorEvent::QueryError { .. }));
        let summary = monitor.get_performance_summary(5);
        assert_eq!(summary.error_count, 1);
        assert_eq!(summary.lock_waits, 1);
    }

    #[test]
    fn test_cache_hit_ratio_counts_repeats() {
        let monitor = monitor(1000);
        run(&monitor, "SELECT * FROM widgets WHERE qty = 1");
        run(&monitor, "SELECT * FROM widgets WHERE qty = 2");
        run(&monitor, "SELECT * FROM widgets WHERE qty = 3");
        run(&monitor, "DELETE FROM widgets");
        let summary = monitor.get_performance_summary(5);
        assert!((summary.cache_hit_ratio - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_peak_concurrency_from_overlap() {
        let monitor = monitor(1000);
        let a = monitor.record_query("SELECT 1", &[], BackendKind::SQLite, "c-1");
        let b = monitor.record_query("SELECT 2", &[], BackendKind::SQLite, "c-2");
        std::thread::sleep(Duration::from_millis(2));
        monitor.complete_query(&a, None, None, None);
        monitor.complete_query(&b, None, None, None);
        run(&monitor, "SELECT 3");
        assert_eq!(monitor.get_performance_summary(5).peak_concurrent_connections, 2);
    }

    #[test]
    fn test_query_patterns() {
        let monitor = monitor(1000);
        for qty in 0..3 {
            run(&monitor, &format!("SELECT * FROM widgets WHERE qty = {qty}"));
        }
        run(&monitor, "INSERT INTO gadgets (sku) VALUES ('x')");

        let patterns = monitor.get_query_patterns(5, 10);
        assert_eq!(patterns.patterns.len(), 2);
        assert_eq!(patterns.patterns[0].shape, "SELECT * FROM widgets WHERE qty = ?");
        assert_eq!(patterns.patterns[0].count, 3);
        assert_eq!(patterns.tables[0].table, "widgets");
        assert_eq!(patterns.tables[0].count, 3);

        let limited = monitor.get_query_patterns(5, 1);
        assert_eq!(limited.patterns.len(), 1);
    }

    #[test]
    fn test_repeated_shape_recommendation() {
        let monitor = monitor(1000);
        for n in 0..=REPEATED_SHAPE_LIMIT {
            run(&monitor, &format!("SELECT * FROM widgets WHERE qty = {n}"));
        }
        let summary = monitor.get_performance_summary(5);
        assert!(summary.recommendations.iter().any(|r| r.contains("N+1")));
    }

    #[test]
    fn test_empty_summary() {
        let summary = monitor(1000).get_performance_summary(5);
        assert_eq!(summary.total_queries, 0);
        assert_eq!(summary.peak_concurrent_connections, 0);
        assert!(summary.recommendations.is_empty());
    }

    #[test]
    fn test_rare_slow_query_is_not_recommended() {
        let monitor = monitor(50);
        for n in 0..19 {
            run(&monitor, &format!("SELECT * FROM widgets WHERE qty = {n}"));
        }
        // One slow execution in twenty stays under the ratio
        let id = monitor.record_query("SELECT * FROM gadgets", &[], BackendKind::SQLite, "c-1");
        std::thread::sleep(Duration::from_millis(60));
        monitor.complete_query(&id, None, None, None);

        let summary = monitor.get_performance_summary(5);
        assert_eq!(summary.total_queries, 20);
        assert_eq!(summary.slow_queries, 1);
        assert!(!summary.recommendations.iter().any(|r| r.contains("longer than")));
    }

    #[test]
    fn test_pool_usage_recommendation() {
        let monitor = PerformanceMonitor::new(
            PerformanceThresholds::default().with_max_concurrent_connections(2),
        );
        run(&monitor, "SELECT 1");
        let summary = monitor.get_performance_summary(5);
        assert!((summary.pool_usage_ratio - 0.5).abs() < f64::EPSILON);
        assert!(!summary.recommendations.iter().any(|r| r.contains("pool usage")));

        let a = monitor.record_query("SELECT 1", &[], BackendKind::SQLite, "c-1");
        let b = monitor.record_query("SELECT 2", &[], BackendKind::SQLite, "c-2");
        std::thread::sleep(Duration::from_millis(2));
        monitor.complete_query(&a, None, None, None);
        monitor.complete_query(&b, None, None, None);
        let summary = monitor.get_performance_summary(5);
        assert_eq!(summary.peak_concurrent_connections, 2);
        assert!(summary.recommendations.iter().any(|r| r.contains("pool usage peaked at 100%")));
    }

    #[test]
    fn test_unbounded_window() {
        let monitor = monitor(1000);
        run(&monitor, "SELECT 1");
        assert_eq!(monitor.get_performance_summary(u64::MAX).total_queries, 1);
        assert_eq!(monitor.get_query_patterns(u64::MAX, 5).patterns.len(), 1);
    }

    #[test]
    fn test_abandoned_in_flight_entries_expire() {
        let monitor = PerformanceMonitor::with_sampling(
            PerformanceThresholds::default(),
            DEFAULT_SAMPLE_INTERVAL,
            Duration::from_millis(20),
        );
        monitor.record_query("SELECT 1", &[], BackendKind::SQLite, "c-1");
        std::thread::sleep(Duration::from_millis(40));
        run(&monitor, "SELECT 2");
        assert_eq!(monitor.in_flight_count(), 0);
        assert_eq!(monitor.get_performance_summary(5).peak_concurrent_connections, 1);
    }
}
