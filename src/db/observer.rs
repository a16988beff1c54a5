//! Hooks for watching pool traffic.

use crate::models::{BackendKind, QueryParam};
use serde::Serialize;

/// Receives every operation issued through pooled connections.
///
/// Calls are synchronous and must not block; observers record and return.
pub trait QueryObserver: Send + Sync + 'static {
    /// Called before the operation runs. Returns an id passed back to
    /// [`QueryObserver::on_query_end`].
    fn on_query_start(
        &self,
        query: &str,
        params: &[QueryParam],
        backend: BackendKind,
        connection_id: &str,
    ) -> String;

    fn on_query_end(&self, query_id: &str, rows_affected: Option<u64>, error: Option<&str>);
}

/// Pool lifecycle notifications, delivered over a broadcast channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PoolEvent {
    ConnectionCreated { pool: String, connection_id: String },
    ConnectionDestroyed { pool: String, connection_id: String },
    /// Three consecutive health checks failed
    Unhealthy { pool: String, consecutive_failures: u32 },
    Recovered { pool: String },
    Exhausted { pool: String, attempts: u32 },
}
