//! Registry of named pools.

use crate::db::observer::QueryObserver;
use crate::db::pool::{ConnectionPool, PoolStats};
use crate::error::{HarnessError, HarnessResult};
use crate::models::ConnectionPoolConfig;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Owns every pool the harness uses, keyed by pool name.
#[derive(Clone, Default)]
pub struct PoolManager {
    pools: Arc<RwLock<HashMap<String, ConnectionPool>>>,
    observer: Arc<parking_lot::RwLock<Option<Arc<dyn QueryObserver>>>>,
}

impl std::fmt::Debug for PoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolManager").finish_non_exhaustive()
    }
}

impl PoolManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build, initialize and register a pool from `config`.
    pub async fn create(&self, config: ConnectionPoolConfig) -> HarnessResult<ConnectionPool> {
        let name = config.name.clone();
        {
            let pools = self.pools.read().await;
            if pools.contains_key(&name) {
                return Err(Self::duplicate(&name));
            }
        }

        let pool = ConnectionPool::from_config(config)?;
        pool.initialize().await?;
        self.register(pool.clone()).await?;
        Ok(pool)
    }

    /// Register an existing pool. The pool picks up the manager's observer.
    pub async fn register(&self, pool: ConnectionPool) -> HarnessResult<()> {
        let name = pool.name().to_string();
        // Re-check under the write lock; a concurrent create may have won
        let rejected = {
            let mut pools = self.pools.write().await;
            if pools.contains_key(&name) {
                Some(pool)
            } else {
                if let Some(observer) = self.observer.read().clone() {
                    pool.set_observer(observer);
                }
                pools.insert(name.clone(), pool);
                None
            }
        };

        if let Some(pool) = rejected {
            pool.close().await;
            return Err(Self::duplicate(&name));
        }
        info!(pool = %name, "Registered pool");
        Ok(())
    }

    fn duplicate(name: &str) -> HarnessError {
        HarnessError::configuration(format!("Pool '{name}' is already registered"))
    }

    pub async fn get(&self, name: &str) -> HarnessResult<ConnectionPool> {
        let pools = self.pools.read().await;
        pools
            .get(name)
            .cloned()
            .ok_or_else(|| HarnessError::pool_not_found(name))
    }

    /// Unregister and close a pool.
    pub async fn remove(&self, name: &str) -> HarnessResult<()> {
        let pool = {
            let mut pools = self.pools.write().await;
            pools.remove(name)
        };
        match pool {
            Some(pool) => {
                pool.close().await;
                info!(pool = %name, "Removed pool");
                Ok(())
            }
            None => Err(HarnessError::pool_not_found(name)),
        }
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pools.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    async fn snapshot(&self) -> Vec<ConnectionPool> {
        self.pools.read().await.values().cloned().collect()
    }

    /// Install `observer` on every current and future pool.
    pub async fn set_observer(&self, observer: Arc<dyn QueryObserver>) {
        *self.observer.write() = Some(Arc::clone(&observer));
        for pool in self.snapshot().await {
            pool.set_observer(Arc::clone(&observer));
        }
    }

    /// Initialize every registered pool, stopping at the first failure.
    pub async fn initialize_all(&self) -> HarnessResult<()> {
        for pool in self.snapshot().await {
            pool.initialize().await?;
        }
        Ok(())
    }

    pub async fn health_check_all(&self) -> BTreeMap<String, bool> {
        let mut report = BTreeMap::new();
        for pool in self.snapshot().await {
            let healthy = match pool.health_check().await {
                Ok(healthy) => healthy,
                Err(e) => {
                    warn!(pool = %pool.name(), error = %e, "Health check failed");
                    false
                }
            };
            report.insert(pool.name().to_string(), healthy);
        }
        report
    }

    pub async fn stats_all(&self) -> BTreeMap<String, PoolStats> {
        self.snapshot()
            .await
            .into_iter()
            .map(|pool| (pool.name().to_string(), pool.stats()))
            .collect()
    }

    /// Close and unregister every pool.
    pub async fn close_all(&self) {
        let pools: Vec<ConnectionPool> = {
            let mut pools = self.pools.write().await;
            pools.drain().map(|(_, pool)| pool).collect()
        };
        let count = pools.len();
        for pool in pools {
            pool.close().await;
        }
        if count > 0 {
            info!(count, "Closed all pools");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::document::{DocumentConnector, DocumentStore};
    use crate::models::BackendDescriptor;

    fn document_pool(name: &str) -> ConnectionPool {
        let store = DocumentStore::new(name);
        let config = ConnectionPoolConfig::new(name, BackendDescriptor::document(name));
        ConnectionPool::new(config, Arc::new(DocumentConnector::new(store))).unwrap()
    }

    #[tokio::test]
    async fn test_register_and_get() {
        let manager = PoolManager::new();
        manager.register(document_pool("a")).await.unwrap();
        assert_eq!(manager.get("a").await.unwrap().name(), "a");
        assert!(matches!(
            manager.get("missing").await,
            Err(HarnessError::PoolNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let manager = PoolManager::new();
        manager.register(document_pool("a")).await.unwrap();
        let err = manager.register(document_pool("a")).await.unwrap_err();
        assert!(matches!(err, HarnessError::Configuration { .. }));
    }

    #[tokio::test]
    async fn test_close_all_empties_registry() {
        let manager = PoolManager::new();
        let pool = document_pool("a");
        manager.register(pool.clone()).await.unwrap();
        manager.register(document_pool("b")).await.unwrap();
        assert_eq!(manager.names().await, vec!["a", "b"]);
        manager.close_all().await;
        assert!(manager.names().await.is_empty());
        assert!(pool.is_closed());
    }

    #[tokio::test]
    async fn test_create_uses_document_connector() {
        let manager = PoolManager::new();
        let config = ConnectionPoolConfig::new("docs", BackendDescriptor::document("docs"));
        let pool = manager.create(config).await.unwrap();
        assert!(pool.stats().idle >= 1);
        let stats = manager.stats_all().await;
        assert!(stats.contains_key("docs"));
        manager.close_all().await;
    }
}
