//! Background sampling of pool activity and resident memory.

use super::{LoadSample, MonitorEvent, POOL_USAGE_LIMIT, PerformanceMonitor, PoolLoad};
use chrono::Utc;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

impl PerformanceMonitor {
    /// Start the sampling loop. A second call while it runs is a no-op.
    ///
    /// The loop holds only a weak reference and ends with the last monitor
    /// handle.
    pub fn start_sampling(&self) {
        let mut slot = self.inner.sampler.lock();
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.sample_interval;
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                PerformanceMonitor { inner }.sample_now().await;
            }
        }));
        debug!(interval_ms = period.as_millis() as u64, "Performance sampling started");
    }

    pub fn stop_sampling(&self) {
        if let Some(handle) = self.inner.sampler.lock().take() {
            handle.abort();
        }
    }

    /// Take one sample now, append it to the load history and raise
    /// `HighMemory` / `ConnectionPressure` as needed.
    ///
    /// Closed or dropped pools are skipped and forgotten.
    pub async fn sample_now(&self) -> LoadSample {
        let resident_bytes = resident_memory().await;

        let pools: Vec<_> = {
            let mut state = self.inner.state.lock();
            let live: Vec<_> = state
                .pools
                .iter()
                .filter_map(|weak| weak.upgrade())
                .filter(|pool| !pool.is_closed())
                .collect();
            state.pools = live.iter().map(|pool| pool.downgrade()).collect();
            live
        };

        let loads: Vec<PoolLoad> = pools
            .iter()
            .map(|pool| {
                let stats = pool.stats();
                PoolLoad {
                    pool: pool.name().to_string(),
                    active: stats.active,
                    idle: stats.idle,
                    pending: stats.pending,
                }
            })
            .collect();

        let sample = LoadSample {
            at: Utc::now(),
            resident_bytes,
            pools: loads,
        };

        {
            let mut state = self.inner.state.lock();
            state.load_history.push_back(sample.clone());
            self.prune(&mut state, sample.at);
        }

        let thresholds = &self.inner.thresholds;
        if let Some(bytes) = resident_bytes.filter(|b| *b > thresholds.high_memory_bytes) {
            warn!(
                resident = %humansize::format_size(bytes, humansize::BINARY),
                "Resident memory above threshold"
            );
            let _ = self.inner.events.send(MonitorEvent::HighMemory {
                resident_bytes: bytes,
                threshold_bytes: thresholds.high_memory_bytes,
            });
        }

        let limit = thresholds.max_concurrent_connections;
        for load in &sample.pools {
            if load.active as f64 > limit as f64 * POOL_USAGE_LIMIT {
                warn!(pool = %load.pool, active = load.active, limit, "Connection pressure");
                let _ = self.inner.events.send(MonitorEvent::ConnectionPressure {
                    pool: load.pool.clone(),
                    active: load.active,
                    limit,
                });
            }
        }
        sample
    }
}

async fn resident_memory() -> Option<u64> {
    let status = tokio::fs::read_to_string("/proc/self/status").await.ok()?;
    parse_vm_rss(&status)
}

/// Resident set size in bytes from a `/proc/<pid>/status` dump.
fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib * 1024)
}
