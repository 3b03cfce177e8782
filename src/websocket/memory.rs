//! Process memory monitoring and threshold-triggered cleanup (spec §4.6).
//!
//! The host framework's original runtime introspects the JS heap; there
//! is no such concept in a Rust process, so this enriches the teacher's
//! stack with `sysinfo` (used across the retrieval pack for exactly this
//! kind of process-level RSS/memory monitoring) and tracks percentage of
//! a configured memory ceiling rather than V8 heap statistics.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use sysinfo::{Pid, System};
use tokio::sync::RwLock;

use crate::websocket::pool::ConnectionPool;

#[derive(Debug, Clone)]
pub struct MemoryThresholds {
    pub warning_pct: f64,
    pub critical_pct: f64,
    pub maximum_pct: f64,
    /// Ceiling against which percentages are computed. Defaults to the
    /// total system memory `sysinfo` reports.
    pub ceiling_bytes: Option<u64>,
}

impl Default for MemoryThresholds {
    fn default() -> Self {
        Self {
            warning_pct: 90.0,
            critical_pct: 95.0,
            maximum_pct: 98.0,
            ceiling_bytes: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MemoryStats {
    pub rss_bytes: u64,
    pub ceiling_bytes: u64,
    pub percentage: f64,
    pub connection_count: usize,
    pub estimated_per_connection_bytes: u64,
}

type CleanupFn = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = u64> + Send>> + Send + Sync>;

struct CleanupStrategy {
    name: String,
    priority: u8,
    run: CleanupFn,
}

#[derive(Debug, Clone)]
pub struct CleanupReport {
    pub strategies_run: Vec<String>,
    pub bytes_freed: u64,
    pub percentage_before: f64,
    pub percentage_after: f64,
}

/// Process-singleton memory monitor (spec §3 "Ownership").
pub struct MemoryManager {
    thresholds: MemoryThresholds,
    pool: Arc<ConnectionPool>,
    strategies: RwLock<Vec<CleanupStrategy>>,
    last_cleanup: RwLock<Option<Instant>>,
    pid: Pid,
    monitoring: Arc<std::sync::atomic::AtomicBool>,
    estimated_per_connection_bytes: AtomicU64,
}

const CLEANUP_COOLDOWN: Duration = Duration::from_secs(30);

impl MemoryManager {
    pub fn new(thresholds: MemoryThresholds, pool: Arc<ConnectionPool>) -> Self {
        Self {
            thresholds,
            pool,
            strategies: RwLock::new(Vec::new()),
            last_cleanup: RwLock::new(None),
            pid: sysinfo::get_current_pid().unwrap_or(Pid::from(0)),
            monitoring: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            estimated_per_connection_bytes: AtomicU64::new(8 * 1024),
        }
    }

    /// Registers the default strategies the spec names, in priority
    /// order: host GC request (10, a no-op hook in Rust — there is no
    /// managed heap to collect), idle-connection reaping via the pool
    /// (9), invalidating non-essential caches via `invalidate_caches`
    /// (6), resetting pool metrics (3).
    pub async fn register_default_strategies(
        &self,
        invalidate_caches: impl Fn() -> Pin<Box<dyn Future<Output = u64> + Send>> + Send + Sync + 'static,
    ) {
        self.register_cleanup_strategy("request_gc", 10, || Box::pin(async { 0 }))
            .await;

        let pool = self.pool.clone();
        self.register_cleanup_strategy("close_idle_connections", 9, move || {
            let pool = pool.clone();
            Box::pin(async move {
                let closed = pool.cleanup_idle_connections(Duration::from_secs(5 * 60)).await;
                closed as u64 * 8 * 1024
            })
        })
        .await;

        self.register_cleanup_strategy("invalidate_non_essential_caches", 6, invalidate_caches)
            .await;

        let pool = self.pool.clone();
        self.register_cleanup_strategy("reset_pool_metrics", 3, move || {
            let pool = pool.clone();
            Box::pin(async move {
                pool.reset_metrics();
                0
            })
        })
        .await;
    }

    pub async fn register_cleanup_strategy(
        &self,
        name: &str,
        priority: u8,
        run: impl Fn() -> Pin<Box<dyn Future<Output = u64> + Send>> + Send + Sync + 'static,
    ) {
        self.strategies.write().await.push(CleanupStrategy {
            name: name.to_string(),
            priority,
            run: Arc::new(run),
        });
        self.strategies.write().await.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    pub async fn stats(&self) -> MemoryStats {
        let mut system = System::new();
        system.refresh_process(self.pid);
        let rss_bytes = system.process(self.pid).map(|p| p.memory()).unwrap_or(0);

        let ceiling_bytes = self.thresholds.ceiling_bytes.unwrap_or_else(|| {
            let mut sys = System::new();
            sys.refresh_memory();
            sys.total_memory()
        });

        let percentage = if ceiling_bytes == 0 {
            0.0
        } else {
            (rss_bytes as f64 / ceiling_bytes as f64) * 100.0
        };

        MemoryStats {
            rss_bytes,
            ceiling_bytes,
            percentage,
            connection_count: self.pool.stats().await.total,
            estimated_per_connection_bytes: self.estimated_per_connection_bytes.load(Ordering::Relaxed),
        }
    }

    pub async fn acceptable(&self) -> bool {
        self.stats().await.percentage < self.thresholds.maximum_pct
    }

    /// Runs cleanup strategies in descending priority order, rechecking
    /// `stats()` between each and stopping once below the warning
    /// threshold (spec §4.6). Subject to a 30s cooldown unless `force`.
    pub async fn execute_cleanup(&self, force: bool) -> Option<CleanupReport> {
        if !force {
            if let Some(last) = *self.last_cleanup.read().await {
                if last.elapsed() < CLEANUP_COOLDOWN {
                    return None;
                }
            }
        }

        let before = self.stats().await;
        let min_priority = if force {
            3
        } else if before.percentage >= self.thresholds.critical_pct {
            0
        } else if before.percentage >= self.thresholds.warning_pct {
            5
        } else {
            return None;
        };

        let mut strategies_run = Vec::new();
        let mut bytes_freed = 0u64;

        let strategies: Vec<_> = self
            .strategies
            .read()
            .await
            .iter()
            .filter(|s| s.priority as i32 >= min_priority)
            .map(|s| (s.name.clone(), s.run.clone()))
            .collect();

        for (name, run) in strategies {
            bytes_freed += run().await;
            strategies_run.push(name);

            if self.stats().await.percentage < self.thresholds.warning_pct {
                break;
            }
        }

        *self.last_cleanup.write().await = Some(Instant::now());
        let after = self.stats().await;

        Some(CleanupReport {
            strategies_run,
            bytes_freed,
            percentage_before: before.percentage,
            percentage_after: after.percentage,
        })
    }

    pub async fn check_and_cleanup(&self) -> Option<CleanupReport> {
        let stats = self.stats().await;
        if stats.percentage >= self.thresholds.warning_pct {
            self.execute_cleanup(false).await
        } else {
            None
        }
    }

    pub fn spawn_monitor(self: &Arc<Self>, interval_ms: u64) -> tokio::task::JoinHandle<()> {
        self.monitoring.store(true, Ordering::SeqCst);
        let manager = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
            while manager.monitoring.load(Ordering::SeqCst) {
                interval.tick().await;
                if let Some(report) = manager.check_and_cleanup().await {
                    tracing::info!(
                        freed = report.bytes_freed,
                        before = report.percentage_before,
                        after = report.percentage_after,
                        "memory cleanup executed"
                    );
                }
            }
        })
    }

    pub fn stop_monitoring(&self) {
        self.monitoring.store(false, Ordering::SeqCst);
    }

    pub async fn generate_report(&self) -> MemoryStats {
        self.stats().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registers_and_runs_default_strategies_in_priority_order() {
        let pool = Arc::new(ConnectionPool::new(10));
        let manager = MemoryManager::new(
            MemoryThresholds {
                ceiling_bytes: Some(1),
                ..MemoryThresholds::default()
            },
            pool,
        );
        manager
            .register_default_strategies(|| Box::pin(async { 0 }))
            .await;

        let report = manager.execute_cleanup(true).await.unwrap();
        assert_eq!(
            report.strategies_run,
            vec![
                "request_gc",
                "close_idle_connections",
                "invalidate_non_essential_caches",
                "reset_pool_metrics",
            ]
        );
    }

    #[tokio::test]
    async fn cleanup_respects_cooldown_unless_forced() {
        let pool = Arc::new(ConnectionPool::new(10));
        let manager = MemoryManager::new(
            MemoryThresholds {
                ceiling_bytes: Some(1),
                ..MemoryThresholds::default()
            },
            pool,
        );
        manager.register_cleanup_strategy("noop", 10, || Box::pin(async { 0 })).await;

        assert!(manager.execute_cleanup(true).await.is_some());
        assert!(manager.execute_cleanup(false).await.is_none());
    }

    #[tokio::test]
    async fn acceptable_false_once_at_or_above_maximum() {
        let pool = Arc::new(ConnectionPool::new(10));
        let manager = MemoryManager::new(
            MemoryThresholds {
                maximum_pct: 0.0,
                ceiling_bytes: Some(1),
                ..MemoryThresholds::default()
            },
            pool,
        );
        assert!(!manager.acceptable().await);
    }
}
