//! Health monitor and HTTP health/metrics surface (spec §4.7).
//!
//! Transformed from the teacher's `WebSocketMonitor`: the counters are
//! kept, but the quality-score/command-latency machinery (product
//! concerns tied to the teacher's own command protocol) is replaced with
//! the spec's upgrade/connection/error counters and status roll-up rules.
//! Counters use a synchronous `std::sync::RwLock`, matching the teacher's
//! own choice for `PerformanceMetrics`, since updates happen on hot
//! request paths and never need to suspend.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json};
use serde::Serialize;
use serde_json::json;

use crate::websocket::circuit_breaker::CircuitBreakerRegistry;
use crate::websocket::circuit_breaker::CircuitState;
use crate::websocket::pool::ConnectionPool;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Default)]
struct Counters {
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    messages_in: AtomicU64,
    messages_out: AtomicU64,
    errors: AtomicU64,
    upgrades_attempted: AtomicU64,
    upgrades_failed: AtomicU64,
    peak_connections: AtomicU64,
}

const DURATION_SAMPLE_CAP: usize = 1000;
const DURATION_SAMPLE_TRIM_TO: usize = 500;

/// Process-singleton health monitor (spec §3 "Health metrics").
pub struct HealthMonitor {
    counters: Counters,
    durations: RwLock<Vec<Duration>>,
    start_time: Instant,
    pool: Arc<ConnectionPool>,
    breakers: Arc<CircuitBreakerRegistry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthState,
    pub uptime_seconds: u64,
    pub active_connections: usize,
    pub peak_connections: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsReport {
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub messages_in: u64,
    pub messages_out: u64,
    pub errors: u64,
    pub upgrades_attempted: u64,
    pub upgrades_failed: u64,
    pub active_connections: usize,
    pub peak_connections: u64,
    pub average_connection_duration_ms: f64,
}

impl HealthMonitor {
    pub fn new(pool: Arc<ConnectionPool>, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self {
            counters: Counters::default(),
            durations: RwLock::new(Vec::new()),
            start_time: Instant::now(),
            pool,
            breakers,
        }
    }

    pub fn record_connection_opened(&self) {
        self.counters.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_closed(&self, duration: Duration) {
        self.counters.connections_closed.fetch_add(1, Ordering::Relaxed);
        let mut durations = self.durations.write().unwrap();
        durations.push(duration);
        if durations.len() > DURATION_SAMPLE_CAP {
            let excess = durations.len() - DURATION_SAMPLE_TRIM_TO;
            durations.drain(0..excess);
        }
    }

    pub fn record_message_in(&self) {
        self.counters.messages_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message_out(&self) {
        self.counters.messages_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upgrade_attempted(&self) {
        self.counters.upgrades_attempted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upgrade_failed(&self) {
        self.counters.upgrades_failed.fetch_add(1, Ordering::Relaxed);
    }

    fn average_duration_ms(&self) -> f64 {
        let durations = self.durations.read().unwrap();
        if durations.is_empty() {
            return 0.0;
        }
        let total: f64 = durations.iter().map(|d| d.as_millis() as f64).sum();
        total / durations.len() as f64
    }

    fn upgrade_failure_ratio(&self) -> f64 {
        let attempted = self.counters.upgrades_attempted.load(Ordering::Relaxed);
        if attempted == 0 {
            return 0.0;
        }
        self.counters.upgrades_failed.load(Ordering::Relaxed) as f64 / attempted as f64
    }

    /// Status roll-up per spec §4.7.
    pub async fn status(&self, heap_pct: f64, capacity: u32) -> HealthState {
        let stats = self.pool.stats().await;
        let failure_ratio = self.upgrade_failure_ratio();

        if failure_ratio > 0.5 || heap_pct > 90.0 {
            return HealthState::Unhealthy;
        }

        let any_breaker_open = {
            // A best-effort scan; breaker count is small and this only
            // runs on health-check cadence, not per request.
            let mut open = false;
            for route_breaker in self.breakers_snapshot().await {
                if route_breaker == CircuitState::Open {
                    open = true;
                    break;
                }
            }
            open
        };

        let near_capacity = capacity > 0 && stats.active as f64 >= 0.9 * capacity as f64;

        if failure_ratio > 0.2 || heap_pct > 80.0 || any_breaker_open || near_capacity {
            return HealthState::Degraded;
        }

        HealthState::Healthy
    }

    async fn breakers_snapshot(&self) -> Vec<CircuitState> {
        self.breakers.snapshot_states().await
    }

    pub async fn health_report(&self, heap_pct: f64, capacity: u32) -> HealthReport {
        let stats = self.pool.stats().await;
        HealthReport {
            status: self.status(heap_pct, capacity).await,
            uptime_seconds: self.start_time.elapsed().as_secs(),
            active_connections: stats.active,
            peak_connections: self.counters.peak_connections.load(Ordering::Relaxed).max(stats.peak),
        }
    }

    pub async fn metrics_report(&self) -> MetricsReport {
        let stats = self.pool.stats().await;
        MetricsReport {
            connections_opened: self.counters.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.counters.connections_closed.load(Ordering::Relaxed),
            messages_in: self.counters.messages_in.load(Ordering::Relaxed),
            messages_out: self.counters.messages_out.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            upgrades_attempted: self.counters.upgrades_attempted.load(Ordering::Relaxed),
            upgrades_failed: self.counters.upgrades_failed.load(Ordering::Relaxed),
            active_connections: stats.active,
            peak_connections: stats.peak,
            average_connection_duration_ms: self.average_duration_ms(),
        }
    }
}

fn no_cache_headers() -> [(header::HeaderName, HeaderValue); 1] {
    [(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"))]
}

/// `<path>` handler: 200 for healthy/degraded, 503 for unhealthy (spec
/// §4.7).
pub async fn health_handler(
    monitor: Arc<HealthMonitor>,
    heap_pct: f64,
    capacity: u32,
) -> impl IntoResponse {
    let report = monitor.health_report(heap_pct, capacity).await;
    let status = match report.status {
        HealthState::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (status, no_cache_headers(), Json(json!(report)))
}

/// `<path>/metrics` handler.
pub async fn metrics_handler(monitor: Arc<HealthMonitor>) -> impl IntoResponse {
    let report = monitor.metrics_report().await;
    (StatusCode::OK, no_cache_headers(), Json(json!(report)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::circuit_breaker::CircuitBreakerConfig;

    fn monitor() -> HealthMonitor {
        let pool = Arc::new(ConnectionPool::new(100));
        let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default()));
        HealthMonitor::new(pool, breakers)
    }

    #[tokio::test]
    async fn healthy_by_default() {
        let monitor = monitor();
        assert_eq!(monitor.status(10.0, 100).await, HealthState::Healthy);
    }

    #[tokio::test]
    async fn unhealthy_when_upgrade_failure_ratio_high() {
        let monitor = monitor();
        for _ in 0..10 {
            monitor.record_upgrade_attempted();
        }
        for _ in 0..6 {
            monitor.record_upgrade_failed();
        }
        assert_eq!(monitor.status(10.0, 100).await, HealthState::Unhealthy);
    }

    #[tokio::test]
    async fn degraded_when_heap_above_80() {
        let monitor = monitor();
        assert_eq!(monitor.status(85.0, 100).await, HealthState::Degraded);
    }

    #[test]
    fn duration_samples_trim_on_overflow() {
        let monitor = monitor();
        for _ in 0..(DURATION_SAMPLE_CAP + 10) {
            monitor.record_connection_closed(Duration::from_millis(1));
        }
        assert_eq!(monitor.durations.read().unwrap().len(), DURATION_SAMPLE_TRIM_TO);
    }
}
