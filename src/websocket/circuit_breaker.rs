//! Per-route circuit breakers (spec §4.2). Protects a route's connection
//! factory and handler from cascading failures by failing admission fast
//! once a route's failure rate crosses a threshold.
//!
//! Adapted from a consecutive-failure breaker into a sliding-window one:
//! the spec counts failures within a trailing `monitoring_window`, not
//! merely in a row, so `failure_count` here is the length of a pruned
//! timestamp window rather than a single atomic counter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    pub monitoring_window: Duration,
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            monitoring_window: Duration::from_secs(5 * 60),
            success_threshold: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub failure_count: usize,
    pub consecutive_successes: u64,
    pub total_requests: u64,
    pub last_failure_time: Option<Instant>,
    pub last_success_time: Option<Instant>,
}

/// One breaker per route. Lazily created, pruned by a background sweep
/// after an hour of inactivity (spec §3 "Circuit breaker state").
#[derive(Debug)]
pub struct CircuitBreaker {
    route: String,
    config: CircuitBreakerConfig,
    state: AtomicU8,
    failure_window: RwLock<Vec<Instant>>,
    consecutive_successes: AtomicU64,
    total_requests: AtomicU64,
    probing: AtomicBool,
    last_failure_time: RwLock<Option<Instant>>,
    last_success_time: RwLock<Option<Instant>>,
    last_activity: RwLock<Instant>,
}

impl CircuitBreaker {
    pub fn new(route: String, config: CircuitBreakerConfig) -> Arc<Self> {
        Arc::new(Self {
            route,
            config,
            state: AtomicU8::new(CircuitState::Closed as u8),
            failure_window: RwLock::new(Vec::new()),
            consecutive_successes: AtomicU64::new(0),
            total_requests: AtomicU64::new(0),
            probing: AtomicBool::new(false),
            last_failure_time: RwLock::new(None),
            last_success_time: RwLock::new(None),
            last_activity: RwLock::new(Instant::now()),
        })
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Relaxed))
    }

    /// `canExecute` (spec §4.2). Prunes the failure window and, once in
    /// `Open` state, flips to `HalfOpen` and admits a single probe once
    /// `reset_timeout` has elapsed since the last recorded failure.
    pub async fn can_execute(&self) -> bool {
        *self.last_activity.write().await = Instant::now();
        self.prune_window().await;

        match self.state() {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let last_failure = *self.last_failure_time.read().await;
                let elapsed = last_failure.map(|t| t.elapsed()).unwrap_or(Duration::ZERO);
                if last_failure.is_some() && elapsed >= self.config.reset_timeout {
                    self.transition_to_half_open();
                    self.try_start_probe()
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => self.try_start_probe(),
        }
    }

    fn try_start_probe(&self) -> bool {
        self.probing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub async fn record_success(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        *self.last_success_time.write().await = Some(Instant::now());

        match self.state() {
            CircuitState::Closed => {
                let mut window = self.failure_window.write().await;
                if !window.is_empty() {
                    window.remove(0);
                }
            }
            CircuitState::HalfOpen => {
                let successes = self.consecutive_successes.fetch_add(1, Ordering::Relaxed) + 1;
                self.probing.store(false, Ordering::SeqCst);
                if successes >= self.config.success_threshold as u64 {
                    self.transition_to_closed().await;
                }
            }
            CircuitState::Open => {
                tracing::debug!(route = %self.route, "unexpected success while circuit open");
            }
        }
    }

    pub async fn record_failure(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        *self.last_failure_time.write().await = Some(now);

        match self.state() {
            CircuitState::Closed => {
                self.failure_window.write().await.push(now);
                let count = self.prune_window().await;
                if count >= self.config.failure_threshold as usize {
                    self.transition_to_open().await;
                }
            }
            CircuitState::HalfOpen => {
                self.probing.store(false, Ordering::SeqCst);
                self.transition_to_open().await;
            }
            CircuitState::Open => {}
        }
    }

    async fn prune_window(&self) -> usize {
        let cutoff = Instant::now().checked_sub(self.config.monitoring_window);
        let mut window = self.failure_window.write().await;
        if let Some(cutoff) = cutoff {
            window.retain(|t| *t >= cutoff);
        }
        window.len()
    }

    async fn transition_to_open(&self) {
        self.state.store(CircuitState::Open as u8, Ordering::Relaxed);
        self.consecutive_successes.store(0, Ordering::Relaxed);
        self.probing.store(false, Ordering::SeqCst);
        tracing::warn!(route = %self.route, "circuit breaker opened");
    }

    fn transition_to_half_open(&self) {
        self.state.store(CircuitState::HalfOpen as u8, Ordering::Relaxed);
        self.consecutive_successes.store(0, Ordering::Relaxed);
        tracing::info!(route = %self.route, "circuit breaker half-open");
    }

    async fn transition_to_closed(&self) {
        self.state.store(CircuitState::Closed as u8, Ordering::Relaxed);
        self.consecutive_successes.store(0, Ordering::Relaxed);
        self.failure_window.write().await.clear();
        tracing::info!(route = %self.route, "circuit breaker closed");
    }

    pub async fn reset(&self) {
        self.state.store(CircuitState::Closed as u8, Ordering::Relaxed);
        self.consecutive_successes.store(0, Ordering::Relaxed);
        self.probing.store(false, Ordering::SeqCst);
        self.failure_window.write().await.clear();
        *self.last_failure_time.write().await = None;
    }

    pub async fn stats(&self) -> CircuitBreakerStats {
        let failure_count = self.prune_window().await;
        CircuitBreakerStats {
            state: self.state(),
            failure_count,
            consecutive_successes: self.consecutive_successes.load(Ordering::Relaxed),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            last_failure_time: *self.last_failure_time.read().await,
            last_success_time: *self.last_success_time.read().await,
        }
    }

    async fn idle_for(&self, threshold: Duration) -> bool {
        self.last_activity.read().await.elapsed() >= threshold
    }
}

/// Process-singleton registry of per-route breakers (spec §3
/// "Ownership": "process-singletons with explicit teardown").
#[derive(Clone)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: Arc<RwLock<HashMap<String, Arc<CircuitBreaker>>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn get_or_create(&self, route: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.read().await.get(route) {
            return existing.clone();
        }
        let mut breakers = self.breakers.write().await;
        breakers
            .entry(route.to_string())
            .or_insert_with(|| CircuitBreaker::new(route.to_string(), self.config.clone()))
            .clone()
    }

    /// A snapshot of every breaker's current state, used by the health
    /// monitor's status roll-up (spec §4.7: "any breaker OPEN").
    pub async fn snapshot_states(&self) -> Vec<CircuitState> {
        self.breakers.read().await.values().map(|b| b.state()).collect()
    }

    /// Evicts breakers idle for more than an hour. Intended to run on a
    /// 30-minute tick (spec §4.2: "A background sweep every 30 min
    /// evicts breakers with no activity for an hour").
    pub async fn sweep(&self) {
        let mut breakers = self.breakers.write().await;
        let mut stale = Vec::new();
        for (route, breaker) in breakers.iter() {
            if breaker.idle_for(Duration::from_secs(60 * 60)).await {
                stale.push(route.clone());
            }
        }
        for route in stale {
            breakers.remove(&route);
            tracing::debug!(route, "evicted idle circuit breaker");
        }
    }

    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30 * 60));
            loop {
                interval.tick().await;
                registry.sweep().await;
            }
        })
    }

    pub async fn destroy(&self) {
        self.breakers.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_after_failure_threshold() {
        let breaker = CircuitBreaker::new(
            "/ws/chat".into(),
            CircuitBreakerConfig {
                failure_threshold: 3,
                ..CircuitBreakerConfig::default()
            },
        );
        for _ in 0..3 {
            breaker.record_failure().await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_execute().await);
    }

    #[tokio::test]
    async fn half_open_admits_probe_after_reset_timeout() {
        let breaker = CircuitBreaker::new(
            "/ws/chat".into(),
            CircuitBreakerConfig {
                failure_threshold: 1,
                reset_timeout: Duration::from_millis(10),
                ..CircuitBreakerConfig::default()
            },
        );
        breaker.record_failure().await;
        assert_eq!(breaker.state(), CircuitState::Open);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(breaker.can_execute().await);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn half_open_closes_after_success_threshold() {
        let breaker = CircuitBreaker::new(
            "/ws/chat".into(),
            CircuitBreakerConfig {
                failure_threshold: 1,
                reset_timeout: Duration::from_millis(1),
                success_threshold: 2,
                ..CircuitBreakerConfig::default()
            },
        );
        breaker.record_failure().await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(breaker.can_execute().await);
        breaker.record_success().await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_success().await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(
            "/ws/chat".into(),
            CircuitBreakerConfig {
                failure_threshold: 1,
                reset_timeout: Duration::from_millis(1),
                ..CircuitBreakerConfig::default()
            },
        );
        breaker.record_failure().await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(breaker.can_execute().await);
        breaker.record_failure().await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn success_decays_failure_window_by_one() {
        let breaker = CircuitBreaker::new(
            "/ws/chat".into(),
            CircuitBreakerConfig {
                failure_threshold: 5,
                ..CircuitBreakerConfig::default()
            },
        );
        breaker.record_failure().await;
        breaker.record_failure().await;
        breaker.record_success().await;
        let stats = breaker.stats().await;
        assert_eq!(stats.failure_count, 1);
    }

    #[tokio::test]
    async fn registry_creates_breakers_lazily_and_reuses_them() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::default());
        let a = registry.get_or_create("/ws/chat").await;
        let b = registry.get_or_create("/ws/chat").await;
        assert!(Arc::ptr_eq(&a, &b));
    }
}
