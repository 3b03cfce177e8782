//! Per-(route, client identity) sliding-window rate limiting (spec §4.3).
//!
//! Re-keyed from the teacher's (user id, command type) scheme — this
//! runtime admits connections before any application-level identity
//! exists, so the limiter keys on the route pattern and a client identity
//! derived from request headers/remote address instead.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub window: Duration,
    pub max_requests: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_requests: 100,
        }
    }
}

/// Outcome of a rate-limit check (spec §4.3: "Returned info: limit,
/// current, remaining, resetTime").
#[derive(Debug, Clone)]
pub struct RateLimitDecision {
    pub admitted: bool,
    pub limit: u32,
    pub current: usize,
    pub remaining: u32,
    pub reset_time: Instant,
}

#[derive(Default)]
struct Bucket {
    timestamps: Vec<Instant>,
}

impl Bucket {
    fn prune(&mut self, window: Duration) {
        let cutoff = Instant::now().checked_sub(window);
        if let Some(cutoff) = cutoff {
            self.timestamps.retain(|t| *t >= cutoff);
        }
    }
}

/// Derives the client identity the way the spec orders it: leftmost
/// `X-Forwarded-For` token, then `X-Real-IP`, then the remote address,
/// then the literal `"unknown"`.
pub fn client_identity(
    forwarded_for: Option<&str>,
    real_ip: Option<&str>,
    remote_addr: Option<&str>,
) -> String {
    if let Some(xff) = forwarded_for {
        let first = xff.split(',').next().unwrap_or("").trim();
        if !first.is_empty() {
            return first.to_string();
        }
    }
    if let Some(ip) = real_ip {
        if !ip.trim().is_empty() {
            return ip.trim().to_string();
        }
    }
    if let Some(addr) = remote_addr {
        if !addr.trim().is_empty() {
            return addr.trim().to_string();
        }
    }
    "unknown".to_string()
}

/// Process-singleton rate limiter. Buckets are created lazily on first
/// check for a (route, identity) pair and swept every 60s.
#[derive(Clone)]
pub struct RateLimiter {
    buckets: Arc<RwLock<HashMap<(String, String), Bucket>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            buckets: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Checks and, if admitted, records the request. Routes without a
    /// rate-limit rule bypass the limiter entirely — the orchestrator
    /// simply never calls this for them (spec §4.3: "routes without a
    /// rule bypass the limiter entirely").
    pub async fn check(
        &self,
        route: &str,
        identity: &str,
        config: &RateLimitConfig,
    ) -> RateLimitDecision {
        let key = (route.to_string(), identity.to_string());
        let mut buckets = self.buckets.write().await;
        let bucket = buckets.entry(key).or_default();
        bucket.prune(config.window);

        let current = bucket.timestamps.len();
        let admitted = current < config.max_requests as usize;
        if admitted {
            bucket.timestamps.push(Instant::now());
        }

        let reset_time = bucket
            .timestamps
            .first()
            .map(|t| *t + config.window)
            .unwrap_or_else(|| Instant::now() + config.window);

        let current = bucket.timestamps.len();
        RateLimitDecision {
            admitted,
            limit: config.max_requests,
            current,
            remaining: config.max_requests.saturating_sub(current as u32),
            reset_time,
        }
    }

    /// Sweeps expired timestamps and deletes buckets left empty (spec
    /// §4.3: "Swept every 60 s; empty buckets deleted").
    pub async fn sweep(&self, window: Duration) {
        let mut buckets = self.buckets.write().await;
        buckets.retain(|_, bucket| {
            bucket.prune(window);
            !bucket.timestamps.is_empty()
        });
    }

    pub fn spawn_sweeper(&self, window: Duration) -> tokio::task::JoinHandle<()> {
        let limiter = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                limiter.sweep(window).await;
            }
        })
    }

    pub async fn destroy(&self) {
        self.buckets.write().await.clear();
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn admits_up_to_max_requests_then_rejects() {
        let limiter = RateLimiter::new();
        let config = RateLimitConfig {
            window: Duration::from_secs(60),
            max_requests: 3,
        };

        for _ in 0..3 {
            let decision = limiter.check("/ws/chat", "1.2.3.4", &config).await;
            assert!(decision.admitted);
        }
        let decision = limiter.check("/ws/chat", "1.2.3.4", &config).await;
        assert!(!decision.admitted);
        assert_eq!(decision.remaining, 0);
    }

    #[tokio::test]
    async fn routes_and_identities_are_independent() {
        let limiter = RateLimiter::new();
        let config = RateLimitConfig {
            window: Duration::from_secs(60),
            max_requests: 1,
        };

        assert!(limiter.check("/ws/chat", "1.2.3.4", &config).await.admitted);
        assert!(!limiter.check("/ws/chat", "1.2.3.4", &config).await.admitted);
        assert!(limiter.check("/ws/echo", "1.2.3.4", &config).await.admitted);
        assert!(limiter.check("/ws/chat", "5.6.7.8", &config).await.admitted);
    }

    #[tokio::test]
    async fn sweep_removes_empty_buckets() {
        let limiter = RateLimiter::new();
        let config = RateLimitConfig {
            window: Duration::from_millis(10),
            max_requests: 1,
        };
        limiter.check("/ws/chat", "1.2.3.4", &config).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        limiter.sweep(config.window).await;
        assert_eq!(limiter.buckets.read().await.len(), 0);
    }

    #[test]
    fn identity_prefers_forwarded_for_over_real_ip_and_remote_addr() {
        assert_eq!(
            client_identity(Some(" 9.9.9.9 , 1.1.1.1"), Some("2.2.2.2"), Some("3.3.3.3")),
            "9.9.9.9"
        );
        assert_eq!(client_identity(None, Some("2.2.2.2"), Some("3.3.3.3")), "2.2.2.2");
        assert_eq!(client_identity(None, None, Some("3.3.3.3")), "3.3.3.3");
        assert_eq!(client_identity(None, None, None), "unknown");
    }
}
