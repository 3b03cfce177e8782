//! Connection tracker (spec §4.4): three related concerns bundled into one
//! singleton so the orchestrator has a single place to consult before and
//! after admission. No teacher module maps to this directly; it follows
//! the cleanup-interval-task style the teacher uses in `rate_limiter.rs`
//! and `monitoring.rs` for its own periodic sweeps.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

/// Socket identity used for in-flight membership. A raw socket has no
/// stable identifier of its own before the upgrade completes, so the
/// orchestrator mints one (e.g. a monotonic counter or the peer address)
/// and uses it consistently across dedupe mark/unmark.
pub type SocketId = u64;

#[derive(Default)]
pub struct ConnectionTracker {
    in_flight: Arc<RwLock<std::collections::HashSet<SocketId>>>,
    recent_upgrades: Arc<RwLock<HashMap<(String, String), Instant>>>,
    cleaned_up: Arc<RwLock<HashMap<String, Instant>>>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `socket` in-flight. Returns `false` if it was already
    /// present — the caller must then drop the upgrade silently (spec
    /// §4.10 step 2: "If the socket is already in-flight ... ignore").
    pub async fn mark_in_flight(&self, socket: SocketId) -> bool {
        self.in_flight.write().await.insert(socket)
    }

    /// Unmarks `socket`. Called on the socket's close/error events
    /// regardless of how far the upgrade progressed.
    pub async fn unmark_in_flight(&self, socket: SocketId) {
        self.in_flight.write().await.remove(&socket);
    }

    pub async fn is_in_flight(&self, socket: SocketId) -> bool {
        self.in_flight.read().await.contains(&socket)
    }

    /// Checks and records a (url, remote_addr) upgrade attempt. Returns
    /// `true` if this is a rapid duplicate within `window` of the last
    /// attempt for the same key (spec §4.4.2).
    pub async fn is_rapid_duplicate(&self, url: &str, remote_addr: &str, window: Duration) -> bool {
        let key = (url.to_string(), remote_addr.to_string());
        let now = Instant::now();
        let mut recent = self.recent_upgrades.write().await;
        let duplicate = recent
            .get(&key)
            .map(|last| now.duration_since(*last) < window)
            .unwrap_or(false);
        recent.insert(key, now);
        duplicate
    }

    /// Prunes duplicate-squelch entries older than 10s. Intended to run
    /// every 5s (spec §4.4.2).
    pub async fn prune_recent_upgrades(&self) {
        let cutoff = Duration::from_secs(10);
        let now = Instant::now();
        self.recent_upgrades
            .write()
            .await
            .retain(|_, last| now.duration_since(*last) < cutoff);
    }

    /// Records that `connection_id`'s cleanup has run. Returns `false`
    /// if cleanup already ran for this id within the grace period — the
    /// caller must then skip running it again (spec §4.4.3, §5:
    /// "close runs exactly once").
    pub async fn mark_cleaned_up(&self, connection_id: &str) -> bool {
        let mut cleaned = self.cleaned_up.write().await;
        if cleaned.contains_key(connection_id) {
            return false;
        }
        cleaned.insert(connection_id.to_string(), Instant::now());
        true
    }

    /// Prunes cleanup-once entries older than the 30s grace period.
    pub async fn prune_cleaned_up(&self) {
        let grace = Duration::from_secs(30);
        let now = Instant::now();
        self.cleaned_up
            .write()
            .await
            .retain(|_, at| now.duration_since(*at) < grace);
    }

    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let tracker = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5));
            loop {
                interval.tick().await;
                tracker.prune_recent_upgrades().await;
                tracker.prune_cleaned_up().await;
            }
        })
    }

    pub async fn destroy(&self) {
        self.in_flight.write().await.clear();
        self.recent_upgrades.write().await.clear();
        self.cleaned_up.write().await.clear();
    }
}
