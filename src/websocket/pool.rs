//! Bounded connection registry (spec §4.5). Transformed from the
//! teacher's `WebSocketManager`: the broadcast-channel fan-out is kept,
//! but connection admission now gates on a capacity limit, and each
//! record carries the activity/byte-counters the spec's metadata
//! structure requires instead of chat-specific user fields.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message};
use tokio::sync::{mpsc, RwLock};

/// A record's egress handle. The orchestrator spawns a task owning the
/// socket's write half and forwards pool-originated sends (broadcasts,
/// idle-timeout closes, shutdown closes) through this channel so the
/// pool itself never touches the raw socket.
pub type Outbox = mpsc::UnboundedSender<Message>;

pub struct ConnectionRecord {
    pub id: String,
    pub route: String,
    pub opened_at: Instant,
    last_activity: RwLock<Instant>,
    message_count: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    outbox: Outbox,
}

impl ConnectionRecord {
    pub async fn last_activity(&self) -> Instant {
        *self.last_activity.read().await
    }

    pub fn message_count(&self) -> u64 {
        self.message_count.load(Ordering::Relaxed)
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    /// Called by the orchestrator's receive loop for every inbound
    /// message (spec §4.5: "each inbound message bumps last-activity,
    /// message count and inbound byte count").
    pub async fn record_inbound(&self, bytes: usize) {
        *self.last_activity.write().await = Instant::now();
        self.message_count.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn send(&self, message: Message) -> bool {
        let bytes = match &message {
            Message::Text(t) => t.len(),
            Message::Binary(b) => b.len(),
            _ => 0,
        };
        if self.outbox.send(message).is_ok() {
            self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolStats {
    pub total: usize,
    pub active: usize,
    pub idle: usize,
    pub peak: u64,
    pub approx_memory_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolFull;

/// Process-singleton connection registry. The pool owns connection
/// records and is the authoritative reference to which sockets are open
/// (spec §3 "Ownership").
pub struct ConnectionPool {
    max_connections: u32,
    connections: Arc<RwLock<HashMap<String, Arc<ConnectionRecord>>>>,
    peak: AtomicU64,
}

/// Per-connection outbound byte estimate used for `stats().approx_memory_bytes`.
const ESTIMATED_BYTES_PER_CONNECTION: u64 = 8 * 1024;
const IDLE_THRESHOLD: Duration = Duration::from_secs(60);

impl ConnectionPool {
    pub fn new(max_connections: u32) -> Self {
        Self {
            max_connections,
            connections: Arc::new(RwLock::new(HashMap::new())),
            peak: AtomicU64::new(0),
        }
    }

    /// Refuses admission if the pool is already at capacity (spec §4.5,
    /// §8 invariant: "pool.size ≤ maxConnections before and after
    /// admission").
    pub async fn add(
        &self,
        id: String,
        route: String,
        outbox: Outbox,
    ) -> Result<Arc<ConnectionRecord>, PoolFull> {
        let mut connections = self.connections.write().await;
        if connections.len() as u32 >= self.max_connections {
            return Err(PoolFull);
        }

        let record = Arc::new(ConnectionRecord {
            id: id.clone(),
            route,
            opened_at: Instant::now(),
            last_activity: RwLock::new(Instant::now()),
            message_count: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            outbox,
        });
        connections.insert(id, record.clone());
        self.peak.fetch_max(connections.len() as u64, Ordering::Relaxed);
        Ok(record)
    }

    /// No-ops on a missing id — cleanup-once is enforced by the tracker,
    /// so close/error observers can call this unconditionally (spec
    /// §4.5).
    pub async fn remove(&self, id: &str) -> Option<Arc<ConnectionRecord>> {
        self.connections.write().await.remove(id)
    }

    pub async fn get(&self, id: &str) -> Option<Arc<ConnectionRecord>> {
        self.connections.read().await.get(id).cloned()
    }

    pub async fn stats(&self) -> PoolStats {
        let connections = self.connections.read().await;
        let now = Instant::now();
        let mut idle = 0;
        for record in connections.values() {
            if now.duration_since(record.last_activity().await) >= IDLE_THRESHOLD {
                idle += 1;
            }
        }
        let total = connections.len();
        PoolStats {
            total,
            active: total - idle,
            idle,
            peak: self.peak.load(Ordering::Relaxed),
            approx_memory_bytes: total as u64 * ESTIMATED_BYTES_PER_CONNECTION,
        }
    }

    pub async fn connections_by_path(&self, path_substring: &str) -> Vec<Arc<ConnectionRecord>> {
        self.connections
            .read()
            .await
            .values()
            .filter(|r| r.route.contains(path_substring))
            .cloned()
            .collect()
    }

    /// Snapshot-and-iterate broadcast: takes a snapshot of matching
    /// connections, then sends to each, counting successes and
    /// swallowing per-send errors (spec §4.5).
    pub async fn broadcast(&self, path_substring: &str, payload: Message) -> usize {
        let targets = self.connections_by_path(path_substring).await;
        targets.iter().filter(|record| record.send(payload.clone())).count()
    }

    /// Sends an orderly 1000/"Idle timeout" close to each connection
    /// whose inactivity exceeds `idle_timeout`. Returns the count
    /// closed (spec §4.5).
    pub async fn cleanup_idle_connections(&self, idle_timeout: Duration) -> usize {
        let connections = self.connections.read().await;
        let now = Instant::now();
        let mut closed = 0;
        for record in connections.values() {
            if now.duration_since(record.last_activity().await) >= idle_timeout {
                let close = Message::Close(Some(CloseFrame {
                    code: 1000,
                    reason: "Idle timeout".into(),
                }));
                if record.send(close) {
                    closed += 1;
                }
            }
        }
        closed
    }

    pub fn reset_metrics(&self) {
        self.peak.store(0, Ordering::Relaxed);
    }

    pub fn spawn_idle_reaper(self: &Arc<Self>, idle_timeout: Duration) -> tokio::task::JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5 * 60));
            loop {
                interval.tick().await;
                let closed = pool.cleanup_idle_connections(idle_timeout).await;
                if closed > 0 {
                    tracing::info!(closed, "reaped idle websocket connections");
                }
            }
        })
    }

    /// Closes every open connection with 1000/"Server shutdown" and
    /// clears the registry (spec §4.5).
    pub async fn destroy(&self) {
        let mut connections = self.connections.write().await;
        for record in connections.values() {
            record.send(Message::Close(Some(CloseFrame {
                code: 1000,
                reason: "Server shutdown".into(),
            })));
        }
        connections.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outbox() -> (Outbox, mpsc::UnboundedReceiver<Message>) {
        mpsc::unbounded_channel()
    }

    #[tokio::test]
    async fn refuses_admission_at_capacity() {
        let pool = ConnectionPool::new(1);
        let (tx1, _rx1) = outbox();
        let (tx2, _rx2) = outbox();
        assert!(pool.add("a".into(), "/ws/chat".into(), tx1).await.is_ok());
        assert!(pool.add("b".into(), "/ws/chat".into(), tx2).await.is_err());
    }

    #[tokio::test]
    async fn remove_is_idempotent_on_missing_id() {
        let pool = ConnectionPool::new(10);
        assert!(pool.remove("nonexistent").await.is_none());
    }

    #[tokio::test]
    async fn broadcast_counts_successes_and_filters_by_path() {
        let pool = ConnectionPool::new(10);
        let (tx1, mut rx1) = outbox();
        let (tx2, _rx2) = outbox();
        pool.add("a".into(), "/ws/chat".into(), tx1).await.unwrap();
        pool.add("b".into(), "/ws/echo".into(), tx2).await.unwrap();

        let sent = pool.broadcast("chat", Message::Text("hi".into())).await;
        assert_eq!(sent, 1);
        assert!(matches!(rx1.recv().await, Some(Message::Text(_))));
    }

    #[tokio::test]
    async fn stats_reports_total_and_peak() {
        let pool = ConnectionPool::new(10);
        let (tx1, _rx1) = outbox();
        pool.add("a".into(), "/ws/chat".into(), tx1).await.unwrap();
        let stats = pool.stats().await;
        assert_eq!(stats.total, 1);
        assert_eq!(stats.peak, 1);
    }

    #[tokio::test]
    async fn destroy_closes_all_and_clears_registry() {
        let pool = ConnectionPool::new(10);
        let (tx1, mut rx1) = outbox();
        pool.add("a".into(), "/ws/chat".into(), tx1).await.unwrap();
        pool.destroy().await;
        assert_eq!(pool.stats().await.total, 0);
        assert!(matches!(rx1.recv().await, Some(Message::Close(_))));
    }
}
