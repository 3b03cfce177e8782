//! The top-level upgrade pipeline tying C1-C9 together (spec §4.10).
//!
//! Transformed from the teacher's `websocket/handler.rs`
//! (`WebSocketHandler::websocket_handler` /
//! `handle_websocket_connection`): the JWT-auth gate is replaced by the
//! admission pipeline (dedupe → rate limit → route resolve → capacity →
//! breaker) spec §4.10 describes, and the single chat-room manager is
//! replaced by the full set of per-route singletons built in this crate.
//!
//! The host framework's "upgrade" event with a raw socket and a
//! `setup`/double-attach guard (spec §4.10, §9 "Global singletons") maps
//! onto axum's extractor-based upgrade: admission runs as a plain async
//! function *before* `WebSocketUpgrade::on_upgrade` is called, so an
//! admission failure is expressed as a non-101 HTTP response rather than
//! a literal raw-socket `destroy()` — the client sees the same outcome
//! either way (no completed handshake, no frame). Double-`setup` is
//! modelled with an `AtomicBool` guarding `attach`, since axum has no
//! runtime concept of re-attaching a listener to the same server handle.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, Notify};

use crate::config::RuntimeConfig;
use crate::websocket::circuit_breaker::CircuitBreakerRegistry;
use crate::websocket::errors::RuntimeError;
use crate::websocket::graceful::{
    close_websocket_gracefully, connection_error_action, execute_handler_safely, ConnectionErrorAction, GracefulCloseOptions, TerminateHandle,
};
use crate::websocket::health::HealthMonitor;
use crate::websocket::memory::MemoryManager;
use crate::websocket::pool::{ConnectionPool, Outbox};
use crate::websocket::rate_limiter::{client_identity, RateLimitConfig, RateLimiter};
use crate::websocket::resolver::{CleanupFn, ConnectRequest, ResolvedRoute, RouteResolver};
use crate::websocket::tracker::ConnectionTracker;

/// A live client connection handed to the user's connection handler
/// (spec §6 "client socket conforms to the framing library's client
/// API"). Sends go through the pool-owned outbox so pool metrics and
/// graceful close stay authoritative; inbound application messages are
/// delivered through `recv`, after the orchestrator's read loop has
/// already bumped pool/health counters for them.
pub struct ClientSocket {
    id: String,
    outbox: Outbox,
    inbox: Mutex<mpsc::UnboundedReceiver<Message>>,
}

impl ClientSocket {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.outbox.send(Message::Text(text.into())).is_ok()
    }

    pub fn send_binary(&self, data: Vec<u8>) -> bool {
        self.outbox.send(Message::Binary(data)).is_ok()
    }

    pub fn ping(&self) -> bool {
        self.outbox.send(Message::Ping(Vec::new())).is_ok()
    }

    pub fn close(&self, code: u16, reason: impl Into<String>) -> bool {
        self.outbox
            .send(Message::Close(Some(axum::extract::ws::CloseFrame { code, reason: reason.into().into() })))
            .is_ok()
    }

    /// Awaits the next inbound application message. Returns `None` once
    /// the socket has closed.
    pub async fn recv(&self) -> Option<Message> {
        self.inbox.lock().await.recv().await
    }
}

pub type ConnectionHandlerFn = crate::websocket::resolver::ConnectionHandlerFn<ClientSocket>;
pub type ConnectionFactory = crate::websocket::resolver::ConnectionFactory<ClientSocket>;

/// URL path prefixes reserved for the host framework's own internal
/// upgrade channels (spec §4.10 step 1: "Skip internal reserved path
/// prefixes").
const RESERVED_PATH_PREFIXES: &[&str] = &["/__ws_internal"];

fn is_reserved_path(path: &str) -> bool {
    RESERVED_PATH_PREFIXES.iter().any(|prefix| path.starts_with(prefix))
}

/// Process-wide monotonic id generator standing in for socket identity
/// (spec §4.10 step 2). Each HTTP upgrade request in axum corresponds to
/// exactly one underlying TCP connection, so a per-request counter
/// satisfies the in-flight-set's uniqueness requirement without axum
/// exposing raw socket handles pre-handshake.
#[derive(Default)]
struct SocketIdGenerator(AtomicU64);

impl SocketIdGenerator {
    fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// Everything an upgrade needs to resolve identity and admission (spec
/// §4.3 "Identity derivation order", §4.10 step 1 "Parse").
pub struct UpgradeRequest {
    pub path: String,
    pub remote_addr: SocketAddr,
    pub forwarded_for: Option<String>,
    pub real_ip: Option<String>,
}

impl UpgradeRequest {
    pub fn from_parts(path: String, remote_addr: SocketAddr, headers: &HeaderMap) -> Self {
        let header_str = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string);
        Self {
            path,
            remote_addr,
            forwarded_for: header_str("x-forwarded-for"),
            real_ip: header_str("x-real-ip"),
        }
    }

    fn identity(&self) -> String {
        client_identity(self.forwarded_for.as_deref(), self.real_ip.as_deref(), Some(&self.remote_addr.to_string()))
    }
}

/// The verdict `admit` reaches before the protocol handshake runs (spec
/// §4.10 steps 1-5). `Admit` carries everything `on_ready` needs to
/// finish wiring the connection once axum completes the handshake.
pub enum AdmissionOutcome {
    Admit { resolved: ResolvedRoute, handler: ConnectionHandlerFn, route_config: RouteRuntimeConfig },
    Reject(StatusCode),
}

/// Per-route effective config resolved once at admission time (spec
/// §4.11 "Per-route overrides shadow the global values").
#[derive(Clone, Debug)]
pub struct RouteRuntimeConfig {
    pub max_connections: u32,
    pub timeout_ms: u64,
    pub rate_limit: Option<crate::config::RateLimitRule>,
}

/// Process-singleton orchestrator. Owns every other singleton (spec §3
/// "Ownership") and is constructed once per host-server lifetime.
pub struct UpgradeOrchestrator {
    config: Arc<RuntimeConfig>,
    tracker: Arc<ConnectionTracker>,
    rate_limiter: Arc<RateLimiter>,
    breakers: Arc<CircuitBreakerRegistry>,
    pool: Arc<ConnectionPool>,
    memory: Arc<MemoryManager>,
    health: Arc<HealthMonitor>,
    resolver: Arc<RouteResolver<ClientSocket>>,
    socket_ids: SocketIdGenerator,
    attached: AtomicBool,
}

impl UpgradeOrchestrator {
    pub fn new(
        config: Arc<RuntimeConfig>,
        resolver: Arc<RouteResolver<ClientSocket>>,
        pool: Arc<ConnectionPool>,
        memory: Arc<MemoryManager>,
    ) -> Arc<Self> {
        let breakers = Arc::new(CircuitBreakerRegistry::new(crate::websocket::circuit_breaker::CircuitBreakerConfig {
            failure_threshold: config.circuit_breaker.failure_threshold,
            reset_timeout: Duration::from_millis(config.circuit_breaker.reset_timeout_ms),
            monitoring_window: Duration::from_millis(config.circuit_breaker.monitoring_window_ms),
            success_threshold: config.circuit_breaker.success_threshold,
        }));
        let health = Arc::new(HealthMonitor::new(pool.clone(), breakers.clone()));

        Arc::new(Self {
            config,
            tracker: Arc::new(ConnectionTracker::new()),
            rate_limiter: Arc::new(RateLimiter::new()),
            breakers,
            pool,
            memory,
            health,
            resolver,
            socket_ids: SocketIdGenerator::default(),
            attached: AtomicBool::new(false),
        })
    }

    pub fn health_monitor(&self) -> Arc<HealthMonitor> {
        self.health.clone()
    }

    pub fn pool(&self) -> Arc<ConnectionPool> {
        self.pool.clone()
    }

    pub fn memory_manager(&self) -> Arc<MemoryManager> {
        self.memory.clone()
    }

    /// `setup` (spec §4.10): returns `false` without side effects if
    /// this orchestrator is already attached (double-`setup` is a
    /// no-op, spec §8).
    pub fn attach(&self) -> bool {
        self.attached.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok()
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    /// Spawns the background sweepers every singleton needs (breaker
    /// eviction, rate-limiter sweep, tracker pruning, idle reaper,
    /// memory monitor tick) — one call per attached server, matching the
    /// teacher's `start_connection_cleanup_task` spawn-on-boot pattern.
    pub fn spawn_background_tasks(self: &Arc<Self>) {
        self.breakers.spawn_sweeper();
        self.rate_limiter.spawn_sweeper(Duration::from_millis(self.config.timeout_ms));
        self.tracker.spawn_sweeper();
        self.pool.spawn_idle_reaper(Duration::from_millis(self.config.timeout_ms));
        self.memory.spawn_monitor(60_000);
    }

    /// Steps 1-5 of the pipeline (spec §4.10): parse, dedupe, rate
    /// check, route resolution, factory init/lookup. Everything here
    /// runs before the WebSocket handshake, so a `Reject` means the
    /// socket never sees a 101 response.
    pub async fn admit(&self, socket_id: u64, request: &UpgradeRequest) -> AdmissionOutcome {
        self.health.record_upgrade_attempted();

        if is_reserved_path(&request.path) {
            self.health.record_upgrade_failed();
            return AdmissionOutcome::Reject(StatusCode::NOT_FOUND);
        }

        if !self.tracker.mark_in_flight(socket_id).await {
            // Dropped silently (spec §4.10 step 2); no counters beyond
            // the attempt already recorded above.
            return AdmissionOutcome::Reject(StatusCode::CONFLICT);
        }

        // The tracker's rapid-duplicate squelch (`is_rapid_duplicate`) is
        // deliberately not consulted here — see DESIGN.md: wiring it in
        // would squelch the second and third upgrades in spec.md §8
        // scenario 4 (three same-IP upgrades 500ms apart against a
        // maxRequests=2 rate limit) before they ever reach the rate
        // limiter, which contradicts the scenario's expected outcome.

        let resolved = match self.resolver.resolve(&request.path).await {
            Ok(resolved) => resolved,
            Err(err) => {
                self.tracker.unmark_in_flight(socket_id).await;
                self.health.record_upgrade_failed();
                return AdmissionOutcome::Reject(err.status());
            }
        };

        let route_config = self.route_runtime_config(&resolved.pattern);

        if let Some(rule) = &route_config.rate_limit {
            let identity = request.identity();
            let limit_config = RateLimitConfig { window: Duration::from_millis(rule.window_ms), max_requests: rule.max_requests };
            let decision = self.rate_limiter.check(&resolved.pattern, &identity, &limit_config).await;
            if !decision.admitted {
                self.tracker.unmark_in_flight(socket_id).await;
                self.health.record_upgrade_failed();
                return AdmissionOutcome::Reject(StatusCode::TOO_MANY_REQUESTS);
            }
        }

        let breaker = self.breakers.get_or_create(&resolved.pattern).await;
        if !breaker.can_execute().await {
            self.tracker.unmark_in_flight(socket_id).await;
            self.health.record_upgrade_failed();
            return AdmissionOutcome::Reject(StatusCode::SERVICE_UNAVAILABLE);
        }

        let handler = match self.resolver.handler_for(&resolved).await {
            Ok(handler) => handler,
            Err(err) => {
                breaker.record_failure().await;
                self.tracker.unmark_in_flight(socket_id).await;
                self.health.record_upgrade_failed();
                return AdmissionOutcome::Reject(err.status());
            }
        };

        breaker.record_success().await;
        AdmissionOutcome::Admit { resolved, handler, route_config }
    }

    fn route_runtime_config(&self, pattern: &str) -> RouteRuntimeConfig {
        let override_ = self.config.route_override(pattern);
        RouteRuntimeConfig {
            max_connections: override_.and_then(|o| o.max_connections).unwrap_or(self.config.max_connections),
            timeout_ms: override_.and_then(|o| o.timeout_ms).unwrap_or(self.config.timeout_ms),
            rate_limit: override_.and_then(|o| o.rate_limit.clone()),
        }
    }

    /// Steps 6-8 of the pipeline (spec §4.10), run from inside axum's
    /// `on_upgrade` callback once the handshake has completed. Owns the
    /// socket for its entire lifetime: splits it into read/write halves,
    /// spawns the write task, runs admission-time capacity/memory checks,
    /// then spawns the heartbeat and the inbound read loop and invokes the
    /// user handler concurrently with both — the handler is typically
    /// parked on `ClientSocket::recv` for the connection's whole lifetime,
    /// so the read loop cannot wait for it to return first.
    pub async fn on_ready(
        self: Arc<Self>,
        socket: WebSocket,
        socket_id: u64,
        resolved: ResolvedRoute,
        handler: ConnectionHandlerFn,
        route_config: RouteRuntimeConfig,
        remote_addr: SocketAddr,
    ) {
        let (mut sink, mut stream) = socket.split();
        let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<Message>();
        let closed_notify = Arc::new(Notify::new());

        let write_closed = closed_notify.clone();
        let write_health = self.health.clone();
        let write_task = tokio::spawn(async move {
            while let Some(message) = outbox_rx.recv().await {
                let is_close = matches!(message, Message::Close(_));
                let is_application_message = matches!(message, Message::Text(_) | Message::Binary(_));
                if sink.send(message).await.is_err() || is_close {
                    break;
                }
                if is_application_message {
                    write_health.record_message_out();
                }
            }
            write_closed.notify_waiters();
        });

        let terminate = TerminateHandle::new(vec![write_task.abort_handle()]);

        if !self.memory.acceptable().await {
            close_websocket_gracefully(&outbox_tx, closed_notify, terminate, GracefulCloseOptions::new(1013, "Server overloaded")).await;
            self.tracker.unmark_in_flight(socket_id).await;
            return;
        }

        let connection_id = uuid::Uuid::new_v4().to_string();
        let route_at_capacity = route_config.max_connections > 0
            && self.pool.connections_by_path(&resolved.pattern).await.len() as u32 >= route_config.max_connections;
        let record = if route_at_capacity {
            None
        } else {
            self.pool.add(connection_id.clone(), resolved.pattern.clone(), outbox_tx.clone()).await.ok()
        };
        let record = match record {
            Some(record) => record,
            None => {
                close_websocket_gracefully(&outbox_tx, closed_notify, terminate, GracefulCloseOptions::new(1013, "Server at capacity")).await;
                self.tracker.unmark_in_flight(socket_id).await;
                return;
            }
        };
        self.health.record_connection_opened();

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let client = Arc::new(ClientSocket { id: connection_id.clone(), outbox: outbox_tx.clone(), inbox: Mutex::new(inbox_rx) });

        let request = ConnectRequest { path: resolved.pattern.clone(), params: resolved.params.clone(), remote_addr: remote_addr.to_string() };

        let heartbeat = self.clone().spawn_heartbeat(outbox_tx.clone());

        // The read loop must run concurrently with the user handler, not
        // after it: the handler is typically parked on `ClientSocket::recv`
        // for the whole connection lifetime (spec §8 scenario 1's echo
        // handler, `demos/echo.rs`), and `recv` only ever yields a message
        // because this pump fed it one. Spawning it lets inbound frames
        // flow while `handler(...)` below is still awaiting its own
        // completion (spec §4.5 "each inbound message bumps last-activity,
        // message count and inbound byte count").
        let read_self = self.clone();
        let read_record = record.clone();
        let read_connection_id = connection_id.clone();
        let read_task = tokio::spawn(async move {
            loop {
                match stream.next().await {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(message)) => {
                        let bytes = match &message {
                            Message::Text(t) => t.len(),
                            Message::Binary(b) => b.len(),
                            _ => 0,
                        };
                        read_record.record_inbound(bytes).await;
                        read_self.health.record_message_in();
                        if inbox_tx.send(message).is_err() {
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        tracing::debug!(connection_id = %read_connection_id, error = %err, "read loop error");
                        break;
                    }
                }
            }
            // Dropping `inbox_tx` here (the loop's exit, whichever branch)
            // unblocks any handler still parked on `ClientSocket::recv`.
        });

        let cleanup: Option<CleanupFn> = match execute_handler_safely(handler(client.clone(), request)).await {
            Ok(cleanup) => cleanup,
            Err(err) => {
                self.health.record_error();
                let breaker = self.breakers.get_or_create(&resolved.pattern).await;
                breaker.record_failure().await;
                heartbeat.abort();
                read_task.abort();
                terminate.terminate();
                self.finish_connection(socket_id, &connection_id, record.opened_at, None).await;
                tracing::warn!(route = %resolved.pattern, error = %err, "connection handler failed");
                return;
            }
        };

        heartbeat.abort();
        read_task.abort();
        terminate.terminate();
        self.finish_connection(socket_id, &connection_id, record.opened_at, cleanup).await;
    }

    /// Heartbeat timer (spec §4.10 step 8c): pings every 30s while the
    /// outbox is still accepting sends, and stops itself once it is not
    /// (spec §8: "Heartbeat stops within one tick of socket state
    /// leaving OPEN").
    fn spawn_heartbeat(self: Arc<Self>, outbox: Outbox) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                if outbox.send(Message::Ping(Vec::new())).is_err() {
                    break;
                }
            }
        })
    }

    /// Single close path for a connection, guarded by the tracker's
    /// cleanup-once set (spec §4.10 step 8a, §8 "user cleanup for C runs
    /// at most once").
    async fn finish_connection(&self, socket_id: u64, connection_id: &str, opened_at: Instant, cleanup: Option<CleanupFn>) {
        self.tracker.unmark_in_flight(socket_id).await;
        self.pool.remove(connection_id).await;
        self.health.record_connection_closed(opened_at.elapsed());

        if !self.tracker.mark_cleaned_up(connection_id).await {
            return;
        }
        if let Some(cleanup) = cleanup {
            if let Err(err) = execute_handler_safely(cleanup()).await {
                tracing::warn!(connection_id, error = %err, "user cleanup failed");
            }
        }
    }

    /// `handleConnectionError`/`handleUpgradeError` entry point for
    /// callers outside the main pipeline (spec §4.9). Exposed so demo
    /// route handlers can route an error they catch through the same
    /// recovery taxonomy the orchestrator itself uses.
    pub async fn handle_connection_error(&self, outbox: &Outbox, closed: Arc<Notify>, terminate: TerminateHandle, error: RuntimeError) {
        self.health.record_error();
        match connection_error_action(&error) {
            ConnectionErrorAction::Close(opts) => close_websocket_gracefully(outbox, closed, terminate, opts).await,
            ConnectionErrorAction::Terminate => terminate.terminate(),
            ConnectionErrorAction::None => {}
        }
    }

    /// `shutdown` (spec §4.10 step 9, §5 "Teardown"): detaches,
    /// closes every connection with 1000/"Server shutdown" and clears
    /// every singleton's cache.
    pub async fn shutdown(&self) {
        self.attached.store(false, Ordering::SeqCst);
        self.pool.destroy().await;
        self.tracker.destroy().await;
        self.rate_limiter.destroy().await;
        self.breakers.destroy().await;
        self.resolver.clear_factory_cache().await;
        self.memory.stop_monitoring();
    }

    pub fn next_socket_id(&self) -> u64 {
        self.socket_ids.next()
    }
}

/// Helper so callers that only have `route_config.rate_limit` shaped as
/// `Option<RateLimitRule>` (demo binary, tests) can build one inline.
pub fn no_rate_limit() -> RouteRuntimeConfig {
    RouteRuntimeConfig { max_connections: 0, timeout_ms: 0, rate_limit: None }
}

/// The axum route handler wiring `admit` and `on_ready` together (spec
/// §4.10 end to end). Mounted against a single catch-all path by the
/// host; route dispatch happens inside `admit` via the resolver, not
/// through axum's own router.
pub async fn upgrade_handler(
    State(orchestrator): State<Arc<UpgradeOrchestrator>>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    uri: Uri,
    ws: WebSocketUpgrade,
) -> Response {
    let request = UpgradeRequest::from_parts(uri.path().to_string(), remote_addr, &headers);
    let socket_id = orchestrator.next_socket_id();

    match orchestrator.admit(socket_id, &request).await {
        AdmissionOutcome::Reject(status) => status.into_response(),
        AdmissionOutcome::Admit { resolved, handler, route_config } => ws
            .on_upgrade(move |socket| async move {
                orchestrator.on_ready(socket, socket_id, resolved, handler, route_config, remote_addr).await;
            })
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::resolver::{ModuleExport, RouteEntry, RouteTable};
    use std::net::{IpAddr, Ipv4Addr};

    struct EchoLoader;

    fn echo_factory() -> ConnectionFactory {
        Arc::new(|_handle| {
            Box::pin(async move {
                let handler: ConnectionHandlerFn = Arc::new(|_socket, _req| Box::pin(async { None }));
                Ok(handler)
            })
        })
    }

    #[async_trait::async_trait]
    impl crate::websocket::resolver::ModuleLoader<ClientSocket> for EchoLoader {
        async fn resolve_page_path(&self, module_key: &str) -> Option<String> {
            Some(module_key.to_string())
        }

        async fn load_export(&self, _module_key: &str) -> Result<ModuleExport<ClientSocket>, RuntimeError> {
            Ok(ModuleExport::Direct(echo_factory()))
        }
    }

    fn test_orchestrator(max_connections: u32) -> Arc<UpgradeOrchestrator> {
        let mut config = RuntimeConfig::default();
        config.max_connections = max_connections;
        let config = Arc::new(config);

        let table = RouteTable::from_entries(vec![RouteEntry { pattern: "/ws/echo".into(), module_key: "ws/echo/route".into() }], "route");
        let resolver = Arc::new(crate::websocket::resolver::RouteResolver::new(
            table,
            Arc::new(EchoLoader),
            crate::websocket::resolver::WebSocketServerHandle::new("test"),
        ));
        let pool = Arc::new(ConnectionPool::new(max_connections));
        let memory = Arc::new(crate::websocket::memory::MemoryManager::new(
            crate::websocket::memory::MemoryThresholds { ceiling_bytes: Some(u64::MAX), ..Default::default() },
            pool.clone(),
        ));
        UpgradeOrchestrator::new(config, resolver, pool, memory)
    }

    fn request(path: &str) -> UpgradeRequest {
        UpgradeRequest {
            path: path.to_string(),
            remote_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 9000),
            forwarded_for: None,
            real_ip: None,
        }
    }

    #[test]
    fn attach_is_idempotent() {
        let orchestrator = test_orchestrator(10);
        assert!(orchestrator.attach());
        assert!(!orchestrator.attach());
    }

    #[tokio::test]
    async fn reserved_path_is_rejected_before_dedupe() {
        let orchestrator = test_orchestrator(10);
        let outcome = orchestrator.admit(orchestrator.next_socket_id(), &request("/__ws_internal/hmr")).await;
        assert!(matches!(outcome, AdmissionOutcome::Reject(StatusCode::NOT_FOUND)));
    }

    #[tokio::test]
    async fn unknown_route_is_rejected_with_404() {
        let orchestrator = test_orchestrator(10);
        let outcome = orchestrator.admit(orchestrator.next_socket_id(), &request("/nope")).await;
        assert!(matches!(outcome, AdmissionOutcome::Reject(StatusCode::NOT_FOUND)));
    }

    #[tokio::test]
    async fn known_route_is_admitted() {
        let orchestrator = test_orchestrator(10);
        let outcome = orchestrator.admit(orchestrator.next_socket_id(), &request("/ws/echo")).await;
        assert!(matches!(outcome, AdmissionOutcome::Admit { .. }));
    }

    #[tokio::test]
    async fn duplicate_in_flight_socket_is_dropped() {
        let orchestrator = test_orchestrator(10);
        let socket_id = orchestrator.next_socket_id();
        // First admission leaves the socket marked in-flight (it is only
        // unmarked by `finish_connection` once the connection actually
        // closes, or by an admission failure).
        let first = orchestrator.admit(socket_id, &request("/ws/echo")).await;
        assert!(matches!(first, AdmissionOutcome::Admit { .. }));

        let second = orchestrator.admit(socket_id, &request("/ws/echo")).await;
        assert!(matches!(second, AdmissionOutcome::Reject(StatusCode::CONFLICT)));
    }

    #[tokio::test]
    async fn shutdown_detaches_and_clears_factory_cache() {
        let orchestrator = test_orchestrator(10);
        orchestrator.attach();
        orchestrator.admit(orchestrator.next_socket_id(), &request("/ws/echo")).await;
        orchestrator.shutdown().await;
        assert!(!orchestrator.is_attached());
    }
}
