//! Shared harness for the crate-level end-to-end scenarios (spec.md §8
//! "End-to-end scenarios"), mirroring the teacher's
//! `tests/websocket/mod.rs` role of housing fixtures shared by
//! `basic_tests.rs` and `stress_tests.rs`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;

use ws_runtime::config::{FrameworkConfig, RateLimitRule, RouteOverride, RuntimeConfig};
use ws_runtime::websocket::resolver::{ModuleExport, ModuleLoader, WebSocketServerHandle};
use ws_runtime::websocket::{
    upgrade_handler, ClientSocket, ConnectionPool, MemoryManager, MemoryThresholds, RouteEntry, RouteResolver, RouteTable, RuntimeError,
    UpgradeOrchestrator,
};

#[path = "../../demos/echo.rs"]
pub mod echo;
#[path = "../../demos/chat.rs"]
pub mod chat;

/// Dispatches the two demo route modules by module key, the way the
/// host framework's own filesystem-backed loader would (spec.md §6).
struct TestLoader;

#[async_trait::async_trait]
impl ModuleLoader<ClientSocket> for TestLoader {
    async fn resolve_page_path(&self, module_key: &str) -> Option<String> {
        Some(module_key.to_string())
    }

    async fn load_export(&self, module_key: &str) -> Result<ModuleExport<ClientSocket>, RuntimeError> {
        match module_key {
            "ws/echo/route" => Ok(ModuleExport::Direct(echo::factory())),
            "ws/rooms/route" => Ok(ModuleExport::Direct(chat::factory())),
            other => Err(RuntimeError::ModuleImport { module_key: other.to_string(), reason: "unknown test route".to_string() }),
        }
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub orchestrator: Arc<UpgradeOrchestrator>,
}

#[derive(Default)]
pub struct TestServerOptions {
    pub rate_limit_ws_limited: bool,
    pub cap_ws_capped_at_one: bool,
}

/// Starts a real axum server on an ephemeral port with `/ws/echo`,
/// `/ws/limited`, `/ws/capped` and `/ws/rooms/:roomId` wired to
/// `upgrade_handler`, exactly as `src/bin/demo_server.rs` wires them.
pub async fn start(options: TestServerOptions) -> TestServer {
    let mut framework = FrameworkConfig::default();
    framework.max_connections = Some(100);

    if options.rate_limit_ws_limited {
        framework.routes.insert(
            "/ws/limited".to_string(),
            RouteOverride { rate_limit: Some(RateLimitRule { window_ms: 60_000, max_requests: 1 }), ..Default::default() },
        );
    }
    if options.cap_ws_capped_at_one {
        framework.routes.insert("/ws/capped".to_string(), RouteOverride { max_connections: Some(1), ..Default::default() });
    }

    let config = Arc::new(RuntimeConfig::default().merge(&framework));

    let table = RouteTable::from_entries(
        vec![
            RouteEntry { pattern: "/ws/echo".into(), module_key: "ws/echo/route".into() },
            RouteEntry { pattern: "/ws/limited".into(), module_key: "ws/echo/route".into() },
            RouteEntry { pattern: "/ws/capped".into(), module_key: "ws/echo/route".into() },
            RouteEntry { pattern: "/ws/rooms/:roomId".into(), module_key: "ws/rooms/route".into() },
        ],
        "route",
    );

    let resolver = Arc::new(RouteResolver::new(table, Arc::new(TestLoader), WebSocketServerHandle::new("test")));
    let pool = Arc::new(ConnectionPool::new(config.max_connections));
    let memory = Arc::new(MemoryManager::new(MemoryThresholds { ceiling_bytes: Some(u64::MAX), ..Default::default() }, pool.clone()));
    memory.register_default_strategies(|| Box::pin(async { 0 })).await;

    let orchestrator = UpgradeOrchestrator::new(config, resolver, pool, memory);
    orchestrator.attach();

    let app = Router::new()
        .route("/ws/echo", get(upgrade_handler))
        .route("/ws/limited", get(upgrade_handler))
        .route("/ws/capped", get(upgrade_handler))
        .route("/ws/rooms/:roomId", get(upgrade_handler))
        .with_state(orchestrator.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::Server::from_tcp(listener.into_std().unwrap())
            .unwrap()
            .serve(app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .unwrap();
    });

    // Let the spawned server start accepting before the first client dials.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    TestServer { addr, orchestrator }
}

pub fn ws_url(addr: SocketAddr, path: &str) -> String {
    format!("ws://{addr}{path}")
}
