//! Minimal axum host wiring `ws_runtime` to two demo route modules (an
//! echo handler and a broadcast chat room) — a demonstration harness,
//! not part of the library's public contract (SPEC_FULL.md §0).

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};

use ws_runtime::config::{FrameworkConfig, RuntimeConfig};
use ws_runtime::websocket::resolver::{ModuleExport, ModuleLoader};
use ws_runtime::websocket::{
    upgrade_handler, ClientSocket, ConnectionPool, MemoryManager, MemoryThresholds, RouteEntry, RouteResolver, RouteTable, RuntimeError,
    UpgradeOrchestrator,
};

#[path = "../../demos/echo.rs"]
mod echo;
#[path = "../../demos/chat.rs"]
mod chat;

#[derive(Parser, Debug)]
#[command(name = "demo_server")]
struct Args {
    /// Address to bind the demo server to.
    #[arg(long, default_value = "127.0.0.1:8080")]
    bind: SocketAddr,
}

/// Dispatches to whichever demo module owns a given route's module key.
/// Stands in for the host framework's filesystem-backed module loader
/// (spec.md §6 "Module contract").
struct DemoLoader;

#[async_trait::async_trait]
impl ModuleLoader<ClientSocket> for DemoLoader {
    async fn resolve_page_path(&self, module_key: &str) -> Option<String> {
        Some(module_key.to_string())
    }

    async fn load_export(&self, module_key: &str) -> Result<ModuleExport<ClientSocket>, RuntimeError> {
        match module_key {
            "ws/echo/route" => Ok(ModuleExport::Direct(echo::factory())),
            "ws/rooms/route" => Ok(ModuleExport::Direct(chat::factory())),
            other => Err(RuntimeError::ModuleImport { module_key: other.to_string(), reason: "no demo module registered".to_string() }),
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = Arc::new(RuntimeConfig::load(&FrameworkConfig::default()));
    ws_runtime::init_tracing(&config);

    for problem in config.validate() {
        tracing::warn!(problem, "config validation warning");
    }

    let (echo_pattern, echo_key) = echo::route();
    let (room_pattern, room_key) = chat::route();
    let table = RouteTable::from_entries(
        vec![
            RouteEntry { pattern: echo_pattern.to_string(), module_key: echo_key.to_string() },
            RouteEntry { pattern: room_pattern.to_string(), module_key: room_key.to_string() },
        ],
        "route",
    );

    let resolver = Arc::new(RouteResolver::new(
        table,
        Arc::new(DemoLoader),
        ws_runtime::websocket::resolver::WebSocketServerHandle::new("demo_server"),
    ));
    let pool = Arc::new(ConnectionPool::new(config.max_connections));
    let memory = Arc::new(MemoryManager::new(MemoryThresholds::default(), pool.clone()));
    memory.register_default_strategies(|| Box::pin(async { 0 })).await;

    let orchestrator = UpgradeOrchestrator::new(config.clone(), resolver, pool, memory);
    orchestrator.attach();
    orchestrator.spawn_background_tasks();

    let health_monitor = orchestrator.health_monitor();
    let metrics_monitor = orchestrator.health_monitor();
    let health_memory = orchestrator.memory_manager();
    let capacity = config.max_connections;

    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    let app = Router::new()
        .route("/ws/echo", get(upgrade_handler))
        .route("/ws/rooms/:roomId", get(upgrade_handler))
        .route(
            "/healthz",
            get(move || {
                let monitor = health_monitor.clone();
                let memory = health_memory.clone();
                async move {
                    let heap_pct = memory.stats().await.percentage;
                    ws_runtime::websocket::health::health_handler(monitor, heap_pct, capacity).await
                }
            }),
        )
        .route(
            "/healthz/metrics",
            get(move || {
                let monitor = metrics_monitor.clone();
                async move { ws_runtime::websocket::health::metrics_handler(monitor).await }
            }),
        )
        .with_state(orchestrator.clone())
        .layer(cors)
        .layer(axum::middleware::from_fn(ws_runtime::middleware::logger));

    tracing::info!(addr = %args.bind, "demo server listening");
    axum::Server::bind(&args.bind)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .unwrap();
}
