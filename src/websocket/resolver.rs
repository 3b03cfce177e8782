//! Route resolution and one-shot factory initialisation (spec §4.8).
//!
//! No teacher module maps to this directly — the teacher's routes are
//! compiled into the axum `Router` at startup (`routes::create_router`),
//! not resolved dynamically per request. This module follows the
//! teacher's `db::repositories` style instead: a thin, testable layer
//! with its own error-producing methods and no direct axum dependency,
//! so the orchestrator can unit-test resolution without standing up a
//! server.
//!
//! Per spec §9 ("Design Notes"), the duck-typed module introspection of
//! the source system becomes an explicit, enumerated discriminated
//! variant (`ModuleExport`) instead of a runtime shape-sniffing routine.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use regex::Regex;
use tokio::sync::RwLock;

use crate::websocket::errors::RuntimeError;

/// A shared handle to the WebSocket server, passed to every connection
/// factory exactly once (spec §3 "Connection factory"). Carries nothing
/// but what a factory legitimately needs to close over: the resolved
/// runtime config and a name for logging. The orchestrator owns the
/// actual server resources (pool, breakers, ...) and never hands them to
/// user code directly.
#[derive(Clone)]
pub struct WebSocketServerHandle {
    pub server_name: Arc<str>,
}

impl WebSocketServerHandle {
    pub fn new(server_name: impl Into<Arc<str>>) -> Self {
        Self { server_name: server_name.into() }
    }
}

/// The inbound request the connection handler receives alongside the
/// client socket (spec §6 "User-facing API").
#[derive(Clone, Debug)]
pub struct ConnectRequest {
    pub path: String,
    pub params: HashMap<String, String>,
    pub remote_addr: String,
}

/// Runs once per client on close, if the handler returned one (spec §3
/// "Connection handler").
pub type CleanupFn = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Called once per accepted client (spec §3 "Connection handler"). The
/// `ClientSocket` type lives in `orchestrator` (it needs the pool/health
/// wiring the resolver has no business knowing about); it is threaded
/// through here as a type parameter substitute via `Arc<dyn Any>`-free
/// generics would overcomplicate this module, so the resolver is generic
/// over the socket type the orchestrator defines.
pub type ConnectionHandlerFn<Socket> =
    Arc<dyn Fn(Arc<Socket>, ConnectRequest) -> Pin<Box<dyn Future<Output = Option<CleanupFn>> + Send>> + Send + Sync>;

/// Invoked at most once per route per process lifetime with the shared
/// server handle (spec §3 "Connection factory").
pub type ConnectionFactory<Socket> = Arc<
    dyn Fn(WebSocketServerHandle) -> Pin<Box<dyn Future<Output = Result<ConnectionHandlerFn<Socket>, RuntimeError>> + Send>>
        + Send
        + Sync,
>;

/// The well-known name a route module exports its upgrade handler under
/// when it uses the "conventional handlers map" shape (spec §4.8 step 4).
pub const HANDLERS_MAP_KEY: &str = "SOCKET";

/// The discriminated shape a loaded route module can take, replacing the
/// source system's duck-typed export sniffing (spec §9).
pub enum ModuleExport<Socket> {
    /// The module's default export *is* the factory.
    Direct(ConnectionFactory<Socket>),
    /// The module exports a `handlers` map; `HANDLERS_MAP_KEY` is looked
    /// up within it.
    HandlersMap(HashMap<String, ConnectionFactory<Socket>>),
    /// The standard route-handler nest: an object wrapping the factory
    /// under a conventional field, modelled here as a pre-unwrapped
    /// factory — the loader has already done the unwrap.
    Nested(ConnectionFactory<Socket>),
}

/// Loads a route module by its opaque module key (spec §6 "Module
/// loader"). A production host implements this against its own
/// filesystem-based route registry; the demo binary implements it
/// against an in-memory map.
#[async_trait::async_trait]
pub trait ModuleLoader<Socket>: Send + Sync {
    /// Returns the on-disk (or in-memory) path for `module_key`, if any.
    async fn resolve_page_path(&self, module_key: &str) -> Option<String>;

    /// Development-mode hook to trigger a compile; a no-op by default,
    /// matching spec §6: "optional; used in development".
    async fn ensure_page(&self, _module_key: &str) -> Result<(), RuntimeError> {
        Ok(())
    }

    /// Loads and returns the module's export shape. `ModuleImport` on
    /// failure (spec §4.1).
    async fn load_export(&self, module_key: &str) -> Result<ModuleExport<Socket>, RuntimeError>;
}

/// One entry in the app-router table (spec §6 "App router table").
#[derive(Clone, Debug)]
pub struct RouteEntry {
    pub pattern: String,
    pub module_key: String,
}

/// A resolved route: the matched entry plus any parameters extracted
/// from the URL (spec §4.8 "Output").
#[derive(Clone, Debug)]
pub struct ResolvedRoute {
    pub pattern: String,
    pub module_key: String,
    pub params: HashMap<String, String>,
}

/// Read-only table of routes, split into static and parameterised sets
/// up front (spec §4.8 step 1). Only patterns whose module key ends in
/// the route-file suffix are candidates (spec §6).
pub struct RouteTable {
    static_routes: HashMap<String, RouteEntry>,
    param_routes: Vec<RouteEntry>,
}

impl RouteTable {
    pub fn from_entries(entries: Vec<RouteEntry>, route_file_suffix: &str) -> Self {
        let mut static_routes = HashMap::new();
        let mut param_routes = Vec::new();

        for entry in entries {
            if !entry.module_key.ends_with(route_file_suffix) {
                continue;
            }
            if entry.pattern.contains(':') || entry.pattern.contains('*') {
                param_routes.push(entry);
            } else {
                static_routes.insert(entry.pattern.clone(), entry);
            }
        }

        Self { static_routes, param_routes }
    }

    pub fn is_empty(&self) -> bool {
        self.static_routes.is_empty() && self.param_routes.is_empty()
    }
}

/// Compiles a `:param` route pattern into an anchored regex with named
/// capture groups, e.g. `/ws/rooms/:roomId` → `^/ws/rooms/(?P<roomId>[^/]+)$`.
fn compile_pattern(pattern: &str) -> Regex {
    let mut regex_src = String::from("^");
    for (i, segment) in pattern.split('/').enumerate() {
        if i > 0 {
            regex_src.push('/');
        }
        if let Some(name) = segment.strip_prefix(':') {
            regex_src.push_str(&format!("(?P<{name}>[^/]+)"));
        } else if segment == "*" {
            regex_src.push_str("(?P<wildcard>.*)");
        } else {
            regex_src.push_str(&regex::escape(segment));
        }
    }
    regex_src.push('$');
    Regex::new(&regex_src).expect("compiled route pattern must be valid regex")
}

/// Resolves URLs against a route table and caches the result of
/// invoking each route's connection factory (spec §4.8).
pub struct RouteResolver<Socket> {
    table: RouteTable,
    loader: Arc<dyn ModuleLoader<Socket>>,
    server_handle: WebSocketServerHandle,
    matcher_cache: RwLock<HashMap<String, Regex>>,
    factory_cache: RwLock<HashMap<String, ConnectionHandlerFn<Socket>>>,
}

impl<Socket: Send + Sync + 'static> RouteResolver<Socket> {
    pub fn new(
        table: RouteTable,
        loader: Arc<dyn ModuleLoader<Socket>>,
        server_handle: WebSocketServerHandle,
    ) -> Self {
        Self {
            table,
            loader,
            server_handle,
            matcher_cache: RwLock::new(HashMap::new()),
            factory_cache: RwLock::new(HashMap::new()),
        }
    }

    /// `isSupported()` (spec §4.8): verifies the resolver has a
    /// non-empty route table to serve from before the orchestrator ever
    /// attaches. A host with an unreachable route table constructs no
    /// resolver at all, which this treats as "not supported".
    pub fn is_supported(&self) -> bool {
        !self.table.is_empty()
    }

    /// Resolves a URL path to a route entry and its path parameters
    /// (spec §4.8 steps 2-3). Pure given a fixed table: same path always
    /// yields the same result (spec §8 "Route resolution is pure").
    pub async fn resolve(&self, path: &str) -> Result<ResolvedRoute, RuntimeError> {
        if let Some(entry) = self.table.static_routes.get(path) {
            return Ok(ResolvedRoute {
                pattern: entry.pattern.clone(),
                module_key: entry.module_key.clone(),
                params: HashMap::new(),
            });
        }

        for entry in &self.table.param_routes {
            let regex = self.matcher_for(&entry.pattern).await;
            if let Some(captures) = regex.captures(path) {
                let params = regex
                    .capture_names()
                    .flatten()
                    .filter_map(|name| captures.name(name).map(|m| (name.to_string(), m.as_str().to_string())))
                    .collect();
                return Ok(ResolvedRoute {
                    pattern: entry.pattern.clone(),
                    module_key: entry.module_key.clone(),
                    params,
                });
            }
        }

        Err(RuntimeError::RouteNotFound { path: path.to_string() })
    }

    /// Compiles and caches a pattern's matcher on first use (spec §4.8
    /// step 3: "compile each parameterised pattern into a matcher once").
    async fn matcher_for(&self, pattern: &str) -> Regex {
        if let Some(existing) = self.matcher_cache.read().await.get(pattern) {
            return existing.clone();
        }
        let mut cache = self.matcher_cache.write().await;
        cache.entry(pattern.to_string()).or_insert_with(|| compile_pattern(pattern)).clone()
    }

    /// Returns the cached connection handler for `resolved`, invoking
    /// the route's factory at most once per process lifetime (spec §3
    /// "Connection factory", §4.8 step 5). A failed or non-caching
    /// invocation is never cached, so every subsequent upgrade for that
    /// route re-attempts the factory and fails the same way until the
    /// underlying module is reloaded (spec §8 boundary behaviour).
    pub async fn handler_for(&self, resolved: &ResolvedRoute) -> Result<ConnectionHandlerFn<Socket>, RuntimeError> {
        if let Some(handler) = self.factory_cache.read().await.get(&resolved.pattern) {
            return Ok(handler.clone());
        }

        self.loader.ensure_page(&resolved.module_key).await?;
        let export = self.loader.load_export(&resolved.module_key).await?;
        let factory = extract_factory(&resolved.pattern, export)?;
        let handler = factory(self.server_handle.clone()).await.map_err(|err| match err {
            RuntimeError::HandlerExecution { reason } => {
                RuntimeError::HandlerExecution { reason: format!("factory for {}: {reason}", resolved.pattern) }
            }
            other => other,
        })?;

        self.factory_cache.write().await.insert(resolved.pattern.clone(), handler.clone());
        Ok(handler)
    }

    /// Clears the factory cache (spec §4.10 step 9: "on host-server
    /// close ... clear the factory cache").
    pub async fn clear_factory_cache(&self) {
        self.factory_cache.write().await.clear();
    }
}

/// Applies the standard default-export unwrap rules (spec §4.8 step 4).
fn extract_factory<Socket>(pattern: &str, export: ModuleExport<Socket>) -> Result<ConnectionFactory<Socket>, RuntimeError> {
    match export {
        ModuleExport::Direct(factory) | ModuleExport::Nested(factory) => Ok(factory),
        ModuleExport::HandlersMap(mut map) => map
            .remove(HANDLERS_MAP_KEY)
            .ok_or_else(|| RuntimeError::HandlerNotFound { pattern: pattern.to_string() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedLoader {
        export_calls: AtomicUsize,
        make_export: Box<dyn Fn() -> ModuleExport<()> + Send + Sync>,
    }

    #[async_trait::async_trait]
    impl ModuleLoader<()> for FixedLoader {
        async fn resolve_page_path(&self, module_key: &str) -> Option<String> {
            Some(format!("/routes/{module_key}"))
        }

        async fn load_export(&self, _module_key: &str) -> Result<ModuleExport<()>, RuntimeError> {
            self.export_calls.fetch_add(1, Ordering::SeqCst);
            Ok((self.make_export)())
        }
    }

    fn direct_factory(ok: bool) -> ConnectionFactory<()> {
        Arc::new(move |_handle| {
            Box::pin(async move {
                if ok {
                    let handler: ConnectionHandlerFn<()> = Arc::new(|_socket, _req| Box::pin(async { None }));
                    Ok(handler)
                } else {
                    Err(RuntimeError::HandlerExecution { reason: "factory exploded".into() })
                }
            })
        })
    }

    fn table() -> RouteTable {
        RouteTable::from_entries(
            vec![
                RouteEntry { pattern: "/ws/echo".into(), module_key: "ws/echo/route".into() },
                RouteEntry { pattern: "/ws/rooms/:roomId".into(), module_key: "ws/rooms/route".into() },
                RouteEntry { pattern: "/not/a/route".into(), module_key: "not/a/route/page".into() },
            ],
            "route",
        )
    }

    #[tokio::test]
    async fn static_route_resolves_with_no_params() {
        let loader = Arc::new(FixedLoader {
            export_calls: AtomicUsize::new(0),
            make_export: Box::new(|| ModuleExport::Direct(direct_factory(true))),
        });
        let resolver = RouteResolver::new(table(), loader, WebSocketServerHandle::new("test"));
        let resolved = resolver.resolve("/ws/echo").await.unwrap();
        assert_eq!(resolved.pattern, "/ws/echo");
        assert!(resolved.params.is_empty());
    }

    #[tokio::test]
    async fn param_route_extracts_named_segment() {
        let loader = Arc::new(FixedLoader {
            export_calls: AtomicUsize::new(0),
            make_export: Box::new(|| ModuleExport::Direct(direct_factory(true))),
        });
        let resolver = RouteResolver::new(table(), loader, WebSocketServerHandle::new("test"));
        let resolved = resolver.resolve("/ws/rooms/42").await.unwrap();
        assert_eq!(resolved.pattern, "/ws/rooms/:roomId");
        assert_eq!(resolved.params.get("roomId").unwrap(), "42");
    }

    #[tokio::test]
    async fn unmatched_path_is_route_not_found() {
        let loader = Arc::new(FixedLoader {
            export_calls: AtomicUsize::new(0),
            make_export: Box::new(|| ModuleExport::Direct(direct_factory(true))),
        });
        let resolver = RouteResolver::new(table(), loader, WebSocketServerHandle::new("test"));
        let err = resolver.resolve("/nope").await.unwrap_err();
        assert!(matches!(err, RuntimeError::RouteNotFound { .. }));
    }

    #[tokio::test]
    async fn non_route_file_module_keys_are_excluded_from_the_table() {
        let loader = Arc::new(FixedLoader {
            export_calls: AtomicUsize::new(0),
            make_export: Box::new(|| ModuleExport::Direct(direct_factory(true))),
        });
        let resolver = RouteResolver::new(table(), loader, WebSocketServerHandle::new("test"));
        let err = resolver.resolve("/not/a/route").await.unwrap_err();
        assert!(matches!(err, RuntimeError::RouteNotFound { .. }));
    }

    #[tokio::test]
    async fn factory_invoked_once_then_cached() {
        let loader = Arc::new(FixedLoader {
            export_calls: AtomicUsize::new(0),
            make_export: Box::new(|| ModuleExport::Direct(direct_factory(true))),
        });
        let resolver = RouteResolver::new(table(), loader.clone(), WebSocketServerHandle::new("test"));
        let resolved = resolver.resolve("/ws/echo").await.unwrap();

        resolver.handler_for(&resolved).await.unwrap();
        resolver.handler_for(&resolved).await.unwrap();

        assert_eq!(loader.export_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_factory_is_not_cached_and_retried_every_call() {
        let loader = Arc::new(FixedLoader {
            export_calls: AtomicUsize::new(0),
            make_export: Box::new(|| ModuleExport::Direct(direct_factory(false))),
        });
        let resolver = RouteResolver::new(table(), loader.clone(), WebSocketServerHandle::new("test"));
        let resolved = resolver.resolve("/ws/echo").await.unwrap();

        assert!(resolver.handler_for(&resolved).await.is_err());
        assert!(resolver.handler_for(&resolved).await.is_err());
        assert_eq!(loader.export_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn handlers_map_without_the_conventional_key_is_handler_not_found() {
        let loader = Arc::new(FixedLoader {
            export_calls: AtomicUsize::new(0),
            make_export: Box::new(|| ModuleExport::HandlersMap(HashMap::new())),
        });
        let resolver = RouteResolver::new(table(), loader, WebSocketServerHandle::new("test"));
        let resolved = resolver.resolve("/ws/echo").await.unwrap();
        let err = resolver.handler_for(&resolved).await.unwrap_err();
        assert!(matches!(err, RuntimeError::HandlerNotFound { .. }));
    }
}
