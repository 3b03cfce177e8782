//! WebSocket runtime: upgrade admission, connection lifecycle, and the
//! supporting singletons (circuit breakers, rate limiting, pooling,
//! memory and health monitoring) a host framework wires in front of its
//! route modules.

pub mod circuit_breaker;
pub mod errors;
pub mod graceful;
pub mod health;
pub mod memory;
pub mod orchestrator;
pub mod pool;
pub mod rate_limiter;
pub mod resolver;
pub mod tracker;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerRegistry, CircuitState};
pub use errors::{Recovery, RuntimeError};
pub use graceful::{ConnectionErrorAction, GracefulCloseOptions, TerminateHandle};
pub use health::{HealthMonitor, HealthState};
pub use memory::{MemoryManager, MemoryThresholds};
pub use orchestrator::{
    no_rate_limit, upgrade_handler, AdmissionOutcome, ClientSocket, ConnectionFactory, ConnectionHandlerFn, RouteRuntimeConfig, UpgradeOrchestrator,
    UpgradeRequest,
};
pub use pool::ConnectionPool;
pub use rate_limiter::RateLimiter;
pub use resolver::{ModuleExport, ModuleLoader, ResolvedRoute, RouteEntry, RouteResolver, RouteTable};
pub use tracker::ConnectionTracker;
