//! Layered configuration for the WebSocket runtime (spec §4.11, §6).
//!
//! Precedence, lowest to highest: built-in defaults, then a framework-
//! provided partial config (typically deserialized from the host's own
//! config file), then environment variables. Each layer is applied
//! field-by-field so that one layer can override a single value without
//! requiring every other value to also be present — a whole-struct
//! deserialize (the way the host framework loads its own settings) can't
//! express that, because a single invalid field fails the entire parse.

use std::collections::HashMap;

/// Fully-resolved runtime configuration. Immutable for the lifetime of the
/// orchestrator it is handed to (spec §5, "Shared-resource discipline").
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub enabled: bool,
    pub max_connections: u32,
    pub timeout_ms: u64,
    pub compression: bool,
    pub security: SecurityConfig,
    pub performance: PerformanceConfig,
    pub monitoring: MonitoringConfig,
    pub routes: HashMap<String, RouteOverride>,
    pub circuit_breaker: CircuitBreakerConfig,
    pub log_level: String,
    pub log_format: String,
}

#[derive(Clone, Debug)]
pub struct SecurityConfig {
    pub origins: OriginPolicy,
    pub max_payload_size: usize,
    pub validate_protocol: bool,
    pub allowed_protocols: Vec<String>,
    pub verify_client: VerifyClientPolicy,
}

/// The host framework lets `security.origins` be a list or a predicate.
/// A predicate can't survive env-override or cross a config-merge
/// boundary meaningfully, so only the list form is represented here; a
/// host wanting predicate semantics composes it before handing in the
/// partial config. See DESIGN.md.
#[derive(Clone, Debug)]
pub enum OriginPolicy {
    Any,
    AllowList(Vec<String>),
}

#[derive(Clone, Debug, Default)]
pub enum VerifyClientPolicy {
    #[default]
    Allow,
    Deny,
}

#[derive(Clone, Debug)]
pub struct PerformanceConfig {
    pub per_message_deflate: PerMessageDeflate,
    pub backlog: Option<u32>,
    pub keep_alive: KeepAliveConfig,
}

#[derive(Clone, Debug)]
pub enum PerMessageDeflate {
    Disabled,
    Enabled(DeflateOptions),
}

#[derive(Clone, Debug)]
pub struct DeflateOptions {
    pub threshold: usize,
    pub server_max_window_bits: u8,
    pub server_max_no_context_takeover: bool,
}

#[derive(Clone, Debug)]
pub struct KeepAliveConfig {
    pub enabled: bool,
    pub initial_delay_ms: u64,
    pub interval_ms: u64,
    pub probes: u32,
}

#[derive(Clone, Debug)]
pub struct MonitoringConfig {
    pub metrics: bool,
    pub detailed_logging: bool,
    pub health_check: HealthCheckConfig,
}

#[derive(Clone, Debug)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    pub path: String,
    pub interval_ms: u64,
}

#[derive(Clone, Debug, Default)]
pub struct RouteOverride {
    pub max_connections: Option<u32>,
    pub timeout_ms: Option<u64>,
    pub compression: Option<bool>,
    pub rate_limit: Option<RateLimitRule>,
}

#[derive(Clone, Debug)]
pub struct RateLimitRule {
    pub window_ms: u64,
    pub max_requests: u32,
}

#[derive(Clone, Debug)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    pub monitoring_window_ms: u64,
    pub success_threshold: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_connections: 1000,
            timeout_ms: 30_000,
            compression: true,
            security: SecurityConfig {
                origins: OriginPolicy::Any,
                max_payload_size: 1024 * 1024,
                validate_protocol: false,
                allowed_protocols: Vec::new(),
                verify_client: VerifyClientPolicy::Allow,
            },
            performance: PerformanceConfig {
                per_message_deflate: PerMessageDeflate::Enabled(DeflateOptions {
                    threshold: 1024,
                    server_max_window_bits: 15,
                    server_max_no_context_takeover: false,
                }),
                backlog: None,
                keep_alive: KeepAliveConfig {
                    enabled: true,
                    initial_delay_ms: 0,
                    interval_ms: 30_000,
                    probes: 3,
                },
            },
            monitoring: MonitoringConfig {
                metrics: true,
                detailed_logging: false,
                health_check: HealthCheckConfig {
                    enabled: true,
                    path: "/api/ws/health".to_string(),
                    interval_ms: 30_000,
                },
            },
            routes: HashMap::new(),
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: 5,
                reset_timeout_ms: 60_000,
                monitoring_window_ms: 5 * 60 * 1000,
                success_threshold: 3,
            },
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

/// A partial config as the host framework would hand it in — every field
/// optional, nested sections themselves partial. `RuntimeConfig::merge`
/// overlays only the fields that are `Some`, leaving the rest of the base
/// layer untouched.
#[derive(Clone, Debug, Default)]
pub struct FrameworkConfig {
    pub enabled: Option<bool>,
    pub max_connections: Option<u32>,
    pub timeout_ms: Option<u64>,
    pub compression: Option<bool>,
    pub security: Option<PartialSecurityConfig>,
    pub performance: Option<PartialPerformanceConfig>,
    pub monitoring: Option<PartialMonitoringConfig>,
    pub routes: HashMap<String, RouteOverride>,
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    pub log_level: Option<String>,
    pub log_format: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct PartialSecurityConfig {
    pub origins: Option<OriginPolicy>,
    pub max_payload_size: Option<usize>,
    pub validate_protocol: Option<bool>,
    pub allowed_protocols: Option<Vec<String>>,
    pub verify_client: Option<VerifyClientPolicy>,
}

#[derive(Clone, Debug, Default)]
pub struct PartialPerformanceConfig {
    pub per_message_deflate: Option<PerMessageDeflate>,
    pub backlog: Option<u32>,
    pub keep_alive: Option<KeepAliveConfig>,
}

#[derive(Clone, Debug, Default)]
pub struct PartialMonitoringConfig {
    pub metrics: Option<bool>,
    pub detailed_logging: Option<bool>,
    pub health_check: Option<HealthCheckConfig>,
}

impl RuntimeConfig {
    /// Deep-merges a framework-provided partial config over this one,
    /// without mutating either input (spec §4.11: "Deep-merges nested
    /// sections without mutating inputs").
    pub fn merge(&self, framework: &FrameworkConfig) -> Self {
        let mut out = self.clone();

        if let Some(v) = framework.enabled {
            out.enabled = v;
        }
        if let Some(v) = framework.max_connections {
            out.max_connections = v;
        }
        if let Some(v) = framework.timeout_ms {
            out.timeout_ms = v;
        }
        if let Some(v) = framework.compression {
            out.compression = v;
        }
        if let Some(ref v) = framework.log_level {
            out.log_level = v.clone();
        }
        if let Some(ref v) = framework.log_format {
            out.log_format = v.clone();
        }
        if let Some(ref v) = framework.circuit_breaker {
            out.circuit_breaker = v.clone();
        }
        if let Some(ref sec) = framework.security {
            if let Some(ref v) = sec.origins {
                out.security.origins = v.clone();
            }
            if let Some(v) = sec.max_payload_size {
                out.security.max_payload_size = v;
            }
            if let Some(v) = sec.validate_protocol {
                out.security.validate_protocol = v;
            }
            if let Some(ref v) = sec.allowed_protocols {
                out.security.allowed_protocols = v.clone();
            }
            if let Some(ref v) = sec.verify_client {
                out.security.verify_client = v.clone();
            }
        }
        if let Some(ref perf) = framework.performance {
            if let Some(ref v) = perf.per_message_deflate {
                out.performance.per_message_deflate = v.clone();
            }
            if let Some(v) = perf.backlog {
                out.performance.backlog = Some(v);
            }
            if let Some(ref v) = perf.keep_alive {
                out.performance.keep_alive = v.clone();
            }
        }
        if let Some(ref mon) = framework.monitoring {
            if let Some(v) = mon.metrics {
                out.monitoring.metrics = v;
            }
            if let Some(v) = mon.detailed_logging {
                out.monitoring.detailed_logging = v;
            }
            if let Some(ref v) = mon.health_check {
                out.monitoring.health_check = v.clone();
            }
        }
        for (pattern, rule) in framework.routes.iter() {
            out.routes.insert(pattern.clone(), rule.clone());
        }

        out
    }

    /// Applies environment-variable overrides (spec §6: "Environment
    /// overrides (precedence over file config)"). Invalid numeric or
    /// boolean tokens are discarded individually with a debug log rather
    /// than aborting the whole layer.
    pub fn apply_env(&self) -> Self {
        let mut out = self.clone();

        if let Some(v) = env_bool("WS_ENABLED") {
            out.enabled = v;
        }
        if let Some(v) = env_parse::<u32>("WS_MAX_CONNECTIONS") {
            out.max_connections = v;
        }
        if let Some(v) = env_parse::<u64>("WS_TIMEOUT_MS") {
            out.timeout_ms = v;
        }
        if let Some(v) = env_bool("WS_COMPRESSION") {
            out.compression = v;
        }
        if let Some(v) = env_parse::<usize>("WS_MAX_PAYLOAD_SIZE") {
            out.security.max_payload_size = v;
        }
        if let Some(v) = env_bool("WS_METRICS") {
            out.monitoring.metrics = v;
        }

        out
    }

    /// Loads config the way the host process actually boots: defaults,
    /// then whatever the host framework already resolved for itself
    /// (`framework`), then the environment.
    pub fn load(framework: &FrameworkConfig) -> Self {
        dotenvy::dotenv().ok();
        Self::default().merge(framework).apply_env()
    }

    /// Returns the override for `route_pattern`, if the config declares
    /// one; the orchestrator falls back to the global value for any
    /// field the override leaves unset.
    pub fn route_override(&self, route_pattern: &str) -> Option<&RouteOverride> {
        self.routes.get(route_pattern)
    }

    pub fn effective_max_connections(&self, route_pattern: &str) -> u32 {
        self.route_override(route_pattern)
            .and_then(|r| r.max_connections)
            .unwrap_or(self.max_connections)
    }

    pub fn effective_timeout_ms(&self, route_pattern: &str) -> u64 {
        self.route_override(route_pattern)
            .and_then(|r| r.timeout_ms)
            .unwrap_or(self.timeout_ms)
    }

    pub fn effective_compression(&self, route_pattern: &str) -> bool {
        self.route_override(route_pattern)
            .and_then(|r| r.compression)
            .unwrap_or(self.compression)
    }

    /// Collects human-readable validation errors. Non-empty results are
    /// logged by the caller but never abort startup — the defaults
    /// remain usable (spec §4.11).
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_connections == 0 {
            errors.push("max_connections must be > 0".to_string());
        }
        if self.timeout_ms < 1000 {
            errors.push("timeout_ms must be >= 1000".to_string());
        }
        if self.security.max_payload_size == 0 {
            errors.push("security.max_payload_size must be > 0".to_string());
        }
        if self.circuit_breaker.failure_threshold == 0 {
            errors.push("circuit_breaker.failure_threshold must be > 0".to_string());
        }
        if self.circuit_breaker.success_threshold == 0 {
            errors.push("circuit_breaker.success_threshold must be > 0".to_string());
        }
        for (pattern, rule) in self.routes.iter() {
            if let Some(0) = rule.max_connections {
                errors.push(format!("routes[{pattern}].max_connections must be > 0"));
            }
            if let Some(ref rl) = rule.rate_limit {
                if rl.max_requests == 0 {
                    errors.push(format!("routes[{pattern}].rate_limit.max_requests must be > 0"));
                }
            }
        }

        errors
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    match std::env::var(key) {
        Ok(raw) => match raw.parse::<T>() {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::debug!(key, raw, "discarding invalid environment override");
                None
            }
        },
        Err(_) => None,
    }
}

fn env_bool(key: &str) -> Option<bool> {
    match std::env::var(key) {
        Ok(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => {
                tracing::debug!(key, raw, "discarding invalid boolean environment override");
                None
            }
        },
        Err(_) => None,
    }
}
