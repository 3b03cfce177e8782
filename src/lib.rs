pub mod config;
pub mod middleware;
pub mod websocket;

use crate::config::RuntimeConfig;

/// Initializes the `tracing` subscriber according to the resolved config.
///
/// Mirrors the level/format switch the host framework applies to its own
/// request pipeline, so WebSocket runtime logs share one sink and one
/// verbosity knob with the rest of the application.
pub fn init_tracing(config: &RuntimeConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone()));

    if config.log_format == "json" {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
