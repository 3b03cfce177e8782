//! Error taxonomy and recovery mapping for the WebSocket runtime (spec §4.1,
//! §7). A closed set of error kinds, each with a stable code and advisory
//! HTTP status, plus a pure mapping from error to recovery verdict that the
//! orchestrator (C10) and graceful handler (C9) consult to decide between a
//! close frame and a hard terminate.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde::Serialize;
use serde_json::json;

/// The six admission/execution error kinds the runtime can raise. Closed by
/// design — adding a new failure mode means adding a variant here, not
/// stringly-typed ad-hoc errors elsewhere.
#[derive(thiserror::Error, Debug, Clone)]
pub enum RuntimeError {
    #[error("no route matches {path}")]
    RouteNotFound { path: String },

    #[error("route {pattern} has no upgrade export")]
    HandlerNotFound { pattern: String },

    #[error("module loader failed for {module_key}: {reason}")]
    ModuleImport { module_key: String, reason: String },

    #[error("host server or route table unavailable")]
    ServerNotAvailable,

    #[error("connection pool at capacity ({current}/{max})")]
    ConnectionLimit { current: u32, max: u32 },

    #[error("handler execution failed: {reason}")]
    HandlerExecution { reason: String },
}

impl RuntimeError {
    /// The stable machine-readable code (spec §4.1 table).
    pub fn code(&self) -> &'static str {
        match self {
            RuntimeError::RouteNotFound { .. } => "ROUTE_NOT_FOUND",
            RuntimeError::HandlerNotFound { .. } => "HANDLER_NOT_FOUND",
            RuntimeError::ModuleImport { .. } => "MODULE_IMPORT_ERROR",
            RuntimeError::ServerNotAvailable => "SERVER_NOT_AVAILABLE",
            RuntimeError::ConnectionLimit { .. } => "CONNECTION_LIMIT_EXCEEDED",
            RuntimeError::HandlerExecution { .. } => "HANDLER_EXECUTION_ERROR",
        }
    }

    /// Advisory HTTP status — used only when the error surfaces before the
    /// protocol upgrade completes (the upgrade request is still a plain
    /// HTTP request at that point).
    pub fn status(&self) -> StatusCode {
        match self {
            RuntimeError::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            RuntimeError::HandlerNotFound { .. } => StatusCode::BAD_REQUEST,
            RuntimeError::ModuleImport { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            RuntimeError::ServerNotAvailable => StatusCode::SERVICE_UNAVAILABLE,
            RuntimeError::ConnectionLimit { .. } => StatusCode::TOO_MANY_REQUESTS,
            RuntimeError::HandlerExecution { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Pure, deterministic recovery verdict (spec §4.1, §7). `Retry` is
    /// reserved for a future admission-retry policy and is treated as
    /// `TerminateConnection` until one exists.
    pub fn recovery(&self) -> Recovery {
        match self {
            RuntimeError::RouteNotFound { .. }
            | RuntimeError::HandlerNotFound { .. }
            | RuntimeError::ServerNotAvailable
            | RuntimeError::ConnectionLimit { .. } => Recovery::CloseConnection,
            RuntimeError::ModuleImport { .. } | RuntimeError::HandlerExecution { .. } => {
                Recovery::TerminateConnection
            }
        }
    }

    /// The close code to send when `recovery()` yields `CloseConnection`
    /// post-handshake (spec §4.9, §6 "Close codes used").
    pub fn close_code(&self) -> u16 {
        match self {
            RuntimeError::RouteNotFound { .. } | RuntimeError::HandlerNotFound { .. } => 1002,
            RuntimeError::ConnectionLimit { .. } => 1013,
            RuntimeError::ServerNotAvailable => 1011,
            RuntimeError::ModuleImport { .. } | RuntimeError::HandlerExecution { .. } => 1011,
        }
    }
}

/// Recovery verdict a caller should act on. `Retry` is reserved (spec
/// §4.1: "treated as Terminate until implemented") and is never produced
/// by `RuntimeError::recovery` today, but is kept in the enum so callers
/// match exhaustively against the taxonomy the spec defines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    CloseConnection,
    TerminateConnection,
    Retry,
    Ignore,
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl IntoResponse for RuntimeError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        tracing::warn!(code = self.code(), "{}", self);
        (
            status,
            Json(json!(ErrorBody {
                code: self.code(),
                message: self.to_string(),
            })),
        )
            .into_response()
    }
}
