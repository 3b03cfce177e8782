//! Orderly close with a bounded wait, and the error-to-recovery dispatch
//! that decides between a graceful close and a hard terminate (spec
//! §4.9).
//!
//! Adapted from the teacher's `retry_timeout.rs`
//! (`RetryTimeoutManager`/`TimeoutConfig`): the exponential-backoff retry
//! machinery has no counterpart here (admission failures never retry,
//! spec §4.1), but the bounded-wait-then-force-terminate shape of
//! `TimeoutConfig` survives as `GracefulCloseOptions`.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use crate::websocket::errors::{Recovery, RuntimeError};
use crate::websocket::pool::Outbox;

use axum::extract::ws::{CloseFrame, Message};

#[derive(Debug, Clone, PartialEq)]
pub struct GracefulCloseOptions {
    pub code: u16,
    pub reason: String,
    pub timeout: Duration,
}

impl Default for GracefulCloseOptions {
    fn default() -> Self {
        Self { code: 1000, reason: String::new(), timeout: Duration::from_secs(5) }
    }
}

impl GracefulCloseOptions {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self { code, reason: reason.into(), ..Default::default() }
    }
}

/// Lets the orchestrator force a hard teardown of a connection's I/O
/// tasks, bypassing the WebSocket close handshake entirely (spec §4.9:
/// "force-terminates"). Abort handles are cheap to clone and idempotent
/// to invoke.
#[derive(Clone)]
pub struct TerminateHandle {
    tasks: Arc<Vec<tokio::task::AbortHandle>>,
    terminated: Arc<AtomicBool>,
}

impl TerminateHandle {
    pub fn new(tasks: Vec<tokio::task::AbortHandle>) -> Self {
        Self { tasks: Arc::new(tasks), terminated: Arc::new(AtomicBool::new(false)) }
    }

    pub fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in self.tasks.iter() {
            task.abort();
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

/// `closeWebSocketGracefully` (spec §4.9). Sends a close frame and arms
/// `opts.timeout`; if `closed` is not notified within that window (the
/// peer never completed the close handshake) the connection is force
/// terminated. A send failure (the outbox is already gone) terminates
/// immediately, matching "any exception during close schedules an
/// immediate terminate".
pub async fn close_websocket_gracefully(outbox: &Outbox, closed: Arc<Notify>, terminate: TerminateHandle, opts: GracefulCloseOptions) {
    if terminate.is_terminated() {
        return;
    }

    let frame = Message::Close(Some(CloseFrame { code: opts.code, reason: opts.reason.clone().into() }));
    if outbox.send(frame).is_err() {
        terminate.terminate();
        return;
    }

    if tokio::time::timeout(opts.timeout, closed.notified()).await.is_err() {
        tracing::warn!(code = opts.code, "graceful close timed out, forcing terminate");
        terminate.terminate();
    }
}

/// `closeSocketGracefully` (spec §4.9): the pre-handshake equivalent,
/// used to tear down a raw socket that never reached the WebSocket
/// protocol (e.g. an admission failure the host chooses to surface by
/// ending the connection rather than returning an HTTP error). `end`
/// performs an orderly half-close; if it does not resolve within
/// `timeout` the connection is destroyed outright.
pub async fn close_socket_gracefully<F>(end: F, timeout: Duration, terminate: impl FnOnce())
where
    F: Future<Output = ()>,
{
    if tokio::time::timeout(timeout, end).await.is_err() {
        terminate();
    }
}

/// Translates a `RuntimeError` that surfaced mid-connection into the
/// close-vs-terminate decision and a close code (spec §4.9
/// `handleConnectionError`). The error is always counted against the
/// route's breaker and the health monitor by the caller; this function
/// only decides the socket action.
pub fn connection_error_action(error: &RuntimeError) -> ConnectionErrorAction {
    match error.recovery() {
        Recovery::CloseConnection => ConnectionErrorAction::Close(GracefulCloseOptions::new(error.close_code(), error.to_string())),
        Recovery::TerminateConnection | Recovery::Retry => ConnectionErrorAction::Terminate,
        Recovery::Ignore => ConnectionErrorAction::None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionErrorAction {
    Close(GracefulCloseOptions),
    Terminate,
    None,
}

/// `executeHandlerSafely` (spec §4.9): wraps a user-handler invocation so
/// a panic is caught and re-surfaced as `HandlerExecution` instead of
/// taking the whole process down with it.
pub async fn execute_handler_safely<F, T>(fut: F) -> Result<T, RuntimeError>
where
    F: Future<Output = T>,
{
    use futures_util::FutureExt;
    std::panic::AssertUnwindSafe(fut)
        .catch_unwind()
        .await
        .map_err(|_| RuntimeError::HandlerExecution { reason: "handler panicked".to_string() })
}
