//! A single-connection echo route: every inbound text or binary frame
//! is written straight back to the sender. Stands in for the
//! framework's filesystem-discovered `ws/echo/route.ts`-style module
//! (spec.md §6 "Module contract").

use std::sync::Arc;

use ws_runtime::websocket::{ConnectionFactory, ConnectionHandlerFn};

pub fn factory() -> ConnectionFactory {
    Arc::new(|_handle| {
        Box::pin(async move {
            let handler: ConnectionHandlerFn = Arc::new(|socket, _request| {
                Box::pin(async move {
                    while let Some(message) = socket.recv().await {
                        match message {
                            axum::extract::ws::Message::Text(text) => {
                                socket.send_text(text);
                            }
                            axum::extract::ws::Message::Binary(bytes) => {
                                socket.send_binary(bytes);
                            }
                            _ => {}
                        }
                    }
                    None
                })
            });
            Ok(handler)
        })
    })
}

/// Resolved at startup: `/ws/echo` never carries path parameters.
pub fn route() -> (&'static str, &'static str) {
    ("/ws/echo", "ws/echo/route")
}
