//! A tiny broadcast chat room keyed by the `:roomId` path parameter.
//! Demonstrates a route module doing its own fan-out rather than going
//! through the runtime's pool broadcast, the way a framework user's
//! own business logic would.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use ws_runtime::websocket::resolver::CleanupFn;
use ws_runtime::websocket::{ClientSocket, ConnectionFactory, ConnectionHandlerFn};

type Rooms = Mutex<HashMap<String, Vec<Arc<ClientSocket>>>>;

fn rooms() -> &'static Rooms {
    static ROOMS: OnceLock<Rooms> = OnceLock::new();
    ROOMS.get_or_init(|| Mutex::new(HashMap::new()))
}

pub fn factory() -> ConnectionFactory {
    Arc::new(|_handle| {
        Box::pin(async move {
            let handler: ConnectionHandlerFn = Arc::new(|socket, request| {
                Box::pin(async move {
                    let room_id = request.params.get("roomId").cloned().unwrap_or_else(|| "lobby".to_string());
                    {
                        let mut rooms = rooms().lock().unwrap();
                        rooms.entry(room_id.clone()).or_default().push(socket.clone());
                    }

                    while let Some(message) = socket.recv().await {
                        if let axum::extract::ws::Message::Text(text) = message {
                            broadcast(&room_id, socket.id(), &text);
                        }
                    }

                    let cleanup_room = room_id.clone();
                    let cleanup_id = socket.id().to_string();
                    let cleanup: CleanupFn = Arc::new(move || {
                        let room_id = cleanup_room.clone();
                        let socket_id = cleanup_id.clone();
                        Box::pin(async move {
                            let mut rooms = rooms().lock().unwrap();
                            if let Some(members) = rooms.get_mut(&room_id) {
                                members.retain(|member| member.id() != socket_id.as_str());
                            }
                        })
                    });
                    Some(cleanup)
                })
            });
            Ok(handler)
        })
    })
}

fn broadcast(room_id: &str, from: &str, text: &str) {
    let rooms = rooms().lock().unwrap();
    if let Some(members) = rooms.get(room_id) {
        for member in members {
            if member.id() != from {
                member.send_text(format!("{from}: {text}"));
            }
        }
    }
}

/// Resolved at startup: one param-route entry per spec.md §4.8 "param
/// routes matched in declaration order".
pub fn route() -> (&'static str, &'static str) {
    ("/ws/rooms/:roomId", "ws/rooms/route")
}
