//! End-to-end admission and lifecycle scenarios (spec.md §8), run
//! against a real axum server and real WebSocket clients rather than
//! in-process unit doubles.

mod common;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

use common::TestServerOptions;

#[tokio::test]
async fn echoes_text_and_binary_messages() {
    let server = common::start(TestServerOptions::default()).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(common::ws_url(server.addr, "/ws/echo")).await.unwrap();

    ws.send(Message::Text("hello".to_string())).await.unwrap();
    assert_eq!(ws.next().await.unwrap().unwrap(), Message::Text("hello".to_string()));

    ws.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
    assert_eq!(ws.next().await.unwrap().unwrap(), Message::Binary(vec![1, 2, 3]));
}

#[tokio::test]
async fn unknown_route_is_rejected_before_the_handshake() {
    let server = common::start(TestServerOptions::default()).await;
    let result = tokio_tungstenite::connect_async(common::ws_url(server.addr, "/ws/nope")).await;
    match result {
        Ok(_) => panic!("expected the upgrade to be rejected before the handshake completed"),
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => assert_eq!(response.status().as_u16(), 404),
        Err(other) => panic!("expected an HTTP rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn reserved_internal_path_is_rejected_before_dedupe() {
    let server = common::start(TestServerOptions::default()).await;
    let result = tokio_tungstenite::connect_async(common::ws_url(server.addr, "/__ws_internal/probe")).await;
    assert!(matches!(result, Err(tokio_tungstenite::tungstenite::Error::Http(_))));
}

#[tokio::test]
async fn second_attempt_past_the_rate_limit_is_rejected() {
    let server = common::start(TestServerOptions { rate_limit_ws_limited: true, ..Default::default() }).await;

    let (_first, _) = tokio_tungstenite::connect_async(common::ws_url(server.addr, "/ws/limited")).await.unwrap();
    let second = tokio_tungstenite::connect_async(common::ws_url(server.addr, "/ws/limited")).await;
    match second {
        Ok(_) => panic!("expected the second attempt to be rate-limited"),
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => assert_eq!(response.status().as_u16(), 429),
        Err(other) => panic!("expected a 429 rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn connection_past_route_capacity_completes_the_handshake_then_closes_with_1013() {
    let server = common::start(TestServerOptions { cap_ws_capped_at_one: true, ..Default::default() }).await;

    let (mut first, _) = tokio_tungstenite::connect_async(common::ws_url(server.addr, "/ws/capped")).await.unwrap();
    let (mut second, _) = tokio_tungstenite::connect_async(common::ws_url(server.addr, "/ws/capped")).await.unwrap();

    let message = second.next().await.unwrap().unwrap();
    match message {
        Message::Close(Some(frame)) => assert_eq!(frame.code, 1013),
        other => panic!("expected a 1013 close frame, got {other:?}"),
    }

    let _ = first.close(None).await;
}

#[tokio::test]
async fn shutdown_closes_every_open_connection_with_1000() {
    let server = common::start(TestServerOptions::default()).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(common::ws_url(server.addr, "/ws/echo")).await.unwrap();

    server.orchestrator.shutdown().await;

    let message = ws.next().await.unwrap().unwrap();
    assert!(matches!(message, Message::Close(Some(frame)) if frame.code == 1000));
}
