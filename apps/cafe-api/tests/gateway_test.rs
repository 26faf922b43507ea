mod common;

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::time;
use tokio_tungstenite::tungstenite;

use cafe_api::auth::tokens::{self, WsTicketData};
use cafe_api::gateway::fanout::spawn_relay;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Start a real TCP server with the pub/sub relay running.
async fn start_ws_server() -> (SocketAddr, common::TestApp) {
    let app = common::test_app();
    spawn_relay(app.state.kv.clone(), app.state.broadcast.clone());
    let router = app.router();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    // Let the relay subscribe before anything is published.
    time::sleep(Duration::from_millis(50)).await;
    (addr, app)
}

async fn ticket_for(app: &common::TestApp, user_id: &str, username: &str) -> String {
    tokens::issue_ws_ticket(
        app.state.kv.as_ref(),
        &WsTicketData {
            user_id: user_id.to_string(),
            username: username.to_string(),
        },
    )
    .await
    .expect("issue ticket")
}

async fn send_json(ws: &mut WsStream, value: serde_json::Value) {
    ws.send(tungstenite::Message::Text(value.to_string().into()))
        .await
        .expect("ws send");
}

/// Read frames until an event of `kind` arrives, skipping everything else.
async fn next_event(ws: &mut WsStream, kind: &str) -> serde_json::Value {
    time::timeout(Duration::from_secs(5), async {
        loop {
            let msg = ws.next().await.expect("stream ended").expect("ws read");
            if let tungstenite::Message::Text(text) = msg {
                let event: serde_json::Value = serde_json::from_str(&text).expect("json event");
                if event["type"] == kind {
                    return event;
                }
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {kind}"))
}

async fn connect_and_identify(addr: SocketAddr, ticket: &str) -> WsStream {
    let url = format!("ws://{addr}/gateway");
    let (mut ws, _) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("ws connect");
    send_json(&mut ws, serde_json::json!({ "type": "identify", "ticket": ticket })).await;
    let ready = next_event(&mut ws, "ready").await;
    assert!(ready["userId"].is_string());
    ws
}

async fn join(ws: &mut WsStream, cafe_id: &str) -> serde_json::Value {
    send_json(
        ws,
        serde_json::json!({ "type": "join-room", "cafeId": cafe_id, "inCafe": true }),
    )
    .await;
    next_event(ws, "room-joined").await
}

#[tokio::test]
async fn identify_returns_ready() {
    let (addr, app) = start_ws_server().await;
    let ticket = ticket_for(&app, "usr_a", "alice").await;

    let url = format!("ws://{addr}/gateway");
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    send_json(&mut ws, serde_json::json!({ "type": "identify", "ticket": ticket })).await;

    let ready = next_event(&mut ws, "ready").await;
    assert_eq!(ready["userId"], "usr_a");
    assert_eq!(ready["username"], "alice");
}

#[tokio::test]
async fn invalid_ticket_closes_the_socket() {
    let (addr, _app) = start_ws_server().await;

    let url = format!("ws://{addr}/gateway");
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    send_json(&mut ws, serde_json::json!({ "type": "identify", "ticket": "wst_bogus" })).await;

    let msg = time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("close within timeout");
    match msg {
        Some(Ok(tungstenite::Message::Close(Some(frame)))) => {
            assert_eq!(u16::from(frame.code), 4004);
        }
        other => panic!("expected close frame, got {other:?}"),
    }
}

#[tokio::test]
async fn ticket_cannot_be_reused() {
    let (addr, app) = start_ws_server().await;
    let ticket = ticket_for(&app, "usr_a", "alice").await;
    let _first = connect_and_identify(addr, &ticket).await;

    let url = format!("ws://{addr}/gateway");
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    send_json(&mut ws, serde_json::json!({ "type": "identify", "ticket": ticket })).await;
    let msg = time::timeout(Duration::from_secs(5), ws.next()).await.unwrap();
    assert!(matches!(msg, Some(Ok(tungstenite::Message::Close(_)))));
}

#[tokio::test]
async fn join_room_returns_history_and_session() {
    let (addr, app) = start_ws_server().await;
    let earlier = app.join("usr_b", "cafe_1", true).await;
    app.state
        .chat
        .send_message(&earlier, "first one here")
        .await
        .unwrap();

    let ticket = ticket_for(&app, "usr_a", "alice").await;
    let mut ws = connect_and_identify(addr, &ticket).await;
    let joined = join(&mut ws, "cafe_1").await;

    assert_eq!(joined["cafeId"], "cafe_1");
    assert!(joined["sessionId"].is_string());
    let history = joined["history"].as_array().unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0]["content"], "first one here");
}

#[tokio::test]
async fn message_reaches_other_members() {
    let (addr, app) = start_ws_server().await;

    let mut alice = connect_and_identify(addr, &ticket_for(&app, "usr_a", "alice").await).await;
    let mut bob = connect_and_identify(addr, &ticket_for(&app, "usr_b", "bob").await).await;
    join(&mut alice, "cafe_1").await;
    join(&mut bob, "cafe_1").await;

    send_json(
        &mut alice,
        serde_json::json!({ "type": "send-message", "cafeId": "cafe_1", "content": "hi bob" }),
    )
    .await;

    let event = next_event(&mut bob, "message-new").await;
    assert_eq!(event["message"]["content"], "hi bob");
    assert_eq!(event["message"]["userId"], "usr_a");

    // The sender sees its own message through the room as well.
    let echo = next_event(&mut alice, "message-new").await;
    assert_eq!(echo["message"]["content"], "hi bob");
}

#[tokio::test]
async fn muted_user_gets_an_error_event() {
    let (addr, app) = start_ws_server().await;
    let mut ws = connect_and_identify(addr, &ticket_for(&app, "usr_a", "alice").await).await;
    join(&mut ws, "cafe_1").await;

    app.state
        .chat
        .moderator
        .record_mute("cafe_1", "usr_a", 10, Some("cool off".into()))
        .await
        .unwrap();

    send_json(
        &mut ws,
        serde_json::json!({ "type": "send-message", "cafeId": "cafe_1", "content": "let me talk" }),
    )
    .await;
    let error = next_event(&mut ws, "error").await;
    assert_eq!(error["code"], "MUTED");
}

#[tokio::test]
async fn unknown_command_is_reported_not_fatal() {
    let (addr, app) = start_ws_server().await;
    let mut ws = connect_and_identify(addr, &ticket_for(&app, "usr_a", "alice").await).await;

    send_json(&mut ws, serde_json::json!({ "type": "dance" })).await;
    let error = next_event(&mut ws, "error").await;
    assert_eq!(error["code"], "INVALID_COMMAND");

    send_json(&mut ws, serde_json::json!({ "type": "heartbeat" })).await;
    next_event(&mut ws, "heartbeat-ack").await;
}

#[tokio::test]
async fn disconnect_leaves_the_room() {
    let (addr, app) = start_ws_server().await;
    let mut ws = connect_and_identify(addr, &ticket_for(&app, "usr_a", "alice").await).await;
    join(&mut ws, "cafe_1").await;
    assert_eq!(app.state.chat.presence.presence_summary("cafe_1").await.total, 1);

    ws.close(None).await.unwrap();
    drop(ws);

    let mut total = 1;
    for _ in 0..50 {
        time::sleep(Duration::from_millis(20)).await;
        total = app.state.chat.presence.presence_summary("cafe_1").await.total;
        if total == 0 {
            break;
        }
    }
    assert_eq!(total, 0);
}

#[tokio::test]
async fn any_frame_keeps_the_session_alive() {
    let (addr, app) = start_ws_server().await;
    let mut ws = connect_and_identify(addr, &ticket_for(&app, "usr_a", "alice").await).await;
    join(&mut ws, "cafe_1").await;

    app.clock.advance(chrono::Duration::minutes(20));
    send_json(
        &mut ws,
        serde_json::json!({ "type": "send-message", "cafeId": "cafe_1", "content": "still around" }),
    )
    .await;
    next_event(&mut ws, "message-new").await;

    app.clock.advance(chrono::Duration::minutes(20));
    assert_eq!(app.state.chat.presence.presence_summary("cafe_1").await.total, 1);
}

#[tokio::test]
async fn frame_after_session_lapse_asks_to_rejoin() {
    let (addr, app) = start_ws_server().await;
    let mut ws = connect_and_identify(addr, &ticket_for(&app, "usr_a", "alice").await).await;
    join(&mut ws, "cafe_1").await;

    app.clock.advance(chrono::Duration::minutes(31));
    send_json(
        &mut ws,
        serde_json::json!({ "type": "start-typing", "cafeId": "cafe_1" }),
    )
    .await;
    // The typing command itself is refused too, since the room was dropped.
    let mut codes = Vec::new();
    for _ in 0..2 {
        codes.push(next_event(&mut ws, "error").await["code"].clone());
    }
    assert!(codes.iter().any(|code| code == "SESSION_EXPIRED"), "{codes:?}");
    assert_eq!(app.state.chat.presence.presence_summary("cafe_1").await.total, 0);
}
