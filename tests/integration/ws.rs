use courier::config::{Config, DatabaseConfig, DispatcherConfig};
use courier::db::UserRecord;
use courier::{auth, conversations, create_app_with_config, messages, AppState};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

const READ_TIMEOUT: Duration = Duration::from_secs(5);

async fn setup_server() -> (AppState, SocketAddr, TempDir) {
    let temp = TempDir::new().unwrap();
    let db_path = temp.path().join("courier-test.db");
    let mut config = Config {
        database: DatabaseConfig {
            url: Some(format!("sqlite://{}?mode=rwc", db_path.display())),
            sqlite_path: String::new(),
        },
        dispatcher: DispatcherConfig {
            enabled: true,
            poll_ms: 50,
            batch_size: 100,
        },
        ..Config::default()
    };
    config.server.host = "127.0.0.1".to_string();
    config.server.port = 0;

    let (state, app) = create_app_with_config(config).await.unwrap();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service()).await.unwrap();
    });
    (state, addr, temp)
}

async fn register(state: &AppState, username: &str) -> (UserRecord, String) {
    let (user, tokens) = auth::register_user(
        &state.pool,
        state.db_kind,
        &state.config.auth,
        username,
        None,
        "correct-horse-battery",
    )
    .await
    .unwrap();
    (user, tokens.access_token)
}

async fn connect(addr: SocketAddr, token: &str) -> WsClient {
    let url = format!("ws://{addr}/v1/ws?access_token={token}");
    let (client, _response) = connect_async(url).await.unwrap();
    client
}

async fn read_frame(client: &mut WsClient) -> Value {
    loop {
        let message = timeout(READ_TIMEOUT, client.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket closed")
            .expect("socket error");
        match message {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

async fn send_json(client: &mut WsClient, value: Value) {
    client
        .send(Message::Text(value.to_string()))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_invalid_token_closed_with_policy_violation() {
    let (_state, addr, _temp) = setup_server().await;
    let url = format!("ws://{addr}/v1/ws?access_token=not-a-real-token");
    let (mut client, _response) = connect_async(url).await.unwrap();

    let message = timeout(READ_TIMEOUT, client.next())
        .await
        .expect("timed out")
        .expect("stream ended without close frame");
    match message.unwrap() {
        Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 1008),
        other => panic!("expected close frame, got {other:?}"),
    }
}

#[tokio::test]
async fn test_missing_token_closed_with_policy_violation() {
    let (_state, addr, _temp) = setup_server().await;
    let url = format!("ws://{addr}/v1/ws");
    let (mut client, _response) = connect_async(url).await.unwrap();
    let message = timeout(READ_TIMEOUT, client.next())
        .await
        .expect("timed out")
        .expect("stream ended without close frame");
    match message.unwrap() {
        Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 1008),
        other => panic!("expected close frame, got {other:?}"),
    }
}

#[tokio::test]
async fn test_welcome_ping_and_unknown_command() {
    let (state, addr, _temp) = setup_server().await;
    let (_user, token) = register(&state, "alice").await;
    let mut client = connect(addr, &token).await;

    let welcome = read_frame(&mut client).await;
    assert_eq!(welcome["type"], "connection.welcome");
    assert_eq!(welcome["protocol_version"], 1);
    assert!(welcome["connection_id"].is_string());

    send_json(&mut client, json!({"op": "ping", "ts": 7})).await;
    let pong = read_frame(&mut client).await;
    assert_eq!(pong["type"], "pong");
    assert_eq!(pong["ts"], 7);

    // Protocol errors come back as error frames and keep the session open.
    send_json(&mut client, json!({"op": "shout"})).await;
    let error = read_frame(&mut client).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["error"]["code"], "INVALID_COMMAND");

    send_json(&mut client, json!({"op": "ping"})).await;
    let pong = read_frame(&mut client).await;
    assert_eq!(pong["type"], "pong");
}

#[tokio::test]
async fn test_subscribe_requires_membership() {
    let (state, addr, _temp) = setup_server().await;
    let (alice, _alice_token) = register(&state, "alice").await;
    let (bob, _bob_token) = register(&state, "bob").await;
    let (_carol, carol_token) = register(&state, "carol").await;
    let conversation =
        conversations::get_or_create_direct_conversation(&state.pool, state.db_kind, &alice.id, &bob.id)
            .await
            .unwrap();

    let mut client = connect(addr, &carol_token).await;
    let welcome = read_frame(&mut client).await;
    assert_eq!(welcome["type"], "connection.welcome");

    send_json(
        &mut client,
        json!({"op": "subscribe", "conversation_ids": [conversation.id]}),
    )
    .await;
    let error = read_frame(&mut client).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["error"]["code"], "FORBIDDEN_CONVERSATION");
}

#[tokio::test]
async fn test_subscriber_receives_message_events() {
    let (state, addr, _temp) = setup_server().await;
    let (alice, _alice_token) = register(&state, "alice").await;
    let (bob, bob_token) = register(&state, "bob").await;
    let conversation =
        conversations::get_or_create_direct_conversation(&state.pool, state.db_kind, &alice.id, &bob.id)
            .await
            .unwrap();

    let mut client = connect(addr, &bob_token).await;
    let welcome = read_frame(&mut client).await;
    assert_eq!(welcome["type"], "connection.welcome");
    assert_eq!(welcome["user_id"], bob.id.as_str());

    send_json(
        &mut client,
        json!({"op": "subscribe", "conversation_ids": [conversation.id]}),
    )
    .await;
    let ack = read_frame(&mut client).await;
    assert_eq!(ack["type"], "ack");
    assert_eq!(ack["op"], "subscribe");
    assert_eq!(ack["ok"], true);

    messages::send_message(
        &state.pool,
        state.db_kind,
        &conversation.id,
        &alice,
        "client-msg-0001",
        "hello bob",
    )
    .await
    .unwrap();

    // The dispatcher publishes both events in seq order.
    let created = read_frame(&mut client).await;
    assert_eq!(created["type"], "message.created");
    assert_eq!(created["conversation_id"], conversation.id.as_str());
    assert_eq!(created["seq"], 1);
    assert_eq!(created["payload"]["content"], "hello bob");
    assert_eq!(created["payload"]["sender"]["username"], "alice");
    assert!(created["event_id"].is_string());

    let updated = read_frame(&mut client).await;
    assert_eq!(updated["type"], "conversation.updated");
    assert_eq!(updated["seq"], 1);
    assert_eq!(updated["payload"]["last_message_preview"], "hello bob");
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let (state, addr, _temp) = setup_server().await;
    let (alice, _alice_token) = register(&state, "alice").await;
    let (bob, bob_token) = register(&state, "bob").await;
    let conversation =
        conversations::get_or_create_direct_conversation(&state.pool, state.db_kind, &alice.id, &bob.id)
            .await
            .unwrap();

    let mut client = connect(addr, &bob_token).await;
    read_frame(&mut client).await; // welcome

    send_json(
        &mut client,
        json!({"op": "subscribe", "conversation_ids": [conversation.id]}),
    )
    .await;
    read_frame(&mut client).await; // ack

    send_json(
        &mut client,
        json!({"op": "unsubscribe", "conversation_ids": [conversation.id]}),
    )
    .await;
    let ack = read_frame(&mut client).await;
    assert_eq!(ack["op"], "unsubscribe");

    messages::send_message(
        &state.pool,
        state.db_kind,
        &conversation.id,
        &alice,
        "client-msg-0002",
        "nobody listening",
    )
    .await
    .unwrap();

    // No event frame arrives; a ping round-trip is the only traffic.
    tokio::time::sleep(Duration::from_millis(300)).await;
    send_json(&mut client, json!({"op": "ping", "ts": 1})).await;
    let frame = read_frame(&mut client).await;
    assert_eq!(frame["type"], "pong");
}

#[tokio::test]
async fn test_subscribe_id_limit() {
    let (state, addr, _temp) = setup_server().await;
    let (_alice, token) = register(&state, "alice").await;
    let mut client = connect(addr, &token).await;
    read_frame(&mut client).await; // welcome

    let ids: Vec<String> = (0..60).map(|index| format!("conv-{index}")).collect();
    send_json(&mut client, json!({"op": "subscribe", "conversation_ids": ids})).await;
    let error = read_frame(&mut client).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["error"]["code"], "INVALID_COMMAND");
    assert_eq!(error["error"]["message"], "Too many conversation ids");
}

#[tokio::test]
async fn test_empty_subscribe_rejected() {
    let (state, addr, _temp) = setup_server().await;
    let (_alice, token) = register(&state, "alice").await;
    let mut client = connect(addr, &token).await;
    read_frame(&mut client).await; // welcome

    send_json(&mut client, json!({"op": "subscribe", "conversation_ids": []})).await;
    let error = read_frame(&mut client).await;
    assert_eq!(error["error"]["code"], "INVALID_COMMAND");
    assert_eq!(error["error"]["message"], "conversation_ids is required");
}
