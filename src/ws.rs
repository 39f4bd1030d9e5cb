use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use futures::StreamExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::auth;
use crate::db::{self, UserRecord};
use crate::protocol::{
    self, ack_frame, error_frame, pong_frame, welcome_frame, Command, ERR_FORBIDDEN_CONVERSATION,
    ERR_INVALID_COMMAND, ERR_RATE_LIMITED,
};
use crate::realtime::{WsTransport, CLOSE_NORMAL, CLOSE_POLICY_VIOLATION};
use crate::AppState;

fn extract_access_token(headers: &HeaderMap, params: &HashMap<String, String>) -> Option<String> {
    if let Some(auth_header) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        if auth_header.len() > 7 && auth_header.as_bytes()[..7].eq_ignore_ascii_case(b"bearer ") {
            return Some(auth_header[7..].trim().to_string());
        }
    }
    params.get("access_token").cloned()
}

fn command_allowed(
    events: &mut VecDeque<Instant>,
    now: Instant,
    window: Duration,
    max_commands: usize,
) -> bool {
    while let Some(front) = events.front() {
        if now.duration_since(*front) >= window {
            events.pop_front();
        } else {
            break;
        }
    }
    if events.len() >= max_commands {
        return false;
    }
    events.push_back(now);
    true
}

fn dedupe_preserving_order(ids: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.into_iter().filter(|id| seen.insert(id.clone())).collect()
}

pub async fn ws_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let user = resolve_user(&state, &headers, &params).await;
    ws.on_upgrade(move |socket| session(state, socket, user))
}

async fn resolve_user(
    state: &AppState,
    headers: &HeaderMap,
    params: &HashMap<String, String>,
) -> Option<UserRecord> {
    let token = extract_access_token(headers, params)?;
    let claims = auth::decode_access_token(&state.config.auth, &token).ok()?;
    db::get_user(&state.pool, state.db_kind, &claims.sub)
        .await
        .ok()
        .flatten()
}

async fn close_before_welcome(mut socket: WebSocket, code: u16) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: "".into(),
        })))
        .await;
}

async fn session(state: AppState, socket: WebSocket, user: Option<UserRecord>) {
    let Some(user) = user else {
        close_before_welcome(socket, CLOSE_POLICY_VIOLATION).await;
        return;
    };

    let (sink, mut stream) = socket.split();
    let manager = state.manager.clone();
    let connection_id = manager
        .register(Box::new(WsTransport::new(sink)), &user.id)
        .await;
    manager
        .send(
            &connection_id,
            welcome_frame(&connection_id, &user.id, state.config.ws.heartbeat_sec),
        )
        .await;

    let idle_timeout = Duration::from_secs(state.config.ws.idle_timeout_sec);
    let rate_window = Duration::from_secs(state.config.ws.rate_limit_window_sec);
    let mut rate_events: VecDeque<Instant> = VecDeque::new();

    loop {
        let received = match timeout(idle_timeout, stream.next()).await {
            Err(_) => {
                debug!("websocket idle timeout connection_id={connection_id}");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(_))) => break,
            Ok(Some(Ok(message))) => message,
        };

        let raw_text = match received {
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Text(text) => text,
            Message::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    manager
                        .send(
                            &connection_id,
                            error_frame(ERR_INVALID_COMMAND, "Frame must be UTF-8 text"),
                        )
                        .await;
                    continue;
                }
            },
        };

        if !command_allowed(
            &mut rate_events,
            Instant::now(),
            rate_window,
            state.config.ws.rate_limit_max_commands,
        ) {
            manager
                .send(
                    &connection_id,
                    error_frame(ERR_RATE_LIMITED, "Command rate limit exceeded"),
                )
                .await;
            continue;
        }

        let command = match protocol::parse_command(&raw_text, state.config.ws.max_command_bytes) {
            Ok(command) => command,
            Err(err) => {
                manager
                    .send(&connection_id, error_frame(err.code, &err.message))
                    .await;
                continue;
            }
        };

        match command {
            Command::Ping { ts } => {
                manager.send(&connection_id, pong_frame(ts)).await;
            }
            Command::Subscribe { conversation_ids } => {
                handle_subscribe(&state, &connection_id, &user, conversation_ids).await;
            }
            Command::Unsubscribe { conversation_ids } => {
                let requested = dedupe_preserving_order(conversation_ids);
                if requested.is_empty() {
                    manager
                        .send(
                            &connection_id,
                            error_frame(ERR_INVALID_COMMAND, "conversation_ids is required"),
                        )
                        .await;
                    continue;
                }
                manager.unsubscribe(&connection_id, &requested).await;
                manager
                    .send(
                        &connection_id,
                        ack_frame(
                            "unsubscribe",
                            Some(serde_json::json!({ "conversation_ids": requested })),
                        ),
                    )
                    .await;
            }
        }
    }

    manager.unregister(&connection_id, Some(CLOSE_NORMAL)).await;
    info!(
        "websocket session closed connection_id={connection_id} user_id={}",
        user.id
    );
}

async fn handle_subscribe(
    state: &AppState,
    connection_id: &str,
    user: &UserRecord,
    conversation_ids: Vec<String>,
) {
    let manager = &state.manager;
    let requested = dedupe_preserving_order(conversation_ids);
    if requested.is_empty() {
        manager
            .send(
                connection_id,
                error_frame(ERR_INVALID_COMMAND, "conversation_ids is required"),
            )
            .await;
        return;
    }
    if requested.len() > state.config.ws.max_ids_per_subscribe {
        manager
            .send(
                connection_id,
                error_frame(ERR_INVALID_COMMAND, "Too many conversation ids"),
            )
            .await;
        return;
    }

    let memberships =
        match db::membership_subset(&state.pool, state.db_kind, &user.id, &requested).await {
            Ok(memberships) => memberships,
            Err(err) => {
                warn!("membership lookup failed for subscribe: {err}");
                manager
                    .send(
                        connection_id,
                        error_frame(ERR_INVALID_COMMAND, "Subscription failed"),
                    )
                    .await;
                return;
            }
        };
    if requested.iter().any(|id| !memberships.contains(id)) {
        manager
            .send(
                connection_id,
                error_frame(
                    ERR_FORBIDDEN_CONVERSATION,
                    "Not a member of one or more conversations",
                ),
            )
            .await;
        return;
    }

    if manager.subscribe(connection_id, &requested).await.is_err() {
        manager
            .send(
                connection_id,
                error_frame(ERR_INVALID_COMMAND, "Subscription limit exceeded"),
            )
            .await;
        return;
    }

    manager
        .send(
            connection_id,
            ack_frame(
                "subscribe",
                Some(serde_json::json!({ "conversation_ids": requested })),
            ),
        )
        .await;
}
