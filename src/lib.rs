pub mod auth;
pub mod config;
pub mod conversations;
pub mod db;
pub mod errors;
pub mod messages;
pub mod outbox;
pub mod protocol;
pub mod realtime;
pub mod sync;
pub mod types;
pub mod users;
pub mod ws;

pub use config::Config;

use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde_json::{json, Value};
use sqlx::AnyPool;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

use crate::auth::AuthRateLimiter;
use crate::config::{load_config, resolve_database_url};
use crate::db::{DbKind, UserRecord};
use crate::errors::{success, success_with_status, ApiError, ApiResult};
use crate::realtime::{ConnectionManager, RealtimePublisher};
use crate::types::{
    DirectConversationCreateRequest, LoginRequest, LogoutRequest, MessageRead, RefreshRequest,
    RegisterRequest, SendMessageRequest, TokenPair, UserPublic,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub pool: AnyPool,
    pub db_kind: DbKind,
    pub manager: Arc<ConnectionManager>,
    pub auth_limiter: Arc<AuthRateLimiter>,
    pub dispatcher_shutdown: Arc<watch::Sender<bool>>,
}

#[derive(Clone)]
pub struct CurrentUser(pub UserRecord);

pub async fn create_app() -> anyhow::Result<(AppState, Router)> {
    create_app_with_config(load_config()).await
}

static INSTALL_DRIVERS: std::sync::Once = std::sync::Once::new();

pub async fn create_app_with_config(config: Config) -> anyhow::Result<(AppState, Router)> {
    INSTALL_DRIVERS.call_once(sqlx::any::install_default_drivers);

    let db_url = resolve_database_url(&config);
    let db_kind = db::db_kind_from_url(&db_url);
    let pool = AnyPool::connect(&db_url).await?;
    db::init_db(&pool, db_kind).await?;

    let manager = Arc::new(ConnectionManager::new(
        config.ws.max_subscriptions_per_connection,
    ));
    let auth_limiter = Arc::new(AuthRateLimiter::new(
        config.auth.rate_limit_window_seconds,
        config.auth.rate_limit_max_requests,
    ));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let state = AppState {
        config: config.clone(),
        pool: pool.clone(),
        db_kind,
        manager: manager.clone(),
        auth_limiter,
        dispatcher_shutdown: Arc::new(shutdown_tx),
    };

    if config.dispatcher.enabled {
        let publisher = Arc::new(RealtimePublisher::new(manager));
        let dispatcher = outbox::OutboxDispatcher::new(
            pool,
            db_kind,
            publisher,
            config.dispatcher.poll_ms,
            config.dispatcher.batch_size,
        );
        tokio::spawn(dispatcher.run(shutdown_rx));
    }

    let authed_routes = Router::new()
        .route("/v1/users/me", get(me))
        .route("/v1/users/search", get(users_search))
        .route("/v1/conversations", get(conversations_list))
        .route("/v1/conversations/direct", post(conversations_direct))
        .route(
            "/v1/conversations/:conversation_id/messages",
            get(messages_list).post(messages_send),
        )
        .route("/v1/sync/bootstrap", get(sync_bootstrap))
        .route("/v1/sync/changes", get(sync_changes))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let public_routes = Router::new()
        .route("/health", get(health))
        .route("/v1/auth/register", post(auth_register))
        .route("/v1/auth/login", post(auth_login))
        .route("/v1/auth/refresh", post(auth_refresh))
        .route("/v1/auth/logout", post(auth_logout))
        .route("/v1/ws", get(ws::ws_handler));

    let mut app = Router::new()
        .merge(authed_routes)
        .merge(public_routes)
        .with_state(state.clone());

    let origins: Vec<HeaderValue> = config
        .server
        .cors_origins
        .iter()
        .filter_map(|origin| origin.parse::<HeaderValue>().ok())
        .collect();
    if !origins.is_empty() {
        let cors = tower_http::cors::CorsLayer::new()
            .allow_origin(tower_http::cors::AllowOrigin::list(origins))
            .allow_methods(tower_http::cors::Any)
            .allow_headers(tower_http::cors::Any);
        app = app.layer(cors);
    }

    Ok((state, app))
}

fn bearer_token(headers: &HeaderMap) -> ApiResult<String> {
    let header = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .ok_or_else(ApiError::invalid_token)?;
    if header.len() <= 7 || !header.as_bytes()[..7].eq_ignore_ascii_case(b"bearer ") {
        return Err(ApiError::invalid_token());
    }
    Ok(header[7..].trim().to_string())
}

async fn resolve_current_user(state: &AppState, headers: &HeaderMap) -> ApiResult<UserRecord> {
    let token = bearer_token(headers)?;
    let claims = auth::decode_access_token(&state.config.auth, &token)?;
    let user = db::get_user(&state.pool, state.db_kind, &claims.sub).await?;
    user.ok_or_else(|| {
        ApiError::new(
            StatusCode::UNAUTHORIZED,
            "invalid_token",
            "Token user was not found",
        )
    })
}

async fn require_auth(
    State(state): State<AppState>,
    mut req: axum::extract::Request,
    next: Next,
) -> Response {
    match resolve_current_user(&state, req.headers()).await {
        Ok(user) => {
            req.extensions_mut().insert(CurrentUser(user));
            next.run(req).await
        }
        Err(err) => err.into_response(),
    }
}

fn parse_body<T: serde::de::DeserializeOwned>(body: Result<Json<Value>, JsonRejection>) -> ApiResult<T> {
    let Json(body) = body
        .map_err(|rejection| ApiError::validation(json!([{ "message": rejection.body_text() }])))?;
    serde_json::from_value(body)
        .map_err(|err| ApiError::validation(json!([{ "message": err.to_string() }])))
}

fn client_ip(addr: &Option<ConnectInfo<SocketAddr>>) -> String {
    addr.as_ref()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn enforce_auth_rate_limit(state: &AppState, ip: &str, path: &str) -> ApiResult<()> {
    let key = format!("{ip}:{path}");
    debug!("rate limit check key={key}");
    if !state.auth_limiter.hit(&key) {
        return Err(ApiError::rate_limited());
    }
    Ok(())
}

fn auth_response(user: &UserRecord, tokens: &TokenPair) -> Value {
    json!({
        "user": UserPublic::from(user),
        "tokens": tokens,
    })
}

async fn health() -> impl IntoResponse {
    success(json!({ "ok": true }))
}

async fn auth_register(
    State(state): State<AppState>,
    addr: Option<ConnectInfo<SocketAddr>>,
    body: Result<Json<Value>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    enforce_auth_rate_limit(&state, &client_ip(&addr), "/v1/auth/register")?;
    let req: RegisterRequest = parse_body(body)?;
    req.validate()?;
    let (user, tokens) = auth::register_user(
        &state.pool,
        state.db_kind,
        &state.config.auth,
        &req.username,
        req.display_name.as_deref(),
        &req.password,
    )
    .await?;
    Ok(success_with_status(
        StatusCode::CREATED,
        auth_response(&user, &tokens),
    ))
}

async fn auth_login(
    State(state): State<AppState>,
    addr: Option<ConnectInfo<SocketAddr>>,
    body: Result<Json<Value>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    enforce_auth_rate_limit(&state, &client_ip(&addr), "/v1/auth/login")?;
    let req: LoginRequest = parse_body(body)?;
    req.validate()?;
    let (user, tokens) = auth::authenticate_user(
        &state.pool,
        state.db_kind,
        &state.config.auth,
        &req.username,
        &req.password,
    )
    .await?;
    Ok(success(auth_response(&user, &tokens)))
}

async fn auth_refresh(
    State(state): State<AppState>,
    addr: Option<ConnectInfo<SocketAddr>>,
    body: Result<Json<Value>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    enforce_auth_rate_limit(&state, &client_ip(&addr), "/v1/auth/refresh")?;
    let req: RefreshRequest = parse_body(body)?;
    req.validate()?;
    let (user, tokens) = auth::rotate_refresh_token(
        &state.pool,
        state.db_kind,
        &state.config.auth,
        &req.refresh_token,
    )
    .await?;
    Ok(success(auth_response(&user, &tokens)))
}

async fn auth_logout(
    State(state): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let req: LogoutRequest = parse_body(body)?;
    req.validate()?;
    auth::revoke_refresh_token(&state.pool, state.db_kind, &req.refresh_token).await?;
    Ok(success(json!({ "ok": true })))
}

async fn me(Extension(CurrentUser(user)): Extension<CurrentUser>) -> ApiResult<Json<Value>> {
    Ok(success(serde_json::to_value(UserPublic::from(&user)).map_err(anyhow::Error::from)?))
}

async fn users_search(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Json<Value>> {
    let query = params.get("query").cloned().unwrap_or_default();
    let query_len = query.chars().count();
    if query_len < 1 || query_len > 64 {
        return Err(ApiError::validation(json!([
            { "field": "query", "message": "length must be between 1 and 64" }
        ])));
    }
    let limit = match params.get("limit") {
        Some(raw) => raw.parse::<i64>().ok().filter(|limit| (1..=50).contains(limit)),
        None => Some(20),
    }
    .ok_or_else(|| {
        ApiError::validation(json!([
            { "field": "limit", "message": "must be an integer between 1 and 50" }
        ]))
    })?;

    let rows = db::search_users(&state.pool, state.db_kind, &user.id, &query, limit).await?;
    let payload: Vec<UserPublic> = rows.iter().map(UserPublic::from).collect();
    Ok(success(json!({ "users": payload })))
}

async fn conversations_list(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> ApiResult<Json<Value>> {
    let summaries =
        conversations::list_user_conversations(&state.pool, state.db_kind, &user.id).await?;
    Ok(success(serde_json::to_value(summaries).map_err(anyhow::Error::from)?))
}

async fn conversations_direct(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    body: Result<Json<Value>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let req: DirectConversationCreateRequest = parse_body(body)?;
    req.validate()?;
    let summary = conversations::get_or_create_direct_conversation(
        &state.pool,
        state.db_kind,
        &user.id,
        &req.other_user_id,
    )
    .await?;
    Ok(success(serde_json::to_value(summary).map_err(anyhow::Error::from)?))
}

fn parse_bounded_i64(
    params: &HashMap<String, String>,
    name: &str,
    default: i64,
    min: i64,
    max: i64,
) -> ApiResult<i64> {
    match params.get(name) {
        None => Ok(default),
        Some(raw) => raw
            .parse::<i64>()
            .ok()
            .filter(|value| (min..=max).contains(value))
            .ok_or_else(|| {
                ApiError::validation(json!([
                    { "field": name, "message": format!("must be an integer between {min} and {max}") }
                ]))
            }),
    }
}

async fn messages_list(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(conversation_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Json<Value>> {
    let after_seq = parse_bounded_i64(&params, "after_seq", 0, 0, i64::MAX)?;
    let limit = parse_bounded_i64(&params, "limit", 50, 1, 100)?;

    conversations::require_membership(&state.pool, state.db_kind, &user.id, &conversation_id)
        .await?;
    let rows = messages::list_messages(
        &state.pool,
        state.db_kind,
        &conversation_id,
        after_seq,
        limit,
    )
    .await?;
    let payload: Vec<MessageRead> = rows.iter().map(MessageRead::from).collect();
    Ok(success(json!({ "messages": payload })))
}

async fn messages_send(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(conversation_id): Path<String>,
    body: Result<Json<Value>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let req: SendMessageRequest = parse_body(body)?;
    req.validate(state.config.messaging.message_max_length)?;

    conversations::require_membership(&state.pool, state.db_kind, &user.id, &conversation_id)
        .await?;
    let (message, created) = messages::send_message(
        &state.pool,
        state.db_kind,
        &conversation_id,
        &user,
        &req.client_message_id,
        &req.content,
    )
    .await?;

    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok(success_with_status(
        status,
        serde_json::to_value(MessageRead::from(&message)).map_err(anyhow::Error::from)?,
    ))
}

async fn sync_bootstrap(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> ApiResult<Json<Value>> {
    let payload = sync::bootstrap(&state.pool, state.db_kind, &user).await?;
    Ok(success(payload))
}

async fn sync_changes(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Json<Value>> {
    let after_map =
        sync::parse_after_seq_by_conversation(params.get("after_seq_by_conversation").map(String::as_str))?;
    let payload = sync::changes(&state.pool, state.db_kind, &user, &after_map).await?;
    Ok(success(payload))
}
