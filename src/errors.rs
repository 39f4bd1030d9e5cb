use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use tracing::error;

/// Domain error carried through the service layer and rendered as the
/// `{"error":{"code","message","details?"}}` envelope at the HTTP boundary.
#[derive(Debug, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub details: Option<Value>,
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn invalid_token() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "invalid_token",
            "Invalid or expired access token",
        )
    }

    pub fn invalid_credentials() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "invalid_credentials",
            "Invalid username or password",
        )
    }

    pub fn invalid_refresh_token() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "invalid_refresh_token",
            "Refresh token is invalid or expired",
        )
    }

    pub fn username_taken() -> Self {
        Self::new(
            StatusCode::CONFLICT,
            "username_taken",
            "Username is already in use",
        )
    }

    pub fn client_message_conflict() -> Self {
        Self::new(
            StatusCode::CONFLICT,
            "client_message_conflict",
            "client_message_id already used for a different conversation",
        )
    }

    pub fn conversation_not_found() -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            "conversation_not_found",
            "Conversation not found",
        )
    }

    pub fn user_not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "user_not_found", "User not found")
    }

    pub fn invalid_target(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_target", message)
    }

    pub fn validation(details: Value) -> Self {
        Self::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            "validation_error",
            "Request validation failed",
        )
        .with_details(details)
    }

    pub fn invalid_after_seq() -> Self {
        Self::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            "invalid_after_seq",
            "Invalid after_seq_by_conversation format",
        )
    }

    pub fn rate_limited() -> Self {
        Self::new(
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limited",
            "Too many requests",
        )
    }

    pub fn internal() -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "Internal server error",
        )
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        error!("database error: {err}");
        Self::internal()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        error!("internal error: {err:?}");
        Self::internal()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut error_payload = json!({
            "code": self.code,
            "message": self.message,
        });
        if let Some(details) = self.details {
            error_payload["details"] = details;
        }
        (self.status, Json(json!({ "error": error_payload }))).into_response()
    }
}

/// Success envelope: `{"data": …}`.
pub fn success(data: Value) -> Json<Value> {
    Json(json!({ "data": data }))
}

pub fn success_with_status(status: StatusCode, data: Value) -> (StatusCode, Json<Value>) {
    (status, success(data))
}
