use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::db::{ConversationRecord, MessageRecord, UserRecord};
use crate::errors::{ApiError, ApiResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPublic {
    pub id: String,
    pub username: String,
    pub display_name: String,
    pub created_at: String,
}

impl From<&UserRecord> for UserPublic {
    fn from(record: &UserRecord) -> Self {
        Self {
            id: record.id.clone(),
            username: record.username.clone(),
            display_name: record.display_name.clone(),
            created_at: record.created_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRead {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub client_message_id: String,
    pub seq: i64,
    pub content: String,
    pub created_at: String,
}

impl From<&MessageRecord> for MessageRead {
    fn from(record: &MessageRecord) -> Self {
        Self {
            id: record.id.clone(),
            conversation_id: record.conversation_id.clone(),
            sender_id: record.sender_id.clone(),
            client_message_id: record.client_message_id.clone(),
            seq: record.seq,
            content: record.content.clone(),
            created_at: record.created_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub updated_at: String,
    pub last_message_preview: Option<String>,
    pub last_message_at: Option<String>,
    pub member_ids: Vec<String>,
    pub members: Vec<UserPublic>,
}

impl ConversationSummary {
    pub fn from_record(record: &ConversationRecord, member_ids: Vec<String>) -> Self {
        Self {
            id: record.id.clone(),
            kind: record.kind.clone(),
            updated_at: record.updated_at.to_rfc3339(),
            last_message_preview: record.last_message_preview.clone(),
            last_message_at: record.last_message_at.map(|at| at.to_rfc3339()),
            member_ids,
            members: Vec::new(),
        }
    }
}

// --- request bodies ---

fn field_error(field: &str, message: &str) -> Value {
    json!({ "field": field, "message": message })
}

fn check_length(
    errors: &mut Vec<Value>,
    field: &str,
    value: &str,
    min: usize,
    max: usize,
) {
    let count = value.chars().count();
    if count < min || count > max {
        errors.push(field_error(
            field,
            &format!("length must be between {min} and {max}"),
        ));
    }
}

fn finish_validation(errors: Vec<Value>) -> ApiResult<()> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ApiError::validation(Value::Array(errors)))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub display_name: Option<String>,
    pub password: String,
}

fn valid_username_chars(username: &str) -> bool {
    username
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '.' | '-'))
}

impl RegisterRequest {
    pub fn validate(&self) -> ApiResult<()> {
        let mut errors = Vec::new();
        check_length(&mut errors, "username", &self.username, 3, 32);
        if !valid_username_chars(&self.username) {
            errors.push(field_error(
                "username",
                "may only contain letters, digits, '_', '.' and '-'",
            ));
        }
        if let Some(display_name) = self.display_name.as_deref() {
            check_length(&mut errors, "display_name", display_name, 1, 64);
        }
        check_length(&mut errors, "password", &self.password, 8, 128);
        finish_validation(errors)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

impl LoginRequest {
    pub fn validate(&self) -> ApiResult<()> {
        let mut errors = Vec::new();
        check_length(&mut errors, "username", &self.username, 3, 32);
        check_length(&mut errors, "password", &self.password, 8, 128);
        finish_validation(errors)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

impl RefreshRequest {
    pub fn validate(&self) -> ApiResult<()> {
        let mut errors = Vec::new();
        check_length(&mut errors, "refresh_token", &self.refresh_token, 20, 512);
        finish_validation(errors)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogoutRequest {
    pub refresh_token: String,
}

impl LogoutRequest {
    pub fn validate(&self) -> ApiResult<()> {
        let mut errors = Vec::new();
        check_length(&mut errors, "refresh_token", &self.refresh_token, 20, 512);
        finish_validation(errors)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DirectConversationCreateRequest {
    pub other_user_id: String,
}

impl DirectConversationCreateRequest {
    pub fn validate(&self) -> ApiResult<()> {
        let mut errors = Vec::new();
        check_length(&mut errors, "other_user_id", &self.other_user_id, 1, 64);
        finish_validation(errors)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendMessageRequest {
    pub client_message_id: String,
    pub content: String,
}

impl SendMessageRequest {
    pub fn validate(&self, message_max_length: usize) -> ApiResult<()> {
        let mut errors = Vec::new();
        check_length(&mut errors, "client_message_id", &self.client_message_id, 8, 64);
        check_length(&mut errors, "content", &self.content, 1, message_max_length);
        finish_validation(errors)
    }
}
