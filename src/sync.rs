use serde_json::{json, Value};
use sqlx::AnyPool;
use std::collections::HashMap;
use tracing::{debug, info};

use crate::conversations;
use crate::db::{DbKind, UserRecord};
use crate::errors::{ApiError, ApiResult};
use crate::messages;
use crate::types::{MessageRead, UserPublic};
use crate::users::{self, Visibility};

const BOOTSTRAP_RECENT_MESSAGES_LIMIT: i64 = 200;
const CHANGES_PER_CONVERSATION_LIMIT: i64 = 100;

/// Accepts either a JSON object (`{"c1": 4}`) or the compact `id:seq,id:seq`
/// form. Missing conversations default to a floor of 0.
pub fn parse_after_seq_by_conversation(raw: Option<&str>) -> ApiResult<HashMap<String, i64>> {
    let Some(raw) = raw.filter(|raw| !raw.is_empty()) else {
        return Ok(HashMap::new());
    };

    match serde_json::from_str::<Value>(raw) {
        Ok(decoded) => {
            let object = decoded.as_object().ok_or_else(|| {
                ApiError::invalid_after_seq().with_details(json!({"reason": "must be an object"}))
            })?;
            let mut result = HashMap::new();
            for (conversation_id, seq) in object {
                let seq = seq.as_i64().filter(|seq| *seq >= 0).ok_or_else(|| {
                    ApiError::invalid_after_seq()
                        .with_details(json!({"reason": "seq must be a non-negative integer"}))
                })?;
                result.insert(conversation_id.clone(), seq);
            }
            debug!("parsed after_seq_by_conversation json entries={}", result.len());
            Ok(result)
        }
        // Not JSON: fall through to the compact form.
        Err(_) => {
            let mut result = HashMap::new();
            for pair in raw.split(',') {
                if pair.trim().is_empty() {
                    continue;
                }
                let Some((conversation_id, seq_text)) = pair.split_once(':') else {
                    return Err(ApiError::invalid_after_seq());
                };
                let conversation_id = conversation_id.trim();
                let seq_text = seq_text.trim();
                if conversation_id.is_empty() {
                    return Err(ApiError::invalid_after_seq());
                }
                let Ok(seq) = seq_text.parse::<i64>() else {
                    return Err(ApiError::invalid_after_seq());
                };
                if seq < 0 {
                    return Err(ApiError::invalid_after_seq());
                }
                result.insert(conversation_id.to_string(), seq);
            }
            debug!("parsed after_seq_by_conversation compact entries={}", result.len());
            Ok(result)
        }
    }
}

async fn hydrate_users(
    pool: &AnyPool,
    kind: DbKind,
    requester: &UserRecord,
    conversations: &[crate::types::ConversationSummary],
    senders: impl IntoIterator<Item = String>,
) -> ApiResult<Vec<UserPublic>> {
    let mut referenced = users::collect_user_ids_from_conversations(conversations);
    referenced.extend(senders);
    referenced.insert(requester.id.clone());
    let mut referenced: Vec<String> = referenced.into_iter().collect();
    referenced.sort();

    let rows = users::fetch_users_by_ids(
        pool,
        kind,
        &requester.id,
        &referenced,
        Visibility::ConversationScoped,
    )
    .await?;
    Ok(rows.iter().map(UserPublic::from).collect())
}

/// Consistent snapshot for a reconnecting client: the requester, their
/// conversations with members hydrated, the most recent messages across
/// those conversations, and every referenced user.
pub async fn bootstrap(pool: &AnyPool, kind: DbKind, requester: &UserRecord) -> ApiResult<Value> {
    info!("sync bootstrap requested user_id={}", requester.id);
    let summaries = conversations::list_user_conversations(pool, kind, &requester.id).await?;
    let conversation_ids: Vec<String> = summaries.iter().map(|summary| summary.id.clone()).collect();
    let recent = messages::list_recent_messages(
        pool,
        kind,
        &conversation_ids,
        BOOTSTRAP_RECENT_MESSAGES_LIMIT,
    )
    .await?;

    let user_payloads = hydrate_users(
        pool,
        kind,
        requester,
        &summaries,
        users::collect_user_ids_from_messages(&recent),
    )
    .await?;

    let recent_payloads: Vec<MessageRead> = recent.iter().map(MessageRead::from).collect();
    debug!(
        "sync bootstrap payload user_id={} conversations={} recent_messages={}",
        requester.id,
        summaries.len(),
        recent_payloads.len()
    );
    Ok(json!({
        "me": UserPublic::from(requester),
        "users": user_payloads,
        "conversations": summaries,
        "recent_messages": recent_payloads,
    }))
}

/// Incremental catch-up: per membership, every message above the caller's
/// floor, plus refreshed conversation summaries and referenced users.
pub async fn changes(
    pool: &AnyPool,
    kind: DbKind,
    requester: &UserRecord,
    after_seq_by_conversation: &HashMap<String, i64>,
) -> ApiResult<Value> {
    info!("sync changes requested user_id={}", requester.id);
    let summaries = conversations::list_user_conversations(pool, kind, &requester.id).await?;

    let mut changed: Vec<MessageRead> = Vec::new();
    let mut sender_ids: Vec<String> = Vec::new();
    for summary in &summaries {
        let after_seq = after_seq_by_conversation.get(&summary.id).copied().unwrap_or(0);
        let rows = messages::list_messages(
            pool,
            kind,
            &summary.id,
            after_seq,
            CHANGES_PER_CONVERSATION_LIMIT,
        )
        .await?;
        sender_ids.extend(rows.iter().map(|row| row.sender_id.clone()));
        changed.extend(rows.iter().map(MessageRead::from));
    }

    let user_payloads = hydrate_users(pool, kind, requester, &summaries, sender_ids).await?;
    debug!(
        "sync changes response user_id={} conversations={} messages={} users={}",
        requester.id,
        summaries.len(),
        changed.len(),
        user_payloads.len()
    );
    Ok(json!({
        "conversations": summaries,
        "messages": changed,
        "users": user_payloads,
    }))
}
