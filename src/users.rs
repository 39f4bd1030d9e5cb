use sqlx::AnyPool;
use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::db::{self, DbKind, MessageRecord, UserRecord};
use crate::errors::ApiResult;
use crate::types::{ConversationSummary, UserPublic};

/// Which users a requester may observe. `ConversationScoped` limits the
/// result to co-members of the requester's conversations plus the requester;
/// `All` is unrestricted and reserved for internal realtime payload
/// hydration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    ConversationScoped,
    All,
}

fn normalize_ids(ids: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for id in ids {
        let trimmed = id.trim();
        if trimmed.is_empty() || !seen.insert(trimmed.to_string()) {
            continue;
        }
        out.push(trimmed.to_string());
    }
    out
}

pub async fn fetch_users_by_ids(
    pool: &AnyPool,
    kind: DbKind,
    requester_id: &str,
    ids: &[String],
    visibility: Visibility,
) -> ApiResult<Vec<UserRecord>> {
    let deduped = normalize_ids(ids);
    if deduped.is_empty() {
        return Ok(Vec::new());
    }
    let scoped_to = match visibility {
        Visibility::ConversationScoped => Some(requester_id),
        Visibility::All => None,
    };
    let rows = db::fetch_users_by_ids(pool, kind, &deduped, scoped_to).await?;
    debug!(
        "hydrated users requester_id={requester_id} requested={} returned={}",
        deduped.len(),
        rows.len()
    );
    Ok(rows)
}

pub fn collect_user_ids_from_conversations(conversations: &[ConversationSummary]) -> HashSet<String> {
    conversations
        .iter()
        .flat_map(|conversation| conversation.member_ids.iter().cloned())
        .collect()
}

pub fn collect_user_ids_from_messages(messages: &[MessageRecord]) -> HashSet<String> {
    messages
        .iter()
        .map(|message| message.sender_id.clone())
        .collect()
}

pub fn attach_members(
    conversations: &mut [ConversationSummary],
    users_by_id: &HashMap<String, UserPublic>,
) {
    for conversation in conversations {
        conversation.members = conversation
            .member_ids
            .iter()
            .filter_map(|member_id| users_by_id.get(member_id).cloned())
            .collect();
    }
}
