use chrono::Utc;
use sqlx::AnyPool;
use std::collections::HashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::{self, ConversationRecord, DbKind, MemberRecord};
use crate::errors::{ApiError, ApiResult};
use crate::types::{ConversationSummary, UserPublic};
use crate::users::{self, Visibility};

/// Membership gate shared by HTTP and WS boundaries. A missing member row is
/// reported as `conversation_not_found` so non-members cannot probe for
/// conversation existence.
pub async fn require_membership(
    pool: &AnyPool,
    kind: DbKind,
    user_id: &str,
    conversation_id: &str,
) -> ApiResult<()> {
    if db::membership_exists(pool, kind, user_id, conversation_id).await? {
        return Ok(());
    }
    warn!("membership check failed user_id={user_id} conversation_id={conversation_id}");
    Err(ApiError::conversation_not_found())
}

async fn build_summaries(
    pool: &AnyPool,
    kind: DbKind,
    requester_id: &str,
    rows: &[ConversationRecord],
) -> ApiResult<Vec<ConversationSummary>> {
    let conversation_ids: Vec<String> = rows.iter().map(|row| row.id.clone()).collect();
    let member_map = db::conversation_member_ids(pool, kind, &conversation_ids).await?;

    let mut summaries: Vec<ConversationSummary> = rows
        .iter()
        .map(|row| {
            let member_ids = member_map.get(&row.id).cloned().unwrap_or_default();
            ConversationSummary::from_record(row, member_ids)
        })
        .collect();

    let user_ids: Vec<String> = users::collect_user_ids_from_conversations(&summaries)
        .into_iter()
        .collect();
    let user_rows = users::fetch_users_by_ids(
        pool,
        kind,
        requester_id,
        &user_ids,
        Visibility::ConversationScoped,
    )
    .await?;
    let users_by_id: HashMap<String, UserPublic> = user_rows
        .iter()
        .map(|row| (row.id.clone(), UserPublic::from(row)))
        .collect();
    users::attach_members(&mut summaries, &users_by_id);
    Ok(summaries)
}

pub async fn list_user_conversations(
    pool: &AnyPool,
    kind: DbKind,
    user_id: &str,
) -> ApiResult<Vec<ConversationSummary>> {
    let rows = db::list_user_conversations(pool, kind, user_id).await?;
    debug!("listed conversations user_id={user_id} count={}", rows.len());
    build_summaries(pool, kind, user_id, &rows).await
}

/// Opens the direct conversation for the unordered `(user, other)` pair,
/// creating it (with both member rows and a seq counter at 1) on first use.
pub async fn get_or_create_direct_conversation(
    pool: &AnyPool,
    kind: DbKind,
    user_id: &str,
    other_user_id: &str,
) -> ApiResult<ConversationSummary> {
    if user_id == other_user_id {
        return Err(ApiError::invalid_target(
            "Cannot create direct conversation with yourself",
        ));
    }

    if db::get_user(pool, kind, other_user_id).await?.is_none() {
        return Err(ApiError::user_not_found());
    }

    if let Some(existing) = db::find_direct_conversation(pool, kind, user_id, other_user_id).await? {
        debug!("returning existing direct conversation conversation_id={}", existing.id);
        let summaries = build_summaries(pool, kind, user_id, &[existing]).await?;
        return Ok(summaries.into_iter().next().ok_or_else(ApiError::internal)?);
    }

    let now = Utc::now();
    let conversation = ConversationRecord {
        id: Uuid::new_v4().to_string(),
        kind: "direct".to_string(),
        created_at: now,
        updated_at: now,
        last_message_preview: None,
        last_message_at: None,
    };

    let mut tx = pool.begin().await.map_err(ApiError::from)?;
    db::insert_conversation(&mut tx, kind, &conversation).await?;
    for member_id in [user_id, other_user_id] {
        db::insert_conversation_member(
            &mut tx,
            kind,
            &MemberRecord {
                conversation_id: conversation.id.clone(),
                user_id: member_id.to_string(),
                joined_at: now,
                role: "member".to_string(),
            },
        )
        .await?;
    }
    db::insert_conversation_counter(&mut tx, kind, &conversation.id, 1).await?;
    tx.commit().await.map_err(ApiError::from)?;

    info!(
        "direct conversation created conversation_id={} users={user_id},{other_user_id}",
        conversation.id
    );
    let summaries = build_summaries(pool, kind, user_id, &[conversation]).await?;
    Ok(summaries.into_iter().next().ok_or_else(ApiError::internal)?)
}
