use chrono::Utc;
use sqlx::{AnyConnection, AnyPool};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::{self, ConversationRecord, DbKind, MessageRecord, UserRecord};
use crate::errors::{ApiError, ApiResult};
use crate::outbox;
use crate::types::UserPublic;

pub const PREVIEW_MAX_LENGTH: usize = 280;

// Bounded retries for engines that serialize writers through the
// (conversation_id, seq) uniqueness constraint instead of a row lock.
const WRITE_RETRY_ATTEMPTS: usize = 3;
const SEQ_ALLOC_ATTEMPTS: usize = 5;

/// Preview truncation is by Unicode code points.
pub fn preview_of(content: &str) -> String {
    content.chars().take(PREVIEW_MAX_LENGTH).collect()
}

pub async fn list_messages(
    pool: &AnyPool,
    kind: DbKind,
    conversation_id: &str,
    after_seq: i64,
    limit: i64,
) -> ApiResult<Vec<MessageRecord>> {
    debug!("listing messages conversation_id={conversation_id} after_seq={after_seq} limit={limit}");
    Ok(db::list_messages(pool, kind, conversation_id, after_seq, limit).await?)
}

pub async fn list_recent_messages(
    pool: &AnyPool,
    kind: DbKind,
    conversation_ids: &[String],
    limit: i64,
) -> ApiResult<Vec<MessageRecord>> {
    Ok(db::list_recent_messages(pool, kind, conversation_ids, limit).await?)
}

enum WriteOutcome {
    Written(MessageRecord),
    UniqueViolation,
}

fn replay_or_conflict(
    existing: MessageRecord,
    conversation_id: &str,
) -> ApiResult<(MessageRecord, bool)> {
    if existing.conversation_id == conversation_id {
        debug!(
            "idempotent send hit message_id={} client_message_id={}",
            existing.id, existing.client_message_id
        );
        return Ok((existing, false));
    }
    warn!(
        "client_message_id conflict client_message_id={} existing_conversation={} requested_conversation={conversation_id}",
        existing.client_message_id, existing.conversation_id
    );
    Err(ApiError::client_message_conflict())
}

/// Idempotent message write. Returns the persisted message and whether this
/// call created it. The message row, the conversation preview update and the
/// two realtime outbox events commit in a single transaction.
pub async fn send_message(
    pool: &AnyPool,
    kind: DbKind,
    conversation_id: &str,
    sender: &UserRecord,
    client_message_id: &str,
    content: &str,
) -> ApiResult<(MessageRecord, bool)> {
    info!(
        "send message attempt conversation_id={conversation_id} sender_id={} client_message_id={client_message_id}",
        sender.id
    );

    if let Some(existing) =
        db::find_message_by_client_id(pool, kind, &sender.id, client_message_id).await?
    {
        return replay_or_conflict(existing, conversation_id);
    }

    for _ in 0..WRITE_RETRY_ATTEMPTS {
        let outcome =
            write_once(pool, kind, conversation_id, sender, client_message_id, content).await?;
        match outcome {
            WriteOutcome::Written(message) => {
                info!(
                    "message persisted message_id={} conversation_id={conversation_id} seq={}",
                    message.id, message.seq
                );
                return Ok((message, true));
            }
            WriteOutcome::UniqueViolation => {
                warn!(
                    "unique violation on send; attempting idempotent recovery sender_id={} client_message_id={client_message_id}",
                    sender.id
                );
                if let Some(existing) =
                    db::find_message_by_client_id(pool, kind, &sender.id, client_message_id).await?
                {
                    return replay_or_conflict(existing, conversation_id);
                }
                // Seq collision with a concurrent writer; re-read the counter
                // and try again.
            }
        }
    }

    Err(ApiError::internal())
}

async fn write_once(
    pool: &AnyPool,
    kind: DbKind,
    conversation_id: &str,
    sender: &UserRecord,
    client_message_id: &str,
    content: &str,
) -> ApiResult<WriteOutcome> {
    let mut tx = pool.begin().await.map_err(ApiError::from)?;

    let conversation = db::get_conversation(&mut tx, kind, conversation_id)
        .await?
        .ok_or_else(|| {
            warn!("conversation not found for send conversation_id={conversation_id}");
            ApiError::conversation_not_found()
        })?;

    let seq = allocate_seq(&mut tx, kind, conversation_id).await?;
    debug!("allocated message sequence conversation_id={conversation_id} seq={seq}");

    let now = Utc::now();
    let message = MessageRecord {
        id: Uuid::new_v4().to_string(),
        conversation_id: conversation_id.to_string(),
        sender_id: sender.id.clone(),
        client_message_id: client_message_id.to_string(),
        seq,
        content: content.to_string(),
        created_at: now,
    };

    match db::insert_message(&mut tx, kind, &message).await {
        Ok(()) => {}
        Err(err) if db::is_unique_violation(&err) => {
            tx.rollback().await.map_err(ApiError::from)?;
            return Ok(WriteOutcome::UniqueViolation);
        }
        Err(err) => return Err(err.into()),
    }

    let preview = preview_of(content);
    db::touch_conversation_after_message(&mut tx, kind, conversation_id, now, &preview).await?;

    outbox::enqueue_message_created(&mut tx, kind, &message, &UserPublic::from(sender)).await?;
    let updated = ConversationRecord {
        updated_at: now,
        last_message_at: Some(now),
        last_message_preview: Some(preview),
        ..conversation
    };
    outbox::enqueue_conversation_updated(&mut tx, kind, &updated, seq).await?;

    match tx.commit().await {
        Ok(()) => Ok(WriteOutcome::Written(message)),
        Err(err) if db::is_unique_violation(&err) => Ok(WriteOutcome::UniqueViolation),
        Err(err) => Err(err.into()),
    }
}

/// Gap-free per-conversation sequence allocation inside the open writer
/// transaction. Postgres serializes writers on the counter row lock; engines
/// without row locks fall back to the compare-and-set plus the caller's
/// bounded retry.
async fn allocate_seq(
    conn: &mut AnyConnection,
    kind: DbKind,
    conversation_id: &str,
) -> ApiResult<i64> {
    for _ in 0..SEQ_ALLOC_ATTEMPTS {
        match db::get_counter_for_update(&mut *conn, kind, conversation_id).await? {
            Some(next_seq) => {
                if db::advance_counter(&mut *conn, kind, conversation_id, next_seq).await? {
                    return Ok(next_seq);
                }
                // Lost a compare-and-set race; re-read.
            }
            None => {
                // Counter row missing: first write on a conversation created
                // before counters were seeded.
                match db::insert_conversation_counter(&mut *conn, kind, conversation_id, 2).await {
                    Ok(()) => {
                        debug!("conversation counter initialized conversation_id={conversation_id}");
                        return Ok(1);
                    }
                    Err(err) => {
                        let concurrent_create = err
                            .downcast_ref::<sqlx::Error>()
                            .map(db::is_unique_violation)
                            .unwrap_or(false);
                        if !concurrent_create {
                            return Err(err.into());
                        }
                    }
                }
            }
        }
    }
    Err(ApiError::internal())
}
