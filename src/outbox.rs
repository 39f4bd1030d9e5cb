use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use sqlx::{AnyConnection, AnyPool};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::{self, ConversationRecord, DbKind, MessageRecord, NewOutboxEvent};
use crate::types::UserPublic;

pub const EVENT_MESSAGE_CREATED: &str = "message.created";
pub const EVENT_CONVERSATION_UPDATED: &str = "conversation.updated";

const BACKOFF_BASE_MS: i64 = 500;
const BACKOFF_CAP_MS: i64 = 30_000;
const LAST_ERROR_MAX_LENGTH: usize = 1000;

/// Consumes dispatched outbox events; the realtime connection manager is the
/// production implementation.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &db::OutboxEventRecord) -> anyhow::Result<usize>;
}

pub fn compute_backoff(attempts: i32) -> Duration {
    let exponent = (attempts.max(1) - 1).min(16) as u32;
    let delay_ms = BACKOFF_BASE_MS.saturating_mul(1_i64 << exponent);
    Duration::milliseconds(delay_ms.min(BACKOFF_CAP_MS))
}

pub fn truncate_error(err: &str) -> String {
    err.chars().take(LAST_ERROR_MAX_LENGTH).collect()
}

/// Canonical JSON body stored in `payload_json`: keys sorted, compact
/// separators. serde_json's default map ordering provides both.
pub fn encode_payload(seq: i64, occurred_at: DateTime<Utc>, payload: Value) -> String {
    let envelope = json!({
        "seq": seq,
        "occurred_at": occurred_at.to_rfc3339(),
        "payload": payload,
    });
    envelope.to_string()
}

async fn enqueue_event(
    conn: &mut AnyConnection,
    kind: DbKind,
    event_type: &str,
    conversation_id: &str,
    seq: i64,
    occurred_at: DateTime<Utc>,
    payload: Value,
) -> anyhow::Result<()> {
    let now = Utc::now();
    let event = NewOutboxEvent {
        event_id: Uuid::new_v4().to_string(),
        event_type: event_type.to_string(),
        conversation_id: conversation_id.to_string(),
        payload_json: encode_payload(seq, occurred_at, payload),
        created_at: now,
        next_attempt_at: now,
    };
    db::insert_outbox_event(conn, kind, &event).await
}

pub async fn enqueue_message_created(
    conn: &mut AnyConnection,
    kind: DbKind,
    message: &MessageRecord,
    sender: &UserPublic,
) -> anyhow::Result<()> {
    let payload = json!({
        "id": message.id,
        "sender_id": message.sender_id,
        "client_message_id": message.client_message_id,
        "content": message.content,
        "created_at": message.created_at.to_rfc3339(),
        "sender": sender,
    });
    enqueue_event(
        conn,
        kind,
        EVENT_MESSAGE_CREATED,
        &message.conversation_id,
        message.seq,
        message.created_at,
        payload,
    )
    .await
}

pub async fn enqueue_conversation_updated(
    conn: &mut AnyConnection,
    kind: DbKind,
    conversation: &ConversationRecord,
    seq: i64,
) -> anyhow::Result<()> {
    let payload = json!({
        "id": conversation.id,
        "updated_at": conversation.updated_at.to_rfc3339(),
        "last_message_preview": conversation.last_message_preview,
        "last_message_at": conversation.last_message_at.map(|at| at.to_rfc3339()),
    });
    enqueue_event(
        conn,
        kind,
        EVENT_CONVERSATION_UPDATED,
        &conversation.id,
        seq,
        conversation.updated_at,
        payload,
    )
    .await
}

/// Single long-lived worker per process. Polls the outbox, hands events to
/// the publisher in surrogate-id order, and retries failures with capped
/// exponential backoff. A per-event failure never aborts the batch.
pub struct OutboxDispatcher {
    pool: AnyPool,
    kind: DbKind,
    publisher: Arc<dyn EventPublisher>,
    poll_interval: std::time::Duration,
    batch_size: i64,
}

impl OutboxDispatcher {
    pub fn new(
        pool: AnyPool,
        kind: DbKind,
        publisher: Arc<dyn EventPublisher>,
        poll_ms: u64,
        batch_size: i64,
    ) -> Self {
        Self {
            pool,
            kind,
            publisher,
            poll_interval: std::time::Duration::from_millis(poll_ms),
            batch_size,
        }
    }

    /// Drains one due batch. Returns the number of events processed
    /// (published or rescheduled).
    pub async fn process_once(&self) -> anyhow::Result<usize> {
        let now = Utc::now();
        let events = db::fetch_due_outbox_events(&self.pool, self.kind, now, self.batch_size).await?;
        if events.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        for event in &events {
            match self.publisher.publish(event).await {
                Ok(delivered) => {
                    debug!(
                        "realtime event published event_id={} type={} conversation_id={} delivered={delivered}",
                        event.event_id, event.event_type, event.conversation_id
                    );
                    db::mark_outbox_published(&mut tx, self.kind, event.id, Utc::now()).await?;
                }
                Err(err) => {
                    let attempts = event.attempts + 1;
                    let next_attempt_at = Utc::now() + compute_backoff(attempts);
                    warn!(
                        "realtime publish failed event_id={} attempts={attempts} error={err}",
                        event.event_id
                    );
                    db::mark_outbox_failed(
                        &mut tx,
                        self.kind,
                        event.id,
                        attempts,
                        next_attempt_at,
                        &truncate_error(&err.to_string()),
                    )
                    .await?;
                }
            }
        }
        tx.commit().await?;
        Ok(events.len())
    }

    /// Runs until the stop signal flips; the in-flight batch always finishes
    /// and commits before exit.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("outbox dispatcher started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let processed = match self.process_once().await {
                Ok(processed) => processed,
                Err(err) => {
                    error!("outbox dispatch batch failed: {err:?}");
                    0
                }
            };
            if processed == 0 {
                tokio::select! {
                    _ = sleep(self.poll_interval) => {}
                    changed = shutdown.changed() => {
                        // A dropped sender means the process is going away.
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        info!("outbox dispatcher stopped");
    }
}
