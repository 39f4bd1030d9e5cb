use async_trait::async_trait;
use chrono::{Duration, Utc};
use courier::config::{Config, DatabaseConfig, DispatcherConfig};
use courier::db::{self, NewOutboxEvent, OutboxEventRecord, UserRecord};
use courier::outbox::{encode_payload, EventPublisher, OutboxDispatcher};
use courier::{auth, conversations, create_app_with_config, messages, AppState};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use uuid::Uuid;

async fn setup() -> (AppState, TempDir) {
    let temp = TempDir::new().unwrap();
    let db_path = temp.path().join("courier-test.db");
    let config = Config {
        database: DatabaseConfig {
            url: Some(format!("sqlite://{}?mode=rwc", db_path.display())),
            sqlite_path: String::new(),
        },
        dispatcher: DispatcherConfig {
            enabled: false,
            ..DispatcherConfig::default()
        },
        ..Config::default()
    };
    let (state, _app) = create_app_with_config(config).await.unwrap();
    (state, temp)
}

async fn register(state: &AppState, username: &str) -> UserRecord {
    let (user, _tokens) = auth::register_user(
        &state.pool,
        state.db_kind,
        &state.config.auth,
        username,
        None,
        "correct-horse-battery",
    )
    .await
    .unwrap();
    user
}

async fn direct_conversation(state: &AppState, a: &UserRecord, b: &UserRecord) -> String {
    conversations::get_or_create_direct_conversation(&state.pool, state.db_kind, &a.id, &b.id)
        .await
        .unwrap()
        .id
}

/// Publisher that fails its first `failures` calls, then records every
/// published event id.
struct FlakyPublisher {
    remaining_failures: AtomicUsize,
    published: Mutex<Vec<String>>,
}

impl FlakyPublisher {
    fn new(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            remaining_failures: AtomicUsize::new(failures),
            published: Mutex::new(Vec::new()),
        })
    }

    fn published_ids(&self) -> Vec<String> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventPublisher for FlakyPublisher {
    async fn publish(&self, event: &OutboxEventRecord) -> anyhow::Result<usize> {
        let remaining = self.remaining_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.remaining_failures.store(remaining - 1, Ordering::SeqCst);
            anyhow::bail!("simulated publish failure");
        }
        self.published.lock().unwrap().push(event.event_id.clone());
        Ok(1)
    }
}

fn dispatcher_with(state: &AppState, publisher: Arc<dyn EventPublisher>) -> OutboxDispatcher {
    OutboxDispatcher::new(state.pool.clone(), state.db_kind, publisher, 50, 100)
}

#[tokio::test]
async fn test_committed_message_produces_two_pending_events() {
    let (state, _temp) = setup().await;
    let alice = register(&state, "alice").await;
    let bob = register(&state, "bob").await;
    let conversation_id = direct_conversation(&state, &alice, &bob).await;

    let (message, created) = messages::send_message(
        &state.pool,
        state.db_kind,
        &conversation_id,
        &alice,
        "client-msg-0001",
        "hello",
    )
    .await
    .unwrap();
    assert!(created);
    assert_eq!(message.seq, 1);

    let events = db::list_outbox_events(&state.pool, state.db_kind, &conversation_id)
        .await
        .unwrap();
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|event| event.published_at.is_none()));
    assert!(events.iter().all(|event| event.attempts == 0));
    let types: Vec<&str> = events.iter().map(|event| event.event_type.as_str()).collect();
    assert_eq!(types, vec!["message.created", "conversation.updated"]);

    // payload_json carries {occurred_at, payload, seq} with the message body.
    let decoded: Value = serde_json::from_str(&events[0].payload_json).unwrap();
    assert_eq!(decoded["seq"], 1);
    assert_eq!(decoded["payload"]["content"], "hello");
    assert_eq!(decoded["payload"]["sender"]["username"], "alice");
    let updated: Value = serde_json::from_str(&events[1].payload_json).unwrap();
    assert_eq!(updated["payload"]["last_message_preview"], "hello");
}

#[tokio::test]
async fn test_idempotent_replay_records_no_new_events() {
    let (state, _temp) = setup().await;
    let alice = register(&state, "alice").await;
    let bob = register(&state, "bob").await;
    let conversation_id = direct_conversation(&state, &alice, &bob).await;

    for _ in 0..3 {
        messages::send_message(
            &state.pool,
            state.db_kind,
            &conversation_id,
            &alice,
            "client-msg-0001",
            "hello",
        )
        .await
        .unwrap();
    }

    let events = db::list_outbox_events(&state.pool, state.db_kind, &conversation_id)
        .await
        .unwrap();
    assert_eq!(events.len(), 2);
}

#[tokio::test]
async fn test_rejected_write_records_no_events() {
    let (state, _temp) = setup().await;
    let alice = register(&state, "alice").await;

    let err = messages::send_message(
        &state.pool,
        state.db_kind,
        "missing-conversation",
        &alice,
        "client-msg-0001",
        "hello",
    )
    .await
    .unwrap_err();
    assert_eq!(err.code, "conversation_not_found");

    let events = db::list_outbox_events(&state.pool, state.db_kind, "missing-conversation")
        .await
        .unwrap();
    assert!(events.is_empty());
}

#[tokio::test]
async fn test_dispatcher_publishes_in_surrogate_id_order() {
    let (state, _temp) = setup().await;
    let alice = register(&state, "alice").await;
    let bob = register(&state, "bob").await;
    let conversation_id = direct_conversation(&state, &alice, &bob).await;

    for index in 1..=2 {
        messages::send_message(
            &state.pool,
            state.db_kind,
            &conversation_id,
            &alice,
            &format!("client-msg-000{index}"),
            &format!("message {index}"),
        )
        .await
        .unwrap();
    }

    let publisher = FlakyPublisher::new(0);
    let dispatcher = dispatcher_with(&state, publisher.clone());
    let processed = dispatcher.process_once().await.unwrap();
    assert_eq!(processed, 4);

    let events = db::list_outbox_events(&state.pool, state.db_kind, &conversation_id)
        .await
        .unwrap();
    assert!(events.iter().all(|event| event.published_at.is_some()));
    let expected: Vec<String> = events.iter().map(|event| event.event_id.clone()).collect();
    assert_eq!(publisher.published_ids(), expected);

    // Nothing left once the backlog is drained.
    assert_eq!(dispatcher.process_once().await.unwrap(), 0);
}

#[tokio::test]
async fn test_dispatcher_retries_with_backoff_then_succeeds() {
    let (state, _temp) = setup().await;
    let alice = register(&state, "alice").await;
    let bob = register(&state, "bob").await;
    let conversation_id = direct_conversation(&state, &alice, &bob).await;

    let mut conn = state.pool.acquire().await.unwrap();
    db::insert_outbox_event(
        &mut conn,
        state.db_kind,
        &NewOutboxEvent {
            event_id: Uuid::new_v4().to_string(),
            event_type: "message.created".to_string(),
            conversation_id: conversation_id.clone(),
            payload_json: encode_payload(1, Utc::now(), json!({"content": "hello"})),
            created_at: Utc::now(),
            next_attempt_at: Utc::now(),
        },
    )
    .await
    .unwrap();
    drop(conn);

    let publisher = FlakyPublisher::new(1);
    let dispatcher = dispatcher_with(&state, publisher.clone());

    // First pass fails: attempts bumps, next attempt moves into the future.
    let before = Utc::now();
    assert_eq!(dispatcher.process_once().await.unwrap(), 1);
    let events = db::list_outbox_events(&state.pool, state.db_kind, &conversation_id)
        .await
        .unwrap();
    let event = &events[0];
    assert_eq!(event.attempts, 1);
    assert!(event.published_at.is_none());
    assert!(event.next_attempt_at >= before + Duration::milliseconds(500));
    assert!(event.last_error.as_deref().unwrap().contains("simulated"));

    // Not due yet, so the next pass is a no-op.
    assert_eq!(dispatcher.process_once().await.unwrap(), 0);

    // Force the retry due and publish.
    db::set_outbox_next_attempt(
        &state.pool,
        state.db_kind,
        event.id,
        Utc::now() - Duration::seconds(1),
    )
    .await
    .unwrap();
    assert_eq!(dispatcher.process_once().await.unwrap(), 1);

    let events = db::list_outbox_events(&state.pool, state.db_kind, &conversation_id)
        .await
        .unwrap();
    let event = &events[0];
    assert!(event.published_at.is_some());
    assert_eq!(event.attempts, 1);
    assert!(event.last_error.is_none());
    assert_eq!(publisher.published_ids().len(), 1);
}

#[tokio::test]
async fn test_per_event_failure_does_not_abort_batch() {
    let (state, _temp) = setup().await;
    let alice = register(&state, "alice").await;
    let bob = register(&state, "bob").await;
    let conversation_id = direct_conversation(&state, &alice, &bob).await;

    messages::send_message(
        &state.pool,
        state.db_kind,
        &conversation_id,
        &alice,
        "client-msg-0001",
        "hello",
    )
    .await
    .unwrap();

    // Fails only the first event in the batch of two.
    let publisher = FlakyPublisher::new(1);
    let dispatcher = dispatcher_with(&state, publisher.clone());
    assert_eq!(dispatcher.process_once().await.unwrap(), 2);

    let events = db::list_outbox_events(&state.pool, state.db_kind, &conversation_id)
        .await
        .unwrap();
    assert!(events[0].published_at.is_none());
    assert_eq!(events[0].attempts, 1);
    assert!(events[1].published_at.is_some());
    assert_eq!(events[1].attempts, 0);
}

#[tokio::test]
async fn test_dispatcher_run_honors_stop_signal() {
    let (state, _temp) = setup().await;
    let publisher = FlakyPublisher::new(0);
    let dispatcher = dispatcher_with(&state, publisher);

    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(dispatcher.run(stop_rx));
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    stop_tx.send(true).unwrap();
    tokio::time::timeout(std::time::Duration::from_secs(2), handle)
        .await
        .expect("dispatcher did not stop")
        .unwrap();
}
