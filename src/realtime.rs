use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::SplitSink;
use futures::SinkExt;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::outbox::EventPublisher;
use crate::protocol;

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;
pub const CLOSE_TRY_AGAIN_LATER: u16 = 1013;

pub const OUTGOING_QUEUE_CAPACITY: usize = 200;

const WRITER_SHUTDOWN_GRACE: std::time::Duration = std::time::Duration::from_secs(5);

/// Write half of a live session. The production implementation wraps the
/// axum WebSocket sink; tests substitute an in-memory capture.
#[async_trait]
pub trait FrameTransport: Send {
    async fn send_frame(&mut self, frame: &Value) -> anyhow::Result<()>;
    async fn close(&mut self, code: u16) -> anyhow::Result<()>;
}

pub struct WsTransport {
    sink: SplitSink<WebSocket, Message>,
}

impl WsTransport {
    pub fn new(sink: SplitSink<WebSocket, Message>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl FrameTransport for WsTransport {
    async fn send_frame(&mut self, frame: &Value) -> anyhow::Result<()> {
        let text = serde_json::to_string(frame)?;
        self.sink.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn close(&mut self, code: u16) -> anyhow::Result<()> {
        self.sink
            .send(Message::Close(Some(CloseFrame {
                code,
                reason: "".into(),
            })))
            .await?;
        Ok(())
    }
}

struct ConnectionEntry {
    user_id: String,
    outgoing: mpsc::Sender<Value>,
    close: mpsc::Sender<u16>,
    subscriptions: HashSet<String>,
    writer: JoinHandle<()>,
}

#[derive(Default)]
struct ManagerState {
    connections: HashMap<String, ConnectionEntry>,
    by_user: HashMap<String, HashSet<String>>,
    by_conversation: HashMap<String, HashSet<String>>,
}

#[derive(Debug, thiserror::Error)]
#[error("subscription limit exceeded")]
pub struct SubscriptionLimitExceeded;

/// Owns every live session: connection registry, per-user and
/// per-conversation reverse indexes, and the bounded outgoing queues.
///
/// All index mutations go through one async mutex; lookups that precede I/O
/// snapshot what they need and release the lock before awaiting.
pub struct ConnectionManager {
    max_subscriptions_per_connection: usize,
    state: Mutex<ManagerState>,
}

impl ConnectionManager {
    pub fn new(max_subscriptions_per_connection: usize) -> Self {
        Self {
            max_subscriptions_per_connection,
            state: Mutex::new(ManagerState::default()),
        }
    }

    pub async fn register(
        self: &Arc<Self>,
        transport: Box<dyn FrameTransport>,
        user_id: &str,
    ) -> String {
        let connection_id = Uuid::new_v4().to_string();
        let (outgoing_tx, outgoing_rx) = mpsc::channel::<Value>(OUTGOING_QUEUE_CAPACITY);
        let (close_tx, close_rx) = mpsc::channel::<u16>(1);

        let writer = tokio::spawn(writer_loop(
            Arc::clone(self),
            connection_id.clone(),
            transport,
            outgoing_rx,
            close_rx,
        ));

        let entry = ConnectionEntry {
            user_id: user_id.to_string(),
            outgoing: outgoing_tx,
            close: close_tx,
            subscriptions: HashSet::new(),
            writer,
        };

        let mut state = self.state.lock().await;
        state
            .by_user
            .entry(user_id.to_string())
            .or_default()
            .insert(connection_id.clone());
        state.connections.insert(connection_id.clone(), entry);
        drop(state);

        info!("websocket connection registered connection_id={connection_id} user_id={user_id}");
        connection_id
    }

    /// Removes the connection from every index and tears down its writer.
    /// `close_code: Some(_)` asks the writer to send a close frame first.
    /// Idempotent.
    pub async fn unregister(&self, connection_id: &str, close_code: Option<u16>) {
        let entry = {
            let mut state = self.state.lock().await;
            let Some(entry) = state.connections.remove(connection_id) else {
                return;
            };

            if let Some(user_connections) = state.by_user.get_mut(&entry.user_id) {
                user_connections.remove(connection_id);
                if user_connections.is_empty() {
                    state.by_user.remove(&entry.user_id);
                }
            }
            for conversation_id in &entry.subscriptions {
                if let Some(subscribers) = state.by_conversation.get_mut(conversation_id) {
                    subscribers.remove(connection_id);
                    if subscribers.is_empty() {
                        state.by_conversation.remove(conversation_id);
                    }
                }
            }
            entry
        };

        if let Some(code) = close_code {
            let _ = entry.close.try_send(code);
        }
        // Dropping the senders ends the writer loop when no close frame was
        // requested; a writer wedged mid-send on a dead socket is aborted
        // after the grace period.
        let mut writer = entry.writer;
        tokio::spawn(async move {
            if tokio::time::timeout(WRITER_SHUTDOWN_GRACE, &mut writer)
                .await
                .is_err()
            {
                writer.abort();
            }
        });
        info!(
            "websocket connection unregistered connection_id={connection_id} user_id={}",
            entry.user_id
        );
    }

    /// Enqueue without waiting. A full queue marks the client as slow: the
    /// connection is dropped with close code 1013 and the client is expected
    /// to reconnect and catch up via sync changes.
    pub async fn send(&self, connection_id: &str, frame: Value) -> bool {
        let sender = {
            let state = self.state.lock().await;
            state
                .connections
                .get(connection_id)
                .map(|entry| entry.outgoing.clone())
        };
        let Some(sender) = sender else {
            return false;
        };

        match sender.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("slow websocket client disconnected connection_id={connection_id}");
                self.unregister(connection_id, Some(CLOSE_TRY_AGAIN_LATER))
                    .await;
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Delivers one frame to every current subscriber of the conversation.
    /// Returns how many connections accepted the frame.
    pub async fn fanout(&self, conversation_id: &str, frame: Value) -> usize {
        let targets: Vec<String> = {
            let state = self.state.lock().await;
            state
                .by_conversation
                .get(conversation_id)
                .map(|subscribers| subscribers.iter().cloned().collect())
                .unwrap_or_default()
        };

        let mut delivered = 0;
        for connection_id in targets {
            if self.send(&connection_id, frame.clone()).await {
                delivered += 1;
            }
        }
        delivered
    }

    pub async fn subscribe(
        &self,
        connection_id: &str,
        conversation_ids: &[String],
    ) -> Result<(), SubscriptionLimitExceeded> {
        if conversation_ids.is_empty() {
            return Ok(());
        }

        let mut state = self.state.lock().await;
        let max = self.max_subscriptions_per_connection;
        let Some(entry) = state.connections.get_mut(connection_id) else {
            return Ok(());
        };

        let projected = entry
            .subscriptions
            .iter()
            .chain(conversation_ids.iter())
            .collect::<HashSet<_>>()
            .len();
        if projected > max {
            return Err(SubscriptionLimitExceeded);
        }

        entry
            .subscriptions
            .extend(conversation_ids.iter().cloned());
        let connection_key = connection_id.to_string();
        for conversation_id in conversation_ids {
            state
                .by_conversation
                .entry(conversation_id.clone())
                .or_default()
                .insert(connection_key.clone());
        }
        Ok(())
    }

    pub async fn unsubscribe(&self, connection_id: &str, conversation_ids: &[String]) {
        let mut state = self.state.lock().await;
        let Some(entry) = state.connections.get_mut(connection_id) else {
            return;
        };
        for conversation_id in conversation_ids {
            entry.subscriptions.remove(conversation_id);
        }
        for conversation_id in conversation_ids {
            if let Some(subscribers) = state.by_conversation.get_mut(conversation_id) {
                subscribers.remove(connection_id);
                if subscribers.is_empty() {
                    state.by_conversation.remove(conversation_id);
                }
            }
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.connections.len()
    }

    pub async fn is_connected(&self, connection_id: &str) -> bool {
        self.state
            .lock()
            .await
            .connections
            .contains_key(connection_id)
    }

    pub async fn subscriber_count(&self, conversation_id: &str) -> usize {
        self.state
            .lock()
            .await
            .by_conversation
            .get(conversation_id)
            .map(|subscribers| subscribers.len())
            .unwrap_or(0)
    }
}

async fn writer_loop(
    manager: Arc<ConnectionManager>,
    connection_id: String,
    mut transport: Box<dyn FrameTransport>,
    mut outgoing: mpsc::Receiver<Value>,
    mut close: mpsc::Receiver<u16>,
) {
    loop {
        tokio::select! {
            biased;
            code = close.recv() => {
                if let Some(code) = code {
                    let _ = transport.close(code).await;
                }
                return;
            }
            frame = outgoing.recv() => {
                match frame {
                    Some(frame) => {
                        if let Err(err) = transport.send_frame(&frame).await {
                            warn!(
                                "websocket writer failed connection_id={connection_id} error={err}"
                            );
                            manager.unregister(&connection_id, None).await;
                            return;
                        }
                    }
                    // All senders dropped: unregistered without a close frame.
                    None => return,
                }
            }
        }
    }
}

/// Decodes a stored outbox event back into a wire frame and fans it out to
/// the conversation's subscribers.
pub struct RealtimePublisher {
    manager: Arc<ConnectionManager>,
}

impl RealtimePublisher {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl EventPublisher for RealtimePublisher {
    async fn publish(&self, event: &crate::db::OutboxEventRecord) -> anyhow::Result<usize> {
        let decoded: Value = serde_json::from_str(&event.payload_json)?;
        let seq = decoded
            .get("seq")
            .and_then(Value::as_i64)
            .ok_or_else(|| anyhow::anyhow!("outbox payload_json is missing seq"))?;
        let occurred_at = decoded
            .get("occurred_at")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("outbox payload_json is missing occurred_at"))?;
        let payload = decoded
            .get("payload")
            .filter(|value| value.is_object())
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("outbox payload_json is missing payload object"))?;

        let frame = protocol::event_frame(
            &event.event_type,
            &event.event_id,
            &event.conversation_id,
            seq,
            occurred_at,
            payload,
        );
        let delivered = self.manager.fanout(&event.conversation_id, frame).await;
        debug!(
            "fanned out event event_id={} conversation_id={} delivered={delivered}",
            event.event_id, event.conversation_id
        );
        Ok(delivered)
    }
}
