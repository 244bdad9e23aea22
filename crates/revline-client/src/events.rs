use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use revline_shared::types::{ConversationId, MessageId, UserId};

use crate::mutation::OperationKind;

pub const EVENT_NOTIFICATION: &str = "notification";
pub const EVENT_CONVERSATION_DELETED: &str = "conversation-deleted";
pub const EVENT_ERROR_ALERT: &str = "error-alert";
pub const EVENT_OPEN_THREAD: &str = "open-thread";

const EVENT_BUFFER: usize = 64;

/// In-app alert for a message from someone else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatNotification {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub from_user_id: UserId,
    pub username: String,
    pub preview: String,
    pub created_at: DateTime<Utc>,
}

/// Where a notification tap should navigate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TapTarget {
    pub conversation_id: ConversationId,
    pub other_user_id: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum EngineEvent {
    Notification(ChatNotification),
    /// The user lost access to a conversation; any screen showing it should close.
    ConversationDeleted(ConversationId),
    ErrorAlert { operation: OperationKind, message: String },
    OpenThread(TapTarget),
}

impl EngineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::Notification(_) => EVENT_NOTIFICATION,
            EngineEvent::ConversationDeleted(_) => EVENT_CONVERSATION_DELETED,
            EngineEvent::ErrorAlert { .. } => EVENT_ERROR_ALERT,
            EngineEvent::OpenThread(_) => EVENT_OPEN_THREAD,
        }
    }
}

/// Fan-out of engine events to the UI layer.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventSink {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: EngineEvent) {
        let name = event.name();
        if let Err(e) = self.tx.send(event) {
            tracing::debug!(event = name, error = %e, "Engine event had no listener");
        }
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}
