//! Domain models held in the client cache.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be handed
//! directly to the UI layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::DEFAULT_ONLINE_THRESHOLD_SECS;
use crate::content::MessageContent;
use crate::types::{ConversationId, MessageId, UserId};

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

/// The peer shown for a direct conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OtherUser {
    pub id: UserId,
    pub username: Option<String>,
}

/// One inbox row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    pub is_group: bool,
    pub created_at: DateTime<Utc>,
    /// Drives inbox ordering (descending, missing last).
    pub last_message_at: Option<DateTime<Utc>>,
    pub last_message_text: Option<String>,
    pub unread_count: u32,
    /// `None` for group conversations.
    pub other_user: Option<OtherUser>,
}

/// Summary fields carried by a conversation UPDATE notification. Fields
/// absent from the notification are `None` and leave the cached value alone.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationUpdate {
    pub id: ConversationId,
    pub last_message_at: Option<DateTime<Utc>>,
    pub last_message_text: Option<String>,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A single chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    /// Plain text or a JSON image descriptor.
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub is_read: bool,
    /// Device-local image shown while an optimistic upload is pending.
    /// Never sent to the backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_uri: Option<String>,
}

impl Message {
    pub fn parsed_content(&self) -> MessageContent {
        MessageContent::parse(&self.content)
    }

    pub fn is_temp(&self) -> bool {
        self.id.is_temp()
    }
}

// ---------------------------------------------------------------------------
// Presence
// ---------------------------------------------------------------------------

/// Online state of one user as last reported by the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub user_id: UserId,
    pub is_online: bool,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub online_threshold_seconds: u32,
}

impl PresenceRecord {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            is_online: false,
            last_seen_at: None,
            online_threshold_seconds: DEFAULT_ONLINE_THRESHOLD_SECS,
        }
    }

    /// Derived online status: the explicit flag, or a `last_seen_at` younger
    /// than the threshold.
    pub fn is_online_at(&self, now: DateTime<Utc>) -> bool {
        if self.is_online {
            return true;
        }
        match self.last_seen_at {
            Some(seen) => {
                let elapsed_ms = now.signed_duration_since(seen).num_milliseconds();
                elapsed_ms < i64::from(self.online_threshold_seconds) * 1000
            }
            None => false,
        }
    }
}
