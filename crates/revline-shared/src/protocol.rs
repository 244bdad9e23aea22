//! Raw rows exchanged with the backend.
//!
//! Column names follow the database (`snake_case`). Realtime change records
//! carry these rows as untyped JSON in `new`/`old`; the feed adapter decodes
//! them into the typed rows below and converts those into domain models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::DEFAULT_ONLINE_THRESHOLD_SECS;
use crate::models::{Conversation, ConversationUpdate, Message, OtherUser, PresenceRecord};
use crate::types::{ConversationId, MessageId, UserId};

/// Logical tables the realtime feed reports on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Messages,
    Conversations,
    ConversationParticipants,
    UserProfiles,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Messages => "messages",
            Table::Conversations => "conversations",
            Table::ConversationParticipants => "conversation_participants",
            Table::UserProfiles => "user_profiles",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A row-level change notification as delivered by the realtime service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeRecord {
    pub table: Table,
    #[serde(rename = "eventType")]
    pub kind: ChangeKind,
    #[serde(default)]
    pub new: serde_json::Value,
    #[serde(default)]
    pub old: serde_json::Value,
}

impl ChangeRecord {
    pub fn new(table: Table, kind: ChangeKind, new: serde_json::Value) -> Self {
        Self {
            table,
            kind,
            new,
            old: serde_json::Value::Null,
        }
    }

    pub fn deleted(table: Table, old: serde_json::Value) -> Self {
        Self {
            table,
            kind: ChangeKind::Delete,
            new: serde_json::Value::Null,
            old,
        }
    }
}

// ---------------------------------------------------------------------------
// messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    #[serde(default)]
    pub content: String,
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_read: bool,
}

impl MessageRow {
    /// `fallback_time` stands in for a missing `created_at`.
    pub fn into_message(self, fallback_time: DateTime<Utc>) -> Message {
        Message {
            id: MessageId(self.id),
            conversation_id: ConversationId(self.conversation_id),
            sender_id: UserId(self.sender_id),
            content: self.content,
            created_at: self.created_at.unwrap_or(fallback_time),
            is_read: self.is_read,
            local_uri: None,
        }
    }
}

// ---------------------------------------------------------------------------
// conversations
// ---------------------------------------------------------------------------

/// Partial conversation row from an UPDATE notification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationRow {
    pub id: String,
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_message_text: Option<String>,
}

impl From<ConversationRow> for ConversationUpdate {
    fn from(row: ConversationRow) -> Self {
        Self {
            id: ConversationId(row.id),
            last_message_at: row.last_message_at,
            // An empty summary in the notification carries no information.
            last_message_text: row.last_message_text.filter(|t| !t.is_empty()),
        }
    }
}

/// Row returned by the `list_conversations_with_unread` RPC.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationSummaryRow {
    pub id: String,
    #[serde(default)]
    pub is_group: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_message_text: Option<String>,
    #[serde(default)]
    pub unread_count: Option<i64>,
    #[serde(default)]
    pub other_user_id: Option<String>,
    #[serde(default)]
    pub other_username: Option<String>,
}

impl From<ConversationSummaryRow> for Conversation {
    fn from(row: ConversationSummaryRow) -> Self {
        let unread = row.unread_count.unwrap_or(0).clamp(0, i64::from(u32::MAX));
        Self {
            id: ConversationId(row.id),
            is_group: row.is_group,
            created_at: row.created_at,
            last_message_at: row.last_message_at,
            last_message_text: row.last_message_text,
            unread_count: u32::try_from(unread).unwrap_or(0),
            other_user: row.other_user_id.map(|id| OtherUser {
                id: UserId(id),
                username: row.other_username,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// conversation_participants
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParticipantRow {
    pub conversation_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
}

// ---------------------------------------------------------------------------
// user_profiles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProfileRow {
    pub id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub last_seen_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub online_threshold_seconds: Option<u32>,
    #[serde(default)]
    pub is_online: Option<bool>,
}

impl ProfileRow {
    pub fn to_presence(&self) -> PresenceRecord {
        PresenceRecord {
            user_id: UserId(self.id.clone()),
            is_online: self.is_online.unwrap_or(false),
            last_seen_at: self.last_seen_at,
            // A stored zero means "unset" in the profile table.
            online_threshold_seconds: match self.online_threshold_seconds {
                Some(0) | None => DEFAULT_ONLINE_THRESHOLD_SECS,
                Some(secs) => secs,
            },
        }
    }
}
