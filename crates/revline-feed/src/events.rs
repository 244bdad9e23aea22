//! Typed feed events and the normalizer that produces them.

use std::collections::BTreeSet;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;

use revline_shared::protocol::{
    ChangeKind, ChangeRecord, ConversationRow, MessageRow, ParticipantRow, ProfileRow, Table,
};
use revline_shared::types::{ConversationId, UserId};
use revline_shared::{ConversationUpdate, Message, PresenceRecord};

use crate::error::FeedError;
use crate::scope::FeedScope;

/// A profile row update: derived presence plus the (possibly new) username.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProfileUpdate {
    pub presence: PresenceRecord,
    pub username: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum FeedEvent {
    MessageInserted(Message),
    MessageUpdated(Message),
    ConversationUpdated(ConversationUpdate),
    ProfileUpdated(ProfileUpdate),
    /// Full online set after any presence sync, join or leave.
    PresenceSync(BTreeSet<UserId>),
    ParticipantRemoved {
        conversation_id: ConversationId,
        user_id: Option<UserId>,
    },
    ConversationDeleted(ConversationId),
}

impl FeedEvent {
    pub fn conversation_id(&self) -> Option<&ConversationId> {
        match self {
            FeedEvent::MessageInserted(m) | FeedEvent::MessageUpdated(m) => Some(&m.conversation_id),
            FeedEvent::ConversationUpdated(u) => Some(&u.id),
            FeedEvent::ParticipantRemoved { conversation_id, .. } => Some(conversation_id),
            FeedEvent::ConversationDeleted(id) => Some(id),
            FeedEvent::ProfileUpdated(_) | FeedEvent::PresenceSync(_) => None,
        }
    }
}

/// An event tagged with the subscription it arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopedEvent {
    pub scope: FeedScope,
    pub event: FeedEvent,
}

fn decode<T: DeserializeOwned>(table: Table, row: &serde_json::Value) -> Result<T, FeedError> {
    serde_json::from_value(row.clone()).map_err(|source| FeedError::Decode { table, source })
}

/// Turn a raw change record into a typed event.
///
/// Returns `Ok(None)` for change kinds the engine does not consume.
pub fn normalize(record: &ChangeRecord) -> Result<Option<FeedEvent>, FeedError> {
    let event = match (record.table, record.kind) {
        (Table::Messages, ChangeKind::Insert) => {
            let row: MessageRow = decode(record.table, &record.new)?;
            Some(FeedEvent::MessageInserted(row.into_message(Utc::now())))
        }
        (Table::Messages, ChangeKind::Update) => {
            let row: MessageRow = decode(record.table, &record.new)?;
            Some(FeedEvent::MessageUpdated(row.into_message(Utc::now())))
        }
        (Table::Conversations, ChangeKind::Update) => {
            let row: ConversationRow = decode(record.table, &record.new)?;
            Some(FeedEvent::ConversationUpdated(row.into()))
        }
        (Table::Conversations, ChangeKind::Delete) => {
            let id = record
                .old
                .get("id")
                .and_then(|v| v.as_str())
                .ok_or(FeedError::MissingField {
                    table: record.table,
                    field: "id",
                })?;
            Some(FeedEvent::ConversationDeleted(ConversationId::new(id)))
        }
        (Table::ConversationParticipants, ChangeKind::Delete) => {
            let row: ParticipantRow = decode(record.table, &record.old)?;
            Some(FeedEvent::ParticipantRemoved {
                conversation_id: ConversationId(row.conversation_id),
                user_id: row.user_id.map(UserId),
            })
        }
        (Table::UserProfiles, ChangeKind::Update) => {
            let row: ProfileRow = decode(record.table, &record.new)?;
            Some(FeedEvent::ProfileUpdated(ProfileUpdate {
                presence: row.to_presence(),
                username: row.username,
            }))
        }
        _ => None,
    };
    Ok(event)
}
