//! Cache addressing scheme.

use std::collections::BTreeSet;

use serde::Serialize;

use revline_shared::types::{ConversationId, UserId};
use revline_shared::{Conversation, Message, PresenceRecord};

/// Address of one cached collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum CacheKey {
    /// Inbox list, sorted by `last_message_at` descending.
    Conversations,
    /// Message list of one thread, oldest first.
    Messages(ConversationId),
    /// Last known presence fields of one user.
    Presence(UserId),
    /// Users currently joined to the presence channel.
    OnlineUsers,
    /// Result of the latest membership check for a conversation.
    Membership(ConversationId),
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheKey::Conversations => f.write_str("conversations"),
            CacheKey::Messages(id) => write!(f, "messages:{id}"),
            CacheKey::Presence(id) => write!(f, "presence:{id}"),
            CacheKey::OnlineUsers => f.write_str("online-users"),
            CacheKey::Membership(id) => write!(f, "membership:{id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum CacheValue {
    Conversations(Vec<Conversation>),
    Messages(Vec<Message>),
    Presence(PresenceRecord),
    OnlineUsers(BTreeSet<UserId>),
    Membership(bool),
}

impl CacheValue {
    pub fn into_conversations(self) -> Option<Vec<Conversation>> {
        match self {
            CacheValue::Conversations(list) => Some(list),
            _ => None,
        }
    }

    pub fn into_messages(self) -> Option<Vec<Message>> {
        match self {
            CacheValue::Messages(list) => Some(list),
            _ => None,
        }
    }

    pub fn into_presence(self) -> Option<PresenceRecord> {
        match self {
            CacheValue::Presence(record) => Some(record),
            _ => None,
        }
    }

    pub fn into_online_users(self) -> Option<BTreeSet<UserId>> {
        match self {
            CacheValue::OnlineUsers(set) => Some(set),
            _ => None,
        }
    }

    pub fn as_membership(&self) -> Option<bool> {
        match self {
            CacheValue::Membership(flag) => Some(*flag),
            _ => None,
        }
    }
}
