//! Inbox list reducers and the typed helpers that apply them.

use std::cmp::Ordering;
use std::collections::HashSet;

use tracing::debug;

use revline_shared::types::{ConversationId, UserId};
use revline_shared::{Conversation, ConversationUpdate, Message};

use crate::keys::{CacheKey, CacheValue};
use crate::store::CacheStore;
use crate::unread;

/// Newest first; conversations without messages go last. Stable.
pub fn sort_conversations(list: &mut [Conversation]) {
    list.sort_by(|a, b| match (a.last_message_at, b.last_message_at) {
        (Some(ta), Some(tb)) => tb.cmp(&ta),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
}

/// Keep the first occurrence of every id, then sort.
pub fn normalize(list: Vec<Conversation>) -> Vec<Conversation> {
    let mut seen = HashSet::new();
    let mut out: Vec<Conversation> = list
        .into_iter()
        .filter(|c| seen.insert(c.id.clone()))
        .collect();
    sort_conversations(&mut out);
    out
}

/// Fold a newly inserted message into the inbox.
///
/// Unknown conversations are left alone: only a full list fetch may add
/// conversations. Messages from anyone but `self_id` bump the unread count
/// by one. Summary fields only move forward in time.
pub fn apply_message_inserted(
    mut list: Vec<Conversation>,
    message: &Message,
    self_id: &UserId,
) -> Vec<Conversation> {
    let Some(conv) = list.iter_mut().find(|c| c.id == message.conversation_id) else {
        return list;
    };

    let is_newer = conv
        .last_message_at
        .map_or(true, |at| message.created_at >= at);
    if is_newer {
        conv.last_message_at = Some(message.created_at);
        conv.last_message_text = Some(message.parsed_content().summary());
    }
    if &message.sender_id != self_id {
        conv.unread_count = unread::increment(conv.unread_count);
    }

    sort_conversations(&mut list);
    list
}

pub fn apply_conversation_update(
    mut list: Vec<Conversation>,
    update: &ConversationUpdate,
) -> Vec<Conversation> {
    let Some(conv) = list.iter_mut().find(|c| c.id == update.id) else {
        return list;
    };
    if let Some(at) = update.last_message_at {
        conv.last_message_at = Some(at);
    }
    if let Some(ref text) = update.last_message_text {
        conv.last_message_text = Some(text.clone());
    }
    sort_conversations(&mut list);
    list
}

pub fn remove_conversation(list: Vec<Conversation>, id: &ConversationId) -> Vec<Conversation> {
    list.into_iter().filter(|c| &c.id != id).collect()
}

/// Put back a conversation that was removed optimistically. No-op if it
/// is already listed again.
pub fn reinsert_conversation(mut list: Vec<Conversation>, conversation: Conversation) -> Vec<Conversation> {
    if list.iter().any(|c| c.id == conversation.id) {
        return list;
    }
    list.push(conversation);
    sort_conversations(&mut list);
    list
}

/// Propagate a profile's new username to direct conversations with them.
pub fn rename_peer(mut list: Vec<Conversation>, user_id: &UserId, username: &str) -> Vec<Conversation> {
    for conv in list.iter_mut() {
        if let Some(ref mut other) = conv.other_user {
            if &other.id == user_id {
                other.username = Some(username.to_string());
            }
        }
    }
    list
}

impl CacheStore {
    /// `None` until the inbox has been fetched at least once.
    pub fn conversations(&self) -> Option<Vec<Conversation>> {
        self.read(&CacheKey::Conversations)
            .and_then(CacheValue::into_conversations)
    }

    pub fn conversation(&self, id: &ConversationId) -> Option<Conversation> {
        self.conversations()?.into_iter().find(|c| &c.id == id)
    }

    /// Replace the inbox with an authoritative list.
    pub fn set_conversations(&self, list: Vec<Conversation>) {
        let list = normalize(list);
        debug!(count = list.len(), "inbox replaced");
        self.write(CacheKey::Conversations, CacheValue::Conversations(list));
    }

    /// Apply `f` to the inbox if it is loaded. Returns whether it was.
    pub fn update_conversations<F>(&self, f: F) -> bool
    where
        F: FnOnce(Vec<Conversation>) -> Vec<Conversation>,
    {
        let mut applied = false;
        self.patch(CacheKey::Conversations, |prev| match prev {
            Some(CacheValue::Conversations(list)) => {
                applied = true;
                Some(CacheValue::Conversations(f(list)))
            }
            other => other,
        });
        applied
    }

    /// Returns `true` when the message's conversation is cached.
    pub fn apply_message_to_inbox(&self, message: &Message, self_id: &UserId) -> bool {
        let known = self.conversation(&message.conversation_id).is_some();
        if known {
            self.update_conversations(|list| apply_message_inserted(list, message, self_id));
        } else {
            debug!(
                conversation = %message.conversation_id,
                "message for unknown conversation ignored by inbox"
            );
        }
        known
    }

    pub fn apply_conversation_update(&self, update: &ConversationUpdate) {
        self.update_conversations(|list| apply_conversation_update(list, update));
    }

    pub fn remove_conversation(&self, id: &ConversationId) {
        self.update_conversations(|list| remove_conversation(list, id));
    }

    /// Zero one conversation's unread count, returning the previous value.
    pub fn reset_conversation_unread(&self, id: &ConversationId) -> Option<u32> {
        let mut prior = None;
        self.update_conversations(|mut list| {
            if let Some(conv) = list.iter_mut().find(|c| &c.id == id) {
                prior = Some(conv.unread_count);
                conv.unread_count = 0;
            }
            list
        });
        prior
    }

    /// Add back `cleared` unread messages on top of whatever arrived since
    /// the count was zeroed.
    pub fn restore_conversation_unread(&self, id: &ConversationId, cleared: u32) {
        if cleared == 0 {
            return;
        }
        self.update_conversations(|mut list| {
            if let Some(conv) = list.iter_mut().find(|c| &c.id == id) {
                conv.unread_count = unread::restore(conv.unread_count, cleared);
            }
            list
        });
    }

    pub fn reinsert_conversation(&self, conversation: Conversation) {
        self.update_conversations(|list| reinsert_conversation(list, conversation));
    }

    pub fn rename_peer(&self, user_id: &UserId, username: &str) {
        self.update_conversations(|list| rename_peer(list, user_id, username));
    }
}
