//! Thread message list reducers.

use tracing::debug;

use revline_shared::types::{ConversationId, MessageId};
use revline_shared::Message;

use crate::keys::{CacheKey, CacheValue};
use crate::store::CacheStore;

/// Fold a server-confirmed message into a thread.
///
/// Every `temp-*` placeholder is dropped and the message is appended unless
/// its id is already present, so duplicate deliveries are no-ops.
pub fn reconcile_inserted(list: Vec<Message>, message: &Message) -> Vec<Message> {
    let mut cleaned: Vec<Message> = list.into_iter().filter(|m| !m.is_temp()).collect();
    if !cleaned.iter().any(|m| m.id == message.id) {
        cleaned.push(message.clone());
    }
    cleaned
}

/// Merge an UPDATE notification. Only the read flag may change, and only
/// from unread to read.
pub fn apply_message_updated(mut list: Vec<Message>, message: &Message) -> Vec<Message> {
    if let Some(existing) = list.iter_mut().find(|m| m.id == message.id) {
        existing.is_read = existing.is_read || message.is_read;
    }
    list
}

/// Mark every message read. Returns the ids that were unread before.
pub fn mark_all_read(mut list: Vec<Message>) -> (Vec<Message>, Vec<MessageId>) {
    let mut flipped = Vec::new();
    for message in list.iter_mut().filter(|m| !m.is_read) {
        message.is_read = true;
        flipped.push(message.id.clone());
    }
    (list, flipped)
}

/// Undo [`mark_all_read`] for exactly the given ids.
pub fn unmark_read(mut list: Vec<Message>, ids: &[MessageId]) -> Vec<Message> {
    for message in list.iter_mut().filter(|m| ids.contains(&m.id)) {
        message.is_read = false;
    }
    list
}

pub fn remove_message(list: Vec<Message>, id: &MessageId) -> Vec<Message> {
    list.into_iter().filter(|m| &m.id != id).collect()
}

impl CacheStore {
    /// `None` until the thread has been fetched or written to.
    pub fn messages(&self, conversation_id: &ConversationId) -> Option<Vec<Message>> {
        self.read(&CacheKey::Messages(conversation_id.clone()))
            .and_then(CacheValue::into_messages)
    }

    pub fn set_messages(&self, conversation_id: &ConversationId, list: Vec<Message>) {
        debug!(conversation = %conversation_id, count = list.len(), "thread replaced");
        self.write(
            CacheKey::Messages(conversation_id.clone()),
            CacheValue::Messages(list),
        );
    }

    /// Apply `f` to the thread, starting from an empty list if it is not
    /// cached yet.
    pub fn patch_messages<F>(&self, conversation_id: &ConversationId, f: F)
    where
        F: FnOnce(Vec<Message>) -> Vec<Message>,
    {
        self.patch(CacheKey::Messages(conversation_id.clone()), |prev| {
            let list = prev.and_then(CacheValue::into_messages).unwrap_or_default();
            Some(CacheValue::Messages(f(list)))
        });
    }

    /// Apply `f` only if the thread is cached. Returns whether it was.
    pub fn update_messages<F>(&self, conversation_id: &ConversationId, f: F) -> bool
    where
        F: FnOnce(Vec<Message>) -> Vec<Message>,
    {
        let mut applied = false;
        self.patch(CacheKey::Messages(conversation_id.clone()), |prev| match prev {
            Some(CacheValue::Messages(list)) => {
                applied = true;
                Some(CacheValue::Messages(f(list)))
            }
            other => other,
        });
        applied
    }

    pub fn apply_message_to_thread(&self, message: &Message) -> bool {
        self.update_messages(&message.conversation_id, |list| {
            reconcile_inserted(list, message)
        })
    }

    pub fn apply_message_update(&self, message: &Message) -> bool {
        self.update_messages(&message.conversation_id, |list| {
            apply_message_updated(list, message)
        })
    }

    /// Returns the ids this call flipped to read.
    pub fn mark_thread_read(&self, conversation_id: &ConversationId) -> Vec<MessageId> {
        let mut flipped = Vec::new();
        self.update_messages(conversation_id, |list| {
            let (list, ids) = mark_all_read(list);
            flipped = ids;
            list
        });
        flipped
    }

    pub fn unmark_thread_read(&self, conversation_id: &ConversationId, ids: &[MessageId]) {
        if ids.is_empty() {
            return;
        }
        self.update_messages(conversation_id, |list| unmark_read(list, ids));
    }
}
