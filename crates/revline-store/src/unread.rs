//! Unread accounting.
//!
//! Per-conversation counts live on the cached [`Conversation`] rows. The
//! global total is never stored: it is summed from the list every time it
//! is read, so it cannot drift from the per-conversation values.

use std::collections::BTreeMap;

use serde::Serialize;

use revline_shared::types::ConversationId;
use revline_shared::Conversation;

use crate::store::CacheStore;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UnreadSnapshot {
    pub per_conversation: BTreeMap<ConversationId, u32>,
    pub total: u64,
}

impl UnreadSnapshot {
    pub fn from_conversations(list: &[Conversation]) -> Self {
        Self {
            per_conversation: list
                .iter()
                .map(|c| (c.id.clone(), c.unread_count))
                .collect(),
            total: total(list),
        }
    }

    pub fn count(&self, id: &ConversationId) -> u32 {
        self.per_conversation.get(id).copied().unwrap_or(0)
    }

    /// The total equals the sum of the per-conversation counts.
    pub fn is_consistent(&self) -> bool {
        self.total == self.per_conversation.values().map(|c| u64::from(*c)).sum::<u64>()
    }
}

pub fn total(list: &[Conversation]) -> u64 {
    list.iter().map(|c| u64::from(c.unread_count)).sum()
}

pub fn increment(count: u32) -> u32 {
    count.saturating_add(1)
}

/// Give back a count that was optimistically cleared, keeping whatever
/// arrived since.
pub fn restore(current: u32, cleared: u32) -> u32 {
    current.saturating_add(cleared)
}

impl CacheStore {
    /// The single accessor for badge counts.
    pub fn unread(&self) -> UnreadSnapshot {
        self.conversations()
            .map(|list| UnreadSnapshot::from_conversations(&list))
            .unwrap_or_default()
    }

    pub fn unread_total(&self) -> u64 {
        self.conversations().map(|list| total(&list)).unwrap_or(0)
    }
}
