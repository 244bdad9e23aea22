//! Authoritative refetches and the cooldown gate in front of bulk recovery.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use revline_shared::types::{ConversationId, UserId};
use revline_shared::{Conversation, Message, SyncError};
use revline_store::{CacheKey, CacheStore};

use crate::backend::Backend;
use crate::mutation::PendingSends;
use crate::state::SharedSession;

/// Admits at most one caller per window. Calls inside the window are
/// dropped, not queued.
#[derive(Debug)]
pub struct CooldownGate {
    window: Duration,
    last: Mutex<Option<Instant>>,
}

impl CooldownGate {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last: Mutex::new(None),
        }
    }

    pub fn try_acquire(&self) -> bool {
        let now = Instant::now();
        let mut last = self.last.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match *last {
            Some(at) if now.duration_since(at) < self.window => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    pub fn reset(&self) {
        *self.last.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
    }
}

pub struct Refresher {
    backend: Arc<dyn Backend>,
    store: CacheStore,
    session: SharedSession,
    pending: PendingSends,
    page_size: u32,
    gate: CooldownGate,
}

impl Refresher {
    pub fn new(
        backend: Arc<dyn Backend>,
        store: CacheStore,
        session: SharedSession,
        pending: PendingSends,
        page_size: u32,
        cooldown: Duration,
    ) -> Self {
        Self {
            backend,
            store,
            session,
            pending,
            page_size,
            gate: CooldownGate::new(cooldown),
        }
    }

    fn session_user(&self) -> Result<(UserId, u64), SyncError> {
        let state = self.session.lock();
        let user = state.user_id.clone().ok_or(SyncError::NotSignedIn)?;
        Ok((user, state.generation))
    }

    /// Replace the inbox with the server's list.
    pub async fn refresh_conversations(&self) -> Result<Vec<Conversation>, SyncError> {
        let (user, generation) = self.session_user()?;
        let list = self.backend.list_conversations_with_unread(&user).await?;
        if !self.session.is_current(generation) {
            debug!("Discarding inbox fetched for an ended session");
            return Err(SyncError::NotSignedIn);
        }
        self.store.set_conversations(list);
        self.load_peer_presence(generation).await;
        Ok(self.store.conversations().unwrap_or_default())
    }

    /// Presence of every direct-conversation peer. Best effort.
    async fn load_peer_presence(&self, generation: u64) {
        let peers: Vec<UserId> = self
            .store
            .conversations()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|c| c.other_user.map(|u| u.id))
            .collect();
        if peers.is_empty() {
            return;
        }
        match self.backend.fetch_presence(&peers).await {
            Ok(records) if self.session.is_current(generation) => {
                for record in records {
                    self.store.set_presence(record);
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to load peer presence"),
        }
    }

    /// Replace a thread with the server's page, keeping optimistic
    /// messages whose send is still in flight.
    pub async fn refresh_thread(&self, conversation_id: &ConversationId) -> Result<Vec<Message>, SyncError> {
        let (_, generation) = self.session_user()?;
        let fetched = self.backend.list_messages(conversation_id, self.page_size).await?;
        if !self.session.is_current(generation) {
            return Err(SyncError::NotSignedIn);
        }

        let pending = self.pending.clone();
        self.store.patch_messages(conversation_id, |current| {
            let mut merged = fetched;
            merged.extend(current.into_iter().filter(|m| m.is_temp() && pending.contains(&m.id)));
            merged
        });
        debug!(conversation = %conversation_id, "Thread refreshed");
        Ok(self.store.messages(conversation_id).unwrap_or_default())
    }

    /// Overwrite one conversation's unread count with the server's value.
    pub async fn refresh_unread(&self, conversation_id: &ConversationId) -> Result<u32, SyncError> {
        let (user, generation) = self.session_user()?;
        let count = self.backend.get_unread_count(conversation_id, &user).await?;
        if self.session.is_current(generation) {
            self.store.update_conversations(|mut list| {
                if let Some(conv) = list.iter_mut().find(|c| &c.id == conversation_id) {
                    conv.unread_count = count;
                }
                list
            });
        }
        Ok(count)
    }

    /// Gated bulk recovery: refetch the inbox and, if given, one thread.
    /// Returns `false` when the call fell inside the cooldown window. A
    /// stale inbox is refetched regardless of the cooldown.
    pub async fn recover(&self, thread: Option<&ConversationId>) -> bool {
        let admitted = self.gate.try_acquire();
        if !admitted && !self.store.is_stale(&CacheKey::Conversations) {
            debug!("Recovery refresh skipped by cooldown");
            return false;
        }
        info!("Recovering from server state");
        if let Err(e) = self.refresh_conversations().await {
            warn!(error = %e, "Inbox recovery failed");
        }
        if let Some(id) = thread {
            if let Err(e) = self.refresh_thread(id).await {
                warn!(conversation = %id, error = %e, "Thread recovery failed");
            }
        }
        true
    }

    pub fn reset_cooldown(&self) {
        self.gate.reset();
    }
}
