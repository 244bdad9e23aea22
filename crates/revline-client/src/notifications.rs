//! In-app notifications and the membership checks that gate them.

use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info, warn};

use revline_shared::constants::FALLBACK_USERNAME;
use revline_shared::types::{ConversationId, UserId};
use revline_shared::Message;
use revline_store::{CacheKey, CacheStore, CacheValue};

use crate::backend::Backend;
use crate::events::{ChatNotification, EngineEvent, EventSink, TapTarget};
use crate::state::{SessionState, SharedSession};

/// Decides whether the signed-in user still belongs to a conversation and
/// cleans up after them when they no longer do.
pub struct MembershipGuard {
    backend: Arc<dyn Backend>,
    store: CacheStore,
    session: SharedSession,
    events: EventSink,
}

impl MembershipGuard {
    pub fn new(backend: Arc<dyn Backend>, store: CacheStore, session: SharedSession, events: EventSink) -> Self {
        Self {
            backend,
            store,
            session,
            events,
        }
    }

    /// `false` when the check fails.
    pub async fn verify(&self, conversation_id: &ConversationId, user_id: &UserId) -> bool {
        match self.backend.is_participant(conversation_id, user_id).await {
            Ok(member) => member,
            Err(e) => {
                warn!(conversation = %conversation_id, error = %e, "Membership check failed");
                false
            }
        }
    }

    /// Ask the backend again and drop the conversation if access is gone.
    /// A failed check keeps the conversation; returns whether it was kept.
    pub async fn recheck_membership(&self, conversation_id: &ConversationId) -> bool {
        let generation = self.session.generation();
        let Some(user) = self.session.user_if_current(generation) else {
            return false;
        };

        let member = match self.backend.is_participant(conversation_id, &user).await {
            Ok(member) => member,
            Err(e) => {
                warn!(conversation = %conversation_id, error = %e, "Membership re-check failed");
                return true;
            }
        };
        if !self.session.is_current(generation) {
            return false;
        }

        if member {
            self.store.write(
                CacheKey::Membership(conversation_id.clone()),
                CacheValue::Membership(true),
            );
        } else {
            self.membership_revoked(conversation_id);
        }
        member
    }

    /// Forget a conversation the user lost access to.
    pub fn membership_revoked(&self, conversation_id: &ConversationId) {
        info!(conversation = %conversation_id, "Membership revoked");
        self.store.remove_conversation(conversation_id);
        self.store.remove(&CacheKey::Messages(conversation_id.clone()));
        self.store.write(
            CacheKey::Membership(conversation_id.clone()),
            CacheValue::Membership(false),
        );
        self.events
            .emit(EngineEvent::ConversationDeleted(conversation_id.clone()));
    }
}

/// Payload attached to a notification tap.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TapPayload {
    pub conversation_id: Option<String>,
    pub sender_id: Option<String>,
}

/// Whether a new message should not raise a notification.
pub fn should_suppress(state: &SessionState, message: &Message) -> bool {
    let Some(ref user) = state.user_id else {
        return true;
    };
    &message.sender_id == user
        || state.active_thread() == Some(&message.conversation_id)
        || state.screen.is_pre_session()
}

pub struct NotificationDispatcher {
    backend: Arc<dyn Backend>,
    store: CacheStore,
    session: SharedSession,
    events: EventSink,
    guard: Arc<MembershipGuard>,
}

impl NotificationDispatcher {
    pub fn new(
        backend: Arc<dyn Backend>,
        store: CacheStore,
        session: SharedSession,
        events: EventSink,
        guard: Arc<MembershipGuard>,
    ) -> Self {
        Self {
            backend,
            store,
            session,
            events,
            guard,
        }
    }

    /// Emit a notification for `message` unless it is suppressed. Returns
    /// what was emitted.
    pub async fn dispatch(&self, message: &Message, generation: u64) -> Option<ChatNotification> {
        let user = self.session.user_if_current(generation)?;
        if should_suppress(&self.session.snapshot(), message) {
            return None;
        }

        if !self.guard.verify(&message.conversation_id, &user).await {
            debug!(conversation = %message.conversation_id, "Notification dropped: not a member");
            return None;
        }

        let username = match self.backend.get_username(&message.sender_id).await {
            Ok(Some(name)) if !name.trim().is_empty() => name,
            Ok(_) => FALLBACK_USERNAME.to_string(),
            Err(e) => {
                debug!(user = %message.sender_id, error = %e, "Username lookup failed");
                FALLBACK_USERNAME.to_string()
            }
        };

        // The user may have opened the thread or signed out meanwhile.
        let state = self.session.snapshot();
        if state.generation != generation || should_suppress(&state, message) {
            return None;
        }

        let notification = ChatNotification {
            id: message.id.clone(),
            conversation_id: message.conversation_id.clone(),
            from_user_id: message.sender_id.clone(),
            username,
            preview: message.parsed_content().preview(),
            created_at: message.created_at,
        };
        debug!(conversation = %notification.conversation_id, from = %notification.from_user_id, "Notification");
        self.events.emit(EngineEvent::Notification(notification.clone()));
        Some(notification)
    }

    /// Turn a tap into a navigation target and hand it to the UI.
    pub fn resolve_tap(&self, payload: &TapPayload) -> Option<TapTarget> {
        let conversation_id = payload
            .conversation_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .map(ConversationId::new)?;

        let other_user_id = payload
            .sender_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .map(UserId::new)
            .or_else(|| {
                self.store
                    .conversation(&conversation_id)
                    .and_then(|c| c.other_user)
                    .map(|u| u.id)
            });

        let target = TapTarget {
            conversation_id,
            other_user_id,
        };
        self.events.emit(EngineEvent::OpenThread(target.clone()));
        Some(target)
    }
}
