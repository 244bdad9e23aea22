//! Optimistic mutations.
//!
//! Every user action patches the cache first, then calls the backend, then
//! either confirms or rolls the patch back. An [`OperationRecord`] follows
//! each action from `Pending` to exactly one terminal state.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use revline_shared::constants::{DEFAULT_IMAGE_MIME, IMAGE_SUMMARY_TEXT};
use revline_shared::content::{ImageDescriptor, MessageContent};
use revline_shared::types::{ConversationId, MessageId, UserId};
use revline_shared::{ErrorKind, Message, SyncError};
use revline_store::messages::remove_message;
use revline_store::{CacheKey, CacheStore, CacheValue, Snapshot};

use crate::backend::Backend;
use crate::events::{EngineEvent, EventSink};
use crate::notifications::MembershipGuard;
use crate::refresh::Refresher;
use crate::registry::SessionRegistry;
use crate::state::SharedSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    SendText,
    SendImage,
    MarkRead,
    DeleteConversation,
    StartConversation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MutationState {
    Pending,
    Confirmed,
    RolledBack,
}

/// Lifecycle of one optimistic operation.
#[derive(Debug, Clone)]
pub struct OperationRecord {
    pub id: u64,
    pub kind: OperationKind,
    pub conversation_id: ConversationId,
    /// Placeholder id of the optimistic message (send operations only).
    pub temp_key: Option<MessageId>,
    pub state: MutationState,
    /// Cache slices as they were before the optimistic patch.
    pub snapshot_before: Snapshot,
    /// The server's copy of a sent message.
    pub confirmed: Option<Message>,
    pub error: Option<SyncError>,
}

impl OperationRecord {
    fn new(id: u64, kind: OperationKind, conversation_id: ConversationId, snapshot_before: Snapshot) -> Self {
        Self {
            id,
            kind,
            conversation_id,
            temp_key: None,
            state: MutationState::Pending,
            snapshot_before,
            confirmed: None,
            error: None,
        }
    }

    fn confirm(&mut self) {
        debug_assert_eq!(self.state, MutationState::Pending);
        if self.state == MutationState::Pending {
            self.state = MutationState::Confirmed;
        }
    }

    fn roll_back(&mut self, error: SyncError) {
        debug_assert_eq!(self.state, MutationState::Pending);
        if self.state == MutationState::Pending {
            self.state = MutationState::RolledBack;
            self.error = Some(error);
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.state == MutationState::Confirmed
    }
}

/// Strictly increasing `temp-<millis>` ids, even within one millisecond.
#[derive(Debug, Default)]
pub struct TempIdGenerator {
    last: AtomicU64,
}

impl TempIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> MessageId {
        let now = u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0);
        let mut prev = self.last.load(Ordering::SeqCst);
        loop {
            let candidate = now.max(prev + 1);
            match self
                .last
                .compare_exchange(prev, candidate, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return MessageId::temp(candidate),
                Err(actual) => prev = actual,
            }
        }
    }
}

/// Temp ids of sends still awaiting the backend. Thread refetches keep
/// these placeholders and drop every other `temp-*` entry.
#[derive(Debug, Clone, Default)]
pub struct PendingSends {
    inner: Arc<Mutex<HashSet<MessageId>>>,
}

impl PendingSends {
    fn lock(&self) -> MutexGuard<'_, HashSet<MessageId>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert(&self, id: MessageId) {
        self.lock().insert(id);
    }

    pub fn remove(&self, id: &MessageId) {
        self.lock().remove(id);
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.lock().contains(id)
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

/// Image handed over by the picker.
#[derive(Debug, Clone)]
pub struct ImageUpload {
    pub bytes: Bytes,
    pub mime: Option<String>,
    /// Device-local URI shown until the upload is confirmed.
    pub local_uri: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

pub struct MutationCoordinator {
    backend: Arc<dyn Backend>,
    store: CacheStore,
    session: SharedSession,
    events: EventSink,
    registry: SessionRegistry,
    refresher: Arc<Refresher>,
    guard: Arc<MembershipGuard>,
    pending: PendingSends,
    temp_ids: TempIdGenerator,
    next_op: AtomicU64,
    reconcile_delay: std::time::Duration,
}

impl MutationCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        backend: Arc<dyn Backend>,
        store: CacheStore,
        session: SharedSession,
        events: EventSink,
        registry: SessionRegistry,
        refresher: Arc<Refresher>,
        guard: Arc<MembershipGuard>,
        pending: PendingSends,
        reconcile_delay: std::time::Duration,
    ) -> Self {
        Self {
            backend,
            store,
            session,
            events,
            registry,
            refresher,
            guard,
            pending,
            temp_ids: TempIdGenerator::new(),
            next_op: AtomicU64::new(1),
            reconcile_delay,
        }
    }

    fn session_user(&self) -> Result<(UserId, u64), SyncError> {
        let state = self.session.lock();
        let user = state.user_id.clone().ok_or(SyncError::NotSignedIn)?;
        Ok((user, state.generation))
    }

    fn record(&self, kind: OperationKind, conversation_id: &ConversationId, keys: &[CacheKey]) -> OperationRecord {
        let id = self.next_op.fetch_add(1, Ordering::SeqCst);
        OperationRecord::new(id, kind, conversation_id.clone(), self.store.snapshot(keys))
    }

    // -----------------------------------------------------------------------
    // send
    // -----------------------------------------------------------------------

    pub async fn send_text(&self, conversation_id: &ConversationId, text: &str) -> Result<OperationRecord, SyncError> {
        let body = text.trim();
        if body.is_empty() {
            return Err(SyncError::Validation("message is empty".into()));
        }
        let (user, generation) = self.session_user()?;

        let key = CacheKey::Messages(conversation_id.clone());
        let mut record = self.record(OperationKind::SendText, conversation_id, &[key]);
        let optimistic = self.place_optimistic(&mut record, &user, body.to_string(), None);

        let result = self
            .backend
            .send_message(conversation_id, &user, body, body)
            .await
            .map_err(SyncError::from);

        self.finish_send(record, optimistic, result, generation).await
    }

    pub async fn send_image(
        &self,
        conversation_id: &ConversationId,
        image: ImageUpload,
    ) -> Result<OperationRecord, SyncError> {
        let ImageUpload {
            bytes,
            mime,
            local_uri,
            width,
            height,
        } = image;
        if bytes.is_empty() {
            return Err(SyncError::Validation("image is empty".into()));
        }
        let (user, generation) = self.session_user()?;
        let mime = mime
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| DEFAULT_IMAGE_MIME.to_string());

        let key = CacheKey::Messages(conversation_id.clone());
        let mut record = self.record(OperationKind::SendImage, conversation_id, &[key]);
        let placeholder = ImageDescriptor::new(None, mime.clone()).with_dimensions(width, height);
        let optimistic = self.place_optimistic(
            &mut record,
            &user,
            MessageContent::Image(placeholder).encode(),
            Some(local_uri),
        );

        let result = match self.backend.upload_image(conversation_id, bytes, &mime).await {
            Ok(path) => {
                let descriptor = ImageDescriptor::new(Some(path), mime).with_dimensions(width, height);
                let content = MessageContent::Image(descriptor).encode();
                self.backend
                    .send_message(conversation_id, &user, &content, IMAGE_SUMMARY_TEXT)
                    .await
            }
            Err(e) => Err(e),
        }
        .map_err(SyncError::from);

        self.finish_send(record, optimistic, result, generation).await
    }

    fn place_optimistic(
        &self,
        record: &mut OperationRecord,
        user: &UserId,
        content: String,
        local_uri: Option<String>,
    ) -> Message {
        let message = Message {
            id: self.temp_ids.next_id(),
            conversation_id: record.conversation_id.clone(),
            sender_id: user.clone(),
            content,
            created_at: Utc::now(),
            is_read: false,
            local_uri,
        };
        record.temp_key = Some(message.id.clone());
        self.pending.insert(message.id.clone());

        let placed = message.clone();
        self.store.patch_messages(&record.conversation_id, move |mut list| {
            list.push(placed);
            list
        });
        debug!(conversation = %record.conversation_id, temp = %message.id, "Optimistic message placed");
        message
    }

    async fn finish_send(
        &self,
        mut record: OperationRecord,
        optimistic: Message,
        result: Result<Message, SyncError>,
        generation: u64,
    ) -> Result<OperationRecord, SyncError> {
        self.pending.remove(&optimistic.id);

        let outcome = match result {
            Ok(message) => {
                // The realtime echo replaces the placeholder.
                info!(conversation = %record.conversation_id, message = %message.id, "Message confirmed");
                record.confirmed = Some(message);
                record.confirm();
                Ok(record.clone())
            }
            Err(error) => {
                if self.session.is_current(generation) {
                    self.roll_back_send(&record, &optimistic.id);
                }
                self.fail(&mut record, error, generation).await
            }
        };

        self.schedule_reconcile(record.conversation_id.clone(), generation);
        outcome
    }

    /// Strip the placeholder in one patch so messages that arrived while
    /// the send was in flight survive. A thread that was not cached before
    /// and is empty again goes back to not cached.
    fn roll_back_send(&self, record: &OperationRecord, temp: &MessageId) {
        let key = CacheKey::Messages(record.conversation_id.clone());
        let was_cached = matches!(record.snapshot_before.get(&key), Some(Some(_)));
        self.store.patch(key, |prev| match prev {
            Some(CacheValue::Messages(list)) => {
                let list = remove_message(list, temp);
                if list.is_empty() && !was_cached {
                    None
                } else {
                    Some(CacheValue::Messages(list))
                }
            }
            other => other,
        });
        debug!(conversation = %record.conversation_id, temp = %temp, "Optimistic message rolled back");
    }

    /// Classify a failure after rollback. Network and permission failures
    /// are recovered here; validation and unknown failures reach the caller.
    async fn fail(
        &self,
        record: &mut OperationRecord,
        error: SyncError,
        generation: u64,
    ) -> Result<OperationRecord, SyncError> {
        warn!(
            operation = ?record.kind,
            conversation = %record.conversation_id,
            error = %error,
            "Mutation rolled back"
        );
        record.roll_back(error.clone());

        match error.kind() {
            ErrorKind::Network => Ok(record.clone()),
            ErrorKind::Permission => {
                if self.session.is_current(generation) && record.kind != OperationKind::DeleteConversation {
                    self.guard.recheck_membership(&record.conversation_id).await;
                }
                Ok(record.clone())
            }
            ErrorKind::Unknown => {
                if self.session.is_current(generation) {
                    self.events.emit(EngineEvent::ErrorAlert {
                        operation: record.kind,
                        message: error.to_string(),
                    });
                }
                Err(error)
            }
            ErrorKind::Validation => Err(error),
        }
    }

    fn schedule_reconcile(&self, conversation_id: ConversationId, generation: u64) {
        let refresher = self.refresher.clone();
        let session = self.session.clone();
        let delay = self.reconcile_delay;
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !session.is_current(generation) {
                return;
            }
            if let Err(e) = refresher.refresh_thread(&conversation_id).await {
                debug!(conversation = %conversation_id, error = %e, "Reconciliation refetch failed");
            }
        });
        self.registry.track_task(task.abort_handle());
    }

    // -----------------------------------------------------------------------
    // mark read
    // -----------------------------------------------------------------------

    pub async fn mark_read(&self, conversation_id: &ConversationId) -> Result<OperationRecord, SyncError> {
        let (user, generation) = self.session_user()?;
        let mut record = self.record(
            OperationKind::MarkRead,
            conversation_id,
            &[CacheKey::Conversations, CacheKey::Messages(conversation_id.clone())],
        );

        let cleared = self.store.reset_conversation_unread(conversation_id).unwrap_or(0);
        let flipped = self.store.mark_thread_read(conversation_id);
        debug!(conversation = %conversation_id, cleared, flipped = flipped.len(), "Marked read locally");

        match self.backend.mark_messages_as_read(conversation_id, &user).await {
            Ok(()) => {
                record.confirm();
                if let Err(e) = self.refresher.refresh_unread(conversation_id).await {
                    debug!(conversation = %conversation_id, error = %e, "Unread recount failed");
                }
            }
            Err(e) => {
                warn!(conversation = %conversation_id, error = %e, "Failed to mark messages as read");
                record.roll_back(e.into());
                if self.session.is_current(generation) {
                    // Feed updates that landed meanwhile stay; only our own
                    // patch is undone.
                    self.store.restore_conversation_unread(conversation_id, cleared);
                    self.store.unmark_thread_read(conversation_id, &flipped);
                    self.resync_inbox().await;
                }
            }
        }
        Ok(record)
    }

    /// Mark the inbox stale and refetch it. A failed refetch leaves it
    /// stale for the next recovery.
    async fn resync_inbox(&self) {
        self.store.invalidate(&CacheKey::Conversations);
        if let Err(e) = self.refresher.refresh_conversations().await {
            warn!(error = %e, "Inbox refetch after rollback failed");
        }
    }

    /// Fire-and-forget variant; the task is aborted on sign-out.
    pub fn mark_read_detached(
        self: &Arc<Self>,
        conversation_id: ConversationId,
    ) -> JoinHandle<Result<OperationRecord, SyncError>> {
        let this = self.clone();
        let task = tokio::spawn(async move { this.mark_read(&conversation_id).await });
        self.registry.track_task(task.abort_handle());
        task
    }

    // -----------------------------------------------------------------------
    // conversations
    // -----------------------------------------------------------------------

    pub async fn delete_conversation(&self, conversation_id: &ConversationId) -> Result<OperationRecord, SyncError> {
        let (_, generation) = self.session_user()?;
        let mut record = self.record(OperationKind::DeleteConversation, conversation_id, &[CacheKey::Conversations]);

        let removed = self.store.conversation(conversation_id);
        self.store.remove_conversation(conversation_id);

        let result = match self.backend.delete_conversation_if_member(conversation_id).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(SyncError::Permission("not a member of this conversation".into())),
            Err(e) => Err(SyncError::from(e)),
        };

        let outcome = match result {
            Ok(()) => {
                info!(conversation = %conversation_id, "Conversation deleted");
                self.store.remove(&CacheKey::Messages(conversation_id.clone()));
                record.confirm();
                Ok(record.clone())
            }
            Err(error) => {
                if let (Some(conversation), true) = (removed, self.session.is_current(generation)) {
                    self.store.reinsert_conversation(conversation);
                }
                self.fail(&mut record, error, generation).await
            }
        };

        if self.session.is_current(generation) {
            self.resync_inbox().await;
        }
        outcome
    }

    /// Open (or create) the direct conversation with `other_user_id`.
    /// New conversations only enter the cache through the refetch that
    /// follows.
    pub async fn start_direct_conversation(
        &self,
        other_user_id: &UserId,
        initial_message: Option<&str>,
    ) -> Result<ConversationId, SyncError> {
        let (user, generation) = self.session_user()?;
        if other_user_id.as_str().trim().is_empty() {
            return Err(SyncError::Validation("recipient is required".into()));
        }
        if other_user_id == &user {
            return Err(SyncError::Validation("cannot start a conversation with yourself".into()));
        }
        let initial = initial_message.map(str::trim).filter(|m| !m.is_empty());

        let conversation_id = match self.backend.start_direct_conversation(other_user_id, initial).await {
            Ok(id) => id,
            Err(e) => {
                let error = SyncError::from(e);
                warn!(peer = %other_user_id, error = %error, "Failed to start conversation");
                if error.kind() == ErrorKind::Unknown && self.session.is_current(generation) {
                    self.events.emit(EngineEvent::ErrorAlert {
                        operation: OperationKind::StartConversation,
                        message: error.to_string(),
                    });
                }
                return Err(error);
            }
        };

        info!(conversation = %conversation_id, peer = %other_user_id, "Direct conversation ready");
        if let Err(e) = self.refresher.refresh_conversations().await {
            warn!(error = %e, "Inbox refetch after start failed");
        }
        Ok(conversation_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temp_ids_strictly_increase() {
        let ids = TempIdGenerator::new();
        let mut prev = ids.next_id();
        assert!(prev.is_temp());
        for _ in 0..1_000 {
            let next = ids.next_id();
            let a: u64 = prev.as_str()["temp-".len()..].parse().unwrap();
            let b: u64 = next.as_str()["temp-".len()..].parse().unwrap();
            assert!(b > a);
            prev = next;
        }
    }

    #[test]
    fn test_record_reaches_one_terminal_state() {
        let mut record = OperationRecord::new(
            1,
            OperationKind::SendText,
            ConversationId::new("c1"),
            CacheStore::new().snapshot(&[]),
        );
        assert_eq!(record.state, MutationState::Pending);
        record.confirm();
        assert!(record.is_confirmed());
        assert!(record.error.is_none());
    }

    #[test]
    fn test_pending_sends() {
        let pending = PendingSends::default();
        let id = MessageId::temp(1);
        pending.insert(id.clone());
        assert!(pending.contains(&id));
        pending.remove(&id);
        assert!(!pending.contains(&id));
    }
}
