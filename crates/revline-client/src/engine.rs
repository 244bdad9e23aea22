//! The sync engine: one session, one event loop, one cache.
//!
//! Realtime notifications arrive on the feed bus tagged with the
//! subscription they came from. The loop applies each one to the cache
//! synchronously and spawns whatever network follow-up it needs (mark-read,
//! notification checks, membership re-checks) as tasks owned by the
//! session registry, so sign-out cancels all of them at once.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use revline_feed::{FeedAdapter, FeedEvent, FeedScope, RealtimeTransport, ScopedEvent};
use revline_shared::types::{ConversationId, MessageId, UserId};
use revline_shared::{Conversation, Message, SyncError};
use revline_store::{CacheStore, UnreadSnapshot};

use crate::backend::Backend;
use crate::config::EngineConfig;
use crate::events::{EngineEvent, EventSink, TapTarget};
use crate::mutation::{ImageUpload, MutationCoordinator, OperationRecord, PendingSends};
use crate::notifications::{MembershipGuard, NotificationDispatcher, TapPayload};
use crate::presence::{HeartbeatManager, HeartbeatState};
use crate::refresh::Refresher;
use crate::registry::SessionRegistry;
use crate::state::{Screen, SessionState, SharedSession};

/// Inbox message ids remembered to drop duplicate deliveries.
const SEEN_CAPACITY: usize = 256;

#[derive(Default)]
struct SeenMessages {
    order: VecDeque<MessageId>,
    ids: HashSet<MessageId>,
}

impl SeenMessages {
    /// `false` if the id was already seen.
    fn insert(&mut self, id: &MessageId) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() == SEEN_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.order.push_back(id.clone());
        self.ids.insert(id.clone());
        true
    }

    fn clear(&mut self) {
        self.order.clear();
        self.ids.clear();
    }
}

struct Inner {
    config: EngineConfig,
    backend: Arc<dyn Backend>,
    store: CacheStore,
    session: SharedSession,
    events: EventSink,
    registry: SessionRegistry,
    feed: FeedAdapter,
    bus: Mutex<Option<mpsc::UnboundedReceiver<ScopedEvent>>>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
    heartbeat: HeartbeatManager,
    refresher: Arc<Refresher>,
    coordinator: Arc<MutationCoordinator>,
    guard: Arc<MembershipGuard>,
    dispatcher: Arc<NotificationDispatcher>,
    pending: PendingSends,
    seen: Mutex<SeenMessages>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Cloneable handle to the engine.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<Inner>,
}

impl SyncEngine {
    pub fn new(config: EngineConfig, backend: Arc<dyn Backend>, transport: Arc<dyn RealtimeTransport>) -> Self {
        let store = CacheStore::new();
        let session = SharedSession::new();
        let events = EventSink::new();
        let registry = SessionRegistry::new();
        let pending = PendingSends::default();

        let (bus_tx, bus_rx) = mpsc::unbounded_channel();
        let feed = FeedAdapter::new(transport, bus_tx);

        let heartbeat = HeartbeatManager::new(
            backend.clone(),
            store.clone(),
            config.heartbeat_interval,
            config.online_threshold_secs,
        );
        let refresher = Arc::new(Refresher::new(
            backend.clone(),
            store.clone(),
            session.clone(),
            pending.clone(),
            config.thread_page_size,
            config.refresh_cooldown,
        ));
        let guard = Arc::new(MembershipGuard::new(
            backend.clone(),
            store.clone(),
            session.clone(),
            events.clone(),
        ));
        let dispatcher = Arc::new(NotificationDispatcher::new(
            backend.clone(),
            store.clone(),
            session.clone(),
            events.clone(),
            guard.clone(),
        ));
        let coordinator = Arc::new(MutationCoordinator::new(
            backend.clone(),
            store.clone(),
            session.clone(),
            events.clone(),
            registry.clone(),
            refresher.clone(),
            guard.clone(),
            pending.clone(),
            config.reconcile_delay,
        ));

        Self {
            inner: Arc::new(Inner {
                config,
                backend,
                store,
                session,
                events,
                registry,
                feed,
                bus: Mutex::new(Some(bus_rx)),
                event_loop: Mutex::new(None),
                heartbeat,
                refresher,
                coordinator,
                guard,
                dispatcher,
                pending,
                seen: Mutex::new(SeenMessages::default()),
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn store(&self) -> &CacheStore {
        &self.inner.store
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    pub fn session(&self) -> SessionState {
        self.inner.session.snapshot()
    }

    pub fn heartbeat_state(&self) -> HeartbeatState {
        self.inner.heartbeat.state()
    }

    pub fn active_scopes(&self) -> Vec<FeedScope> {
        self.inner.registry.active_scopes()
    }

    pub fn live_tasks(&self) -> usize {
        self.inner.registry.live_tasks()
    }

    pub fn unread(&self) -> UnreadSnapshot {
        self.inner.store.unread()
    }

    /// Profile-derived presence or membership in the live presence channel.
    pub fn is_online(&self, user_id: &UserId) -> bool {
        self.inner.store.is_reachable_at(user_id, Utc::now())
    }

    // -----------------------------------------------------------------------
    // Session lifecycle
    // -----------------------------------------------------------------------

    /// Start a session: subscribe, start the heartbeat and load the inbox.
    /// Feed and fetch failures are logged; the session starts regardless.
    pub async fn sign_in(&self, user_id: UserId) -> Result<(), SyncError> {
        if user_id.as_str().trim().is_empty() {
            return Err(SyncError::Validation("user id is required".into()));
        }
        let inner = &self.inner;
        if inner.session.user_id().is_some() {
            self.sign_out().await;
        }

        let generation = inner.session.begin(user_id.clone());
        info!(user = %user_id, generation, "Signing in");
        self.ensure_event_loop();
        inner.refresher.reset_cooldown();

        match inner.feed.subscribe(FeedScope::Inbox) {
            Ok(handle) => inner.registry.add_subscription(handle),
            Err(e) => warn!(error = %e, "Inbox subscription failed"),
        }
        match inner.feed.subscribe_presence(&user_id) {
            Ok(handle) => inner.registry.add_subscription(handle),
            Err(e) => warn!(error = %e, "Presence subscription failed"),
        }

        inner.heartbeat.start(user_id).await;

        if let Err(e) = inner.refresher.refresh_conversations().await {
            warn!(error = %e, "Initial inbox load failed");
        }
        Ok(())
    }

    /// End the session. Heartbeat first, then subscriptions and tasks, then
    /// the cache.
    pub async fn sign_out(&self) {
        let inner = &self.inner;
        let Some(user) = inner.session.end() else {
            return;
        };
        inner.heartbeat.stop().await;
        inner.registry.teardown();
        inner.pending.clear();
        inner.store.clear();
        lock(&inner.seen).clear();
        info!(user = %user, "Signed out");
    }

    /// Stop the event loop. The engine cannot be signed into again.
    pub async fn shutdown(&self) {
        self.sign_out().await;
        if let Some(task) = lock(&self.inner.event_loop).take() {
            task.abort();
        }
    }

    fn ensure_event_loop(&self) {
        let Some(mut rx) = lock(&self.inner.bus).take() else {
            return;
        };
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            while let Some(scoped) = rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                SyncEngine { inner }.apply_event(scoped);
            }
            debug!("Engine event loop stopped");
        });
        *lock(&self.inner.event_loop) = Some(task);
    }

    // -----------------------------------------------------------------------
    // Realtime events
    // -----------------------------------------------------------------------

    fn apply_event(&self, scoped: ScopedEvent) {
        let inner = &self.inner;
        let ScopedEvent { scope, event } = scoped;

        let (user, generation) = {
            let state = inner.session.lock();
            match state.user_id.clone() {
                Some(user) => (user, state.generation),
                None => {
                    debug!(scope = %scope, "Event outside a session dropped");
                    return;
                }
            }
        };
        if !inner.registry.has_subscription(&scope) {
            debug!(scope = %scope, "Event from a closed subscription dropped");
            return;
        }

        match event {
            FeedEvent::MessageInserted(message) => {
                if scope == FeedScope::Inbox {
                    self.on_inbox_message(message, &user, generation);
                } else {
                    inner.store.apply_message_to_thread(&message);
                }
            }
            FeedEvent::MessageUpdated(message) => {
                inner.store.apply_message_update(&message);
                if scope == FeedScope::Inbox {
                    // Read receipts move unread counts on other devices too.
                    let refresher = inner.refresher.clone();
                    let thread = inner.session.lock().active_thread().cloned();
                    self.spawn_tracked(async move {
                        refresher.recover(thread.as_ref()).await;
                    });
                }
            }
            FeedEvent::ConversationUpdated(update) => {
                inner.store.apply_conversation_update(&update);
            }
            FeedEvent::ProfileUpdated(update) => {
                if let Some(ref name) = update.username {
                    inner.store.rename_peer(&update.presence.user_id, name);
                }
                inner.store.set_presence(update.presence);
            }
            FeedEvent::PresenceSync(online) => {
                debug!(online = online.len(), "Presence sync");
                inner.store.set_online_users(online);
            }
            FeedEvent::ParticipantRemoved {
                conversation_id,
                user_id,
            } => match user_id {
                Some(ref removed) if removed == &user => inner.guard.membership_revoked(&conversation_id),
                Some(removed) => {
                    debug!(conversation = %conversation_id, user = %removed, "Peer left conversation");
                }
                None => {
                    let guard = inner.guard.clone();
                    self.spawn_tracked(async move {
                        guard.recheck_membership(&conversation_id).await;
                    });
                }
            },
            FeedEvent::ConversationDeleted(conversation_id) => {
                inner.guard.membership_revoked(&conversation_id);
            }
        }
    }

    fn on_inbox_message(&self, message: Message, user: &UserId, generation: u64) {
        let inner = &self.inner;
        if !lock(&inner.seen).insert(&message.id) {
            debug!(message = %message.id, "Duplicate delivery ignored");
            return;
        }

        inner.store.apply_message_to_thread(&message);
        inner.store.apply_message_to_inbox(&message, user);

        let from_peer = &message.sender_id != user;
        if from_peer && inner.session.lock().is_viewing(&message.conversation_id) {
            inner.coordinator.mark_read_detached(message.conversation_id.clone());
        }

        let dispatcher = inner.dispatcher.clone();
        self.spawn_tracked(async move {
            dispatcher.dispatch(&message, generation).await;
        });
    }

    fn spawn_tracked<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let task = tokio::spawn(future);
        self.inner.registry.track_task(task.abort_handle());
    }

    // -----------------------------------------------------------------------
    // Navigation and app lifecycle
    // -----------------------------------------------------------------------

    pub fn set_screen(&self, screen: Screen) {
        self.inner.session.lock().screen = screen;
    }

    /// Show a thread: subscribe to it, load it, and mark it read.
    pub async fn open_thread(
        &self,
        conversation_id: &ConversationId,
        peer: Option<&UserId>,
    ) -> Result<Vec<Message>, SyncError> {
        let inner = &self.inner;
        let (user, generation) = {
            let mut state = inner.session.lock();
            let user = state.user_id.clone().ok_or(SyncError::NotSignedIn)?;
            state.screen = Screen::ChatThread(conversation_id.clone());
            (user, state.generation)
        };

        let mut scopes = vec![FeedScope::Thread(conversation_id.clone())];
        if let Some(peer) = peer {
            scopes.push(FeedScope::Peer(peer.clone()));
        }
        for scope in scopes {
            if inner.registry.has_subscription(&scope) {
                continue;
            }
            match inner.feed.subscribe(scope.clone()) {
                Ok(handle) => inner.registry.add_subscription(handle),
                Err(e) => warn!(scope = %scope, error = %e, "Thread subscription failed"),
            }
        }

        let messages = match inner.refresher.refresh_thread(conversation_id).await {
            Ok(messages) => messages,
            Err(e) => {
                warn!(conversation = %conversation_id, error = %e, "Thread load failed, showing cache");
                inner.store.messages(conversation_id).unwrap_or_default()
            }
        };

        if let Some(peer) = peer {
            match inner.backend.fetch_presence(std::slice::from_ref(peer)).await {
                Ok(records) if inner.session.is_current(generation) => {
                    for record in records {
                        inner.store.set_presence(record);
                    }
                }
                Ok(_) => {}
                Err(e) => debug!(user = %peer, error = %e, "Peer presence load failed"),
            }
        }

        let unread = inner
            .store
            .conversation(conversation_id)
            .map_or(0, |c| c.unread_count);
        let unread_messages = messages.iter().any(|m| !m.is_read && m.sender_id != user);
        if unread > 0 || unread_messages {
            inner.coordinator.mark_read(conversation_id).await?;
        }

        Ok(inner.store.messages(conversation_id).unwrap_or_default())
    }

    /// Leave a thread and drop its subscriptions.
    pub fn close_thread(&self, conversation_id: &ConversationId) {
        let inner = &self.inner;
        {
            let mut state = inner.session.lock();
            if state.active_thread() == Some(conversation_id) {
                state.screen = Screen::Inbox;
            }
        }
        inner
            .registry
            .close_subscription(&FeedScope::Thread(conversation_id.clone()));
        for scope in inner.registry.active_scopes() {
            if matches!(scope, FeedScope::Peer(_)) {
                inner.registry.close_subscription(&scope);
            }
        }
    }

    pub async fn app_foreground(&self) {
        let inner = &self.inner;
        let thread = {
            let mut state = inner.session.lock();
            state.foreground = true;
            if state.user_id.is_none() {
                return;
            }
            state.active_thread().cloned()
        };

        inner.heartbeat.on_foreground().await;
        inner.refresher.recover(thread.as_ref()).await;

        if let Some(id) = thread {
            let unread = inner.store.conversation(&id).map_or(0, |c| c.unread_count);
            if unread > 0 {
                if let Err(e) = inner.coordinator.mark_read(&id).await {
                    debug!(conversation = %id, error = %e, "Mark read on resume failed");
                }
            }
        }
    }

    pub async fn app_background(&self) {
        self.inner.session.lock().foreground = false;
        self.inner.heartbeat.on_background().await;
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    pub async fn send_text(&self, conversation_id: &ConversationId, text: &str) -> Result<OperationRecord, SyncError> {
        self.inner.coordinator.send_text(conversation_id, text).await
    }

    pub async fn send_image(
        &self,
        conversation_id: &ConversationId,
        image: ImageUpload,
    ) -> Result<OperationRecord, SyncError> {
        self.inner.coordinator.send_image(conversation_id, image).await
    }

    pub async fn mark_read(&self, conversation_id: &ConversationId) -> Result<OperationRecord, SyncError> {
        self.inner.coordinator.mark_read(conversation_id).await
    }

    pub fn mark_read_detached(
        &self,
        conversation_id: ConversationId,
    ) -> JoinHandle<Result<OperationRecord, SyncError>> {
        self.inner.coordinator.mark_read_detached(conversation_id)
    }

    pub async fn delete_conversation(&self, conversation_id: &ConversationId) -> Result<OperationRecord, SyncError> {
        self.inner.coordinator.delete_conversation(conversation_id).await
    }

    pub async fn start_direct_conversation(
        &self,
        other_user_id: &UserId,
        initial_message: Option<&str>,
    ) -> Result<ConversationId, SyncError> {
        self.inner
            .coordinator
            .start_direct_conversation(other_user_id, initial_message)
            .await
    }

    pub async fn refresh_conversations(&self) -> Result<Vec<Conversation>, SyncError> {
        self.inner.refresher.refresh_conversations().await
    }

    // -----------------------------------------------------------------------
    // Misc
    // -----------------------------------------------------------------------

    /// Display URL for a stored image: signed when possible, public otherwise.
    pub async fn image_url(&self, path: &str) -> String {
        let inner = &self.inner;
        match inner
            .backend
            .get_signed_url(path, inner.config.signed_url_ttl_secs)
            .await
        {
            Ok(Some(url)) => url,
            Ok(None) => inner.backend.get_public_url(path),
            Err(e) => {
                debug!(path, error = %e, "Signed URL failed, using public URL");
                inner.backend.get_public_url(path)
            }
        }
    }

    pub async fn register_push_token(&self, token: &str) -> Result<(), SyncError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(SyncError::Validation("push token is empty".into()));
        }
        let user = self.inner.session.user_id().ok_or(SyncError::NotSignedIn)?;
        self.inner.backend.register_push_token(&user, token).await?;
        info!(user = %user, "Push token registered");
        Ok(())
    }

    pub fn handle_notification_tap(&self, payload: &TapPayload) -> Option<TapTarget> {
        self.inner.dispatcher.resolve_tap(payload)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.registry.teardown();
        if let Some(task) = lock(&self.event_loop).take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seen_messages_drop_duplicates() {
        let mut seen = SeenMessages::default();
        assert!(seen.insert(&MessageId::new("m1")));
        assert!(!seen.insert(&MessageId::new("m1")));
        assert!(seen.insert(&MessageId::new("m2")));
    }

    #[test]
    fn test_seen_messages_are_bounded() {
        let mut seen = SeenMessages::default();
        for i in 0..SEEN_CAPACITY + 10 {
            assert!(seen.insert(&MessageId::new(format!("m{i}"))));
        }
        assert_eq!(seen.order.len(), SEEN_CAPACITY);
        // The oldest ids were forgotten.
        assert!(seen.insert(&MessageId::new("m0")));
        assert!(!seen.insert(&MessageId::new(format!("m{}", SEEN_CAPACITY + 9))));
    }
}
