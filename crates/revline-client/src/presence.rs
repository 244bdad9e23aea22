//! Presence heartbeat for the signed-in user.
//!
//! While running, the manager stamps `last_seen_at` on the user's profile
//! once at start and then on a fixed period. Backgrounding suspends the
//! beat after an explicit offline write; foregrounding resumes it after an
//! explicit online write. Every write is best effort.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use revline_shared::types::UserId;
use revline_shared::PresenceRecord;
use revline_store::CacheStore;

use crate::backend::Backend;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatState {
    Stopped,
    Running,
    /// App backgrounded: no periodic beat until the next foreground.
    Suspended,
}

struct Inner {
    state: HeartbeatState,
    user: Option<UserId>,
    task: Option<JoinHandle<()>>,
}

pub struct HeartbeatManager {
    backend: Arc<dyn Backend>,
    store: CacheStore,
    period: Duration,
    threshold_secs: u32,
    inner: Mutex<Inner>,
}

impl HeartbeatManager {
    pub fn new(backend: Arc<dyn Backend>, store: CacheStore, period: Duration, threshold_secs: u32) -> Self {
        Self {
            backend,
            store,
            period,
            threshold_secs,
            inner: Mutex::new(Inner {
                state: HeartbeatState::Stopped,
                user: None,
                task: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> HeartbeatState {
        self.lock().state
    }

    /// Beat once now, then every period.
    pub async fn start(&self, user_id: UserId) {
        {
            let mut inner = self.lock();
            if let Some(task) = inner.task.take() {
                task.abort();
            }
            inner.user = Some(user_id.clone());
            inner.state = HeartbeatState::Running;
        }
        info!(user = %user_id, period_secs = self.period.as_secs(), "Heartbeat started");

        beat(&*self.backend, &self.store, &user_id, true, self.threshold_secs).await;
        self.spawn_loop(user_id);
    }

    pub async fn on_foreground(&self) {
        let user = {
            let inner = self.lock();
            match (&inner.state, &inner.user) {
                (HeartbeatState::Stopped, _) | (_, None) => return,
                (_, Some(user)) => user.clone(),
            }
        };
        beat(&*self.backend, &self.store, &user, true, self.threshold_secs).await;

        let resume = {
            let mut inner = self.lock();
            // A stop() may have raced the write.
            if inner.state == HeartbeatState::Suspended {
                inner.state = HeartbeatState::Running;
                true
            } else {
                false
            }
        };
        if resume {
            debug!(user = %user, "Heartbeat resumed");
            self.spawn_loop(user);
        }
    }

    pub async fn on_background(&self) {
        let user = {
            let mut inner = self.lock();
            let Some(user) = inner.user.clone() else {
                return;
            };
            if inner.state == HeartbeatState::Stopped {
                return;
            }
            if let Some(task) = inner.task.take() {
                task.abort();
            }
            inner.state = HeartbeatState::Suspended;
            user
        };
        debug!(user = %user, "Heartbeat suspended");
        beat(&*self.backend, &self.store, &user, false, self.threshold_secs).await;
    }

    /// Cancel the beat, then write offline once.
    pub async fn stop(&self) {
        let user = {
            let mut inner = self.lock();
            if let Some(task) = inner.task.take() {
                task.abort();
            }
            inner.state = HeartbeatState::Stopped;
            inner.user.take()
        };
        if let Some(user) = user {
            info!(user = %user, "Heartbeat stopped");
            beat(&*self.backend, &self.store, &user, false, self.threshold_secs).await;
        }
    }

    fn spawn_loop(&self, user: UserId) {
        let backend = self.backend.clone();
        let store = self.store.clone();
        let period = self.period;
        let threshold = self.threshold_secs;

        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                beat(&*backend, &store, &user, true, threshold).await;
            }
        });

        let mut inner = self.lock();
        if inner.state == HeartbeatState::Running {
            if let Some(old) = inner.task.replace(task) {
                old.abort();
            }
        } else {
            task.abort();
        }
    }
}

impl Drop for HeartbeatManager {
    fn drop(&mut self) {
        if let Some(task) = self.lock().task.take() {
            task.abort();
        }
    }
}

/// One presence write. Failures are logged and otherwise ignored.
async fn beat(backend: &dyn Backend, store: &CacheStore, user: &UserId, online: bool, threshold_secs: u32) {
    let now = Utc::now();
    match backend.update_presence(user, online, now).await {
        Ok(()) => {
            let mut record = store
                .presence(user)
                .unwrap_or_else(|| PresenceRecord::new(user.clone()));
            record.is_online = online;
            record.last_seen_at = Some(now);
            if record.online_threshold_seconds == 0 {
                record.online_threshold_seconds = threshold_secs;
            }
            store.set_presence(record);
        }
        Err(e) => warn!(user = %user, online, error = %e, "Presence write failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::{DateTime, Utc};

    use revline_shared::types::ConversationId;
    use revline_shared::{BackendError, Conversation, Message};

    use crate::backend::BackendResult;

    /// Records presence writes; everything else is unreachable in these tests.
    #[derive(Default)]
    struct PresenceLog {
        writes: StdMutex<Vec<bool>>,
        fail: StdMutex<bool>,
    }

    impl PresenceLog {
        fn writes(&self) -> Vec<bool> {
            self.writes.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Backend for PresenceLog {
        async fn list_conversations_with_unread(&self, _: &UserId) -> BackendResult<Vec<Conversation>> {
            Ok(Vec::new())
        }
        async fn list_messages(&self, _: &ConversationId, _: u32) -> BackendResult<Vec<Message>> {
            Ok(Vec::new())
        }
        async fn send_message(&self, _: &ConversationId, _: &UserId, _: &str, _: &str) -> BackendResult<Message> {
            Err(BackendError::Other("unused".into()))
        }
        async fn mark_messages_as_read(&self, _: &ConversationId, _: &UserId) -> BackendResult<()> {
            Ok(())
        }
        async fn get_unread_count(&self, _: &ConversationId, _: &UserId) -> BackendResult<u32> {
            Ok(0)
        }
        async fn start_direct_conversation(&self, _: &UserId, _: Option<&str>) -> BackendResult<ConversationId> {
            Err(BackendError::Other("unused".into()))
        }
        async fn delete_conversation_if_member(&self, _: &ConversationId) -> BackendResult<bool> {
            Ok(true)
        }
        async fn is_participant(&self, _: &ConversationId, _: &UserId) -> BackendResult<bool> {
            Ok(true)
        }
        async fn get_username(&self, _: &UserId) -> BackendResult<Option<String>> {
            Ok(None)
        }
        async fn fetch_presence(&self, _: &[UserId]) -> BackendResult<Vec<PresenceRecord>> {
            Ok(Vec::new())
        }
        async fn update_presence(&self, _: &UserId, online: bool, _: DateTime<Utc>) -> BackendResult<()> {
            self.writes.lock().unwrap().push(online);
            if *self.fail.lock().unwrap() {
                Err(BackendError::Transport("offline".into()))
            } else {
                Ok(())
            }
        }
        async fn upload_image(&self, _: &ConversationId, _: Bytes, _: &str) -> BackendResult<String> {
            Err(BackendError::Other("unused".into()))
        }
        async fn get_signed_url(&self, _: &str, _: u64) -> BackendResult<Option<String>> {
            Ok(None)
        }
        fn get_public_url(&self, path: &str) -> String {
            path.to_string()
        }
        async fn register_push_token(&self, _: &UserId, _: &str) -> BackendResult<()> {
            Ok(())
        }
    }

    fn manager(log: &Arc<PresenceLog>) -> HeartbeatManager {
        HeartbeatManager::new(log.clone(), CacheStore::new(), Duration::from_secs(25), 45)
    }

    #[tokio::test(start_paused = true)]
    async fn test_beats_immediately_then_periodically() {
        let log = Arc::new(PresenceLog::default());
        let hb = manager(&log);

        hb.start(UserId::new("me")).await;
        assert_eq!(log.writes(), [true]);
        assert_eq!(hb.state(), HeartbeatState::Running);

        tokio::time::sleep(Duration::from_secs(24)).await;
        assert_eq!(log.writes().len(), 1);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(log.writes().len(), 2);
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(log.writes().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_suspends_and_foreground_resumes() {
        let log = Arc::new(PresenceLog::default());
        let hb = manager(&log);
        hb.start(UserId::new("me")).await;

        hb.on_background().await;
        assert_eq!(hb.state(), HeartbeatState::Suspended);
        assert_eq!(log.writes(), [true, false]);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(log.writes().len(), 2);

        hb.on_foreground().await;
        assert_eq!(hb.state(), HeartbeatState::Running);
        assert_eq!(log.writes(), [true, false, true]);
        tokio::time::sleep(Duration::from_secs(26)).await;
        assert_eq!(log.writes().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_then_writes_offline_once() {
        let log = Arc::new(PresenceLog::default());
        let hb = manager(&log);
        hb.start(UserId::new("me")).await;

        hb.stop().await;
        assert_eq!(hb.state(), HeartbeatState::Stopped);
        assert_eq!(log.writes(), [true, false]);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(log.writes().len(), 2);

        // Nothing to do once stopped.
        hb.stop().await;
        hb.on_foreground().await;
        hb.on_background().await;
        assert_eq!(log.writes().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failures_are_swallowed() {
        let log = Arc::new(PresenceLog::default());
        *log.fail.lock().unwrap() = true;
        let store = CacheStore::new();
        let hb = HeartbeatManager::new(log.clone(), store.clone(), Duration::from_secs(25), 45);

        hb.start(UserId::new("me")).await;
        assert_eq!(hb.state(), HeartbeatState::Running);
        assert!(store.presence(&UserId::new("me")).is_none());

        *log.fail.lock().unwrap() = false;
        tokio::time::sleep(Duration::from_secs(26)).await;
        let record = store.presence(&UserId::new("me")).unwrap();
        assert!(record.is_online);
    }
}
