#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;

use revline_client::{Backend, BackendResult, EngineConfig, SyncEngine};
use revline_feed::LocalTransport;
use revline_shared::protocol::{ChangeKind, ChangeRecord, Table};
use revline_shared::types::{ConversationId, MessageId, UserId};
use revline_shared::{BackendError, Conversation, Message, OtherUser, PresenceRecord};

pub const ME: &str = "me";

#[derive(Default)]
pub struct FakeState {
    pub conversations: Vec<Conversation>,
    pub messages: HashMap<ConversationId, Vec<Message>>,
    pub members: HashSet<(ConversationId, UserId)>,
    pub usernames: HashMap<UserId, String>,
    pub presence: HashMap<UserId, PresenceRecord>,
    pub presence_writes: Vec<(UserId, bool)>,
    pub push_tokens: Vec<(UserId, String)>,
    pub uploads: Vec<(ConversationId, String, usize)>,
    pub started: Vec<(UserId, Option<String>)>,
    pub fail_send: Option<BackendError>,
    pub fail_upload: Option<BackendError>,
    pub fail_mark_read: Option<BackendError>,
    pub fail_delete: Option<BackendError>,
    pub fail_start: Option<BackendError>,
    pub fail_list: Option<BackendError>,
    /// Latency of send, mark-read and delete calls.
    pub latency: Option<Duration>,
    /// What `delete_conversation_if_member` answers when it does not fail.
    pub delete_allowed: bool,
    pub next_id: u64,
}

/// In-memory backend. Sent messages are echoed on the transport the way
/// the realtime service would.
pub struct FakeBackend {
    state: Mutex<FakeState>,
    echo: Option<LocalTransport>,
}

impl FakeBackend {
    pub fn new(echo: Option<LocalTransport>) -> Self {
        Self {
            state: Mutex::new(FakeState {
                delete_allowed: true,
                ..FakeState::default()
            }),
            echo,
        }
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    async fn wait(&self) {
        let latency = self.state().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    /// A message from someone else, stored server-side and pushed on the
    /// feed.
    pub fn deliver(&self, message: &Message) {
        {
            let mut state = self.state();
            state
                .messages
                .entry(message.conversation_id.clone())
                .or_default()
                .push(message.clone());
            if let Some(conv) = state
                .conversations
                .iter_mut()
                .find(|c| c.id == message.conversation_id)
            {
                conv.last_message_at = Some(message.created_at);
                conv.last_message_text = Some(message.content.clone());
                if message.sender_id.as_str() != ME {
                    conv.unread_count += 1;
                }
            }
        }
        if let Some(ref transport) = self.echo {
            transport.publish(insert_change(message));
        }
    }

    pub fn add_conversation(&self, conversation: Conversation) {
        let mut state = self.state();
        state
            .members
            .insert((conversation.id.clone(), UserId::new(ME)));
        if let Some(ref other) = conversation.other_user {
            state.members.insert((conversation.id.clone(), other.id.clone()));
        }
        state.conversations.push(conversation);
    }

    pub fn revoke(&self, conversation_id: &str) {
        let mut state = self.state();
        state
            .members
            .remove(&(ConversationId::new(conversation_id), UserId::new(ME)));
        state
            .conversations
            .retain(|c| c.id.as_str() != conversation_id);
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn list_conversations_with_unread(&self, _: &UserId) -> BackendResult<Vec<Conversation>> {
        let state = self.state();
        if let Some(ref e) = state.fail_list {
            return Err(e.clone());
        }
        Ok(state.conversations.clone())
    }

    async fn list_messages(&self, conversation_id: &ConversationId, limit: u32) -> BackendResult<Vec<Message>> {
        let state = self.state();
        let list = state.messages.get(conversation_id).cloned().unwrap_or_default();
        Ok(list.into_iter().take(limit as usize).collect())
    }

    async fn send_message(
        &self,
        conversation_id: &ConversationId,
        sender_id: &UserId,
        content: &str,
        summary_text: &str,
    ) -> BackendResult<Message> {
        self.wait().await;
        let message = {
            let mut state = self.state();
            if let Some(ref e) = state.fail_send {
                return Err(e.clone());
            }
            state.next_id += 1;
            let message = Message {
                id: MessageId::new(format!("srv-{}", state.next_id)),
                conversation_id: conversation_id.clone(),
                sender_id: sender_id.clone(),
                content: content.to_string(),
                created_at: Utc::now(),
                is_read: false,
                local_uri: None,
            };
            state
                .messages
                .entry(conversation_id.clone())
                .or_default()
                .push(message.clone());
            if let Some(conv) = state.conversations.iter_mut().find(|c| &c.id == conversation_id) {
                conv.last_message_at = Some(message.created_at);
                conv.last_message_text = Some(summary_text.to_string());
            }
            message
        };
        if let Some(ref transport) = self.echo {
            transport.publish(insert_change(&message));
        }
        Ok(message)
    }

    async fn mark_messages_as_read(&self, conversation_id: &ConversationId, _: &UserId) -> BackendResult<()> {
        self.wait().await;
        let mut state = self.state();
        if let Some(ref e) = state.fail_mark_read {
            return Err(e.clone());
        }
        if let Some(conv) = state.conversations.iter_mut().find(|c| &c.id == conversation_id) {
            conv.unread_count = 0;
        }
        if let Some(list) = state.messages.get_mut(conversation_id) {
            for m in list.iter_mut() {
                m.is_read = true;
            }
        }
        Ok(())
    }

    async fn get_unread_count(&self, conversation_id: &ConversationId, _: &UserId) -> BackendResult<u32> {
        Ok(self
            .state()
            .conversations
            .iter()
            .find(|c| &c.id == conversation_id)
            .map_or(0, |c| c.unread_count))
    }

    async fn start_direct_conversation(
        &self,
        other_user_id: &UserId,
        initial_message: Option<&str>,
    ) -> BackendResult<ConversationId> {
        let id = {
            let mut state = self.state();
            if let Some(ref e) = state.fail_start {
                return Err(e.clone());
            }
            state
                .started
                .push((other_user_id.clone(), initial_message.map(str::to_string)));
            ConversationId::new(format!("dm-{other_user_id}"))
        };
        if !self.state().conversations.iter().any(|c| c.id == id) {
            self.add_conversation(conversation(id.as_str(), other_user_id.as_str(), 100, 0));
        }
        Ok(id)
    }

    async fn delete_conversation_if_member(&self, conversation_id: &ConversationId) -> BackendResult<bool> {
        self.wait().await;
        let mut state = self.state();
        if let Some(ref e) = state.fail_delete {
            return Err(e.clone());
        }
        if !state.delete_allowed {
            return Ok(false);
        }
        state.conversations.retain(|c| &c.id != conversation_id);
        Ok(true)
    }

    async fn is_participant(&self, conversation_id: &ConversationId, user_id: &UserId) -> BackendResult<bool> {
        Ok(self
            .state()
            .members
            .contains(&(conversation_id.clone(), user_id.clone())))
    }

    async fn get_username(&self, user_id: &UserId) -> BackendResult<Option<String>> {
        Ok(self.state().usernames.get(user_id).cloned())
    }

    async fn fetch_presence(&self, user_ids: &[UserId]) -> BackendResult<Vec<PresenceRecord>> {
        let state = self.state();
        Ok(user_ids
            .iter()
            .filter_map(|id| state.presence.get(id).cloned())
            .collect())
    }

    async fn update_presence(&self, user_id: &UserId, is_online: bool, _: DateTime<Utc>) -> BackendResult<()> {
        self.state().presence_writes.push((user_id.clone(), is_online));
        Ok(())
    }

    async fn upload_image(&self, conversation_id: &ConversationId, bytes: Bytes, mime: &str) -> BackendResult<String> {
        let mut state = self.state();
        if let Some(ref e) = state.fail_upload {
            return Err(e.clone());
        }
        state
            .uploads
            .push((conversation_id.clone(), mime.to_string(), bytes.len()));
        Ok(format!("{conversation_id}/{}.jpg", state.uploads.len()))
    }

    async fn get_signed_url(&self, path: &str, ttl_secs: u64) -> BackendResult<Option<String>> {
        if path.starts_with("private/") {
            Ok(Some(format!("https://cdn.test/signed/{path}?ttl={ttl_secs}")))
        } else {
            Ok(None)
        }
    }

    fn get_public_url(&self, path: &str) -> String {
        format!("https://cdn.test/public/{path}")
    }

    async fn register_push_token(&self, user_id: &UserId, token: &str) -> BackendResult<()> {
        self.state()
            .push_tokens
            .push((user_id.clone(), token.to_string()));
        Ok(())
    }
}

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

pub fn conversation(id: &str, peer: &str, last_at: i64, unread: u32) -> Conversation {
    Conversation {
        id: ConversationId::new(id),
        is_group: false,
        created_at: at(1),
        last_message_at: Some(at(last_at)),
        last_message_text: Some("earlier".into()),
        unread_count: unread,
        other_user: Some(OtherUser {
            id: UserId::new(peer),
            username: None,
        }),
    }
}

pub fn message(id: &str, conversation: &str, sender: &str, created: i64) -> Message {
    Message {
        id: MessageId::new(id),
        conversation_id: ConversationId::new(conversation),
        sender_id: UserId::new(sender),
        content: format!("text of {id}"),
        created_at: at(created),
        is_read: false,
        local_uri: None,
    }
}

pub fn insert_change(message: &Message) -> ChangeRecord {
    ChangeRecord::new(
        Table::Messages,
        ChangeKind::Insert,
        json!({
            "id": message.id.as_str(),
            "conversation_id": message.conversation_id.as_str(),
            "sender_id": message.sender_id.as_str(),
            "content": message.content,
            "created_at": message.created_at,
            "is_read": message.is_read,
        }),
    )
}

pub struct Harness {
    pub engine: SyncEngine,
    pub backend: Arc<FakeBackend>,
    pub transport: LocalTransport,
}

pub fn harness() -> Harness {
    let transport = LocalTransport::new();
    let backend = Arc::new(FakeBackend::new(Some(transport.clone())));
    let engine = SyncEngine::new(EngineConfig::default(), backend.clone(), Arc::new(transport.clone()));
    Harness {
        engine,
        backend,
        transport,
    }
}

/// Let spawned pumps and tasks run. Shorter than every engine timer.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}
