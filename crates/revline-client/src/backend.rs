//! The backend collaborator the engine talks to.
//!
//! Everything the engine needs from the database/auth/storage platform goes
//! through [`Backend`]. [`crate::rest::RestBackend`] implements it over HTTP;
//! tests substitute an in-memory fake.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use revline_shared::types::{ConversationId, UserId};
use revline_shared::{BackendError, Conversation, Message, PresenceRecord};

pub type BackendResult<T> = Result<T, BackendError>;

#[async_trait]
pub trait Backend: Send + Sync {
    /// Inbox rows for `user_id` with server-computed unread counts.
    async fn list_conversations_with_unread(&self, user_id: &UserId) -> BackendResult<Vec<Conversation>>;

    /// Oldest first, at most `limit` rows.
    async fn list_messages(&self, conversation_id: &ConversationId, limit: u32) -> BackendResult<Vec<Message>>;

    /// Insert a message and update the conversation's summary fields.
    async fn send_message(
        &self,
        conversation_id: &ConversationId,
        sender_id: &UserId,
        content: &str,
        summary_text: &str,
    ) -> BackendResult<Message>;

    async fn mark_messages_as_read(&self, conversation_id: &ConversationId, user_id: &UserId) -> BackendResult<()>;

    async fn get_unread_count(&self, conversation_id: &ConversationId, user_id: &UserId) -> BackendResult<u32>;

    /// Returns the existing direct conversation with `other_user_id` if there
    /// is one, otherwise creates it.
    async fn start_direct_conversation(
        &self,
        other_user_id: &UserId,
        initial_message: Option<&str>,
    ) -> BackendResult<ConversationId>;

    /// `Ok(false)` when the caller is not a member.
    async fn delete_conversation_if_member(&self, conversation_id: &ConversationId) -> BackendResult<bool>;

    async fn is_participant(&self, conversation_id: &ConversationId, user_id: &UserId) -> BackendResult<bool>;

    async fn get_username(&self, user_id: &UserId) -> BackendResult<Option<String>>;

    /// Presence fields of the given profiles. Unknown ids are omitted.
    async fn fetch_presence(&self, user_ids: &[UserId]) -> BackendResult<Vec<PresenceRecord>>;

    async fn update_presence(&self, user_id: &UserId, is_online: bool, last_seen_at: DateTime<Utc>) -> BackendResult<()>;

    /// Store an image and return its storage path.
    async fn upload_image(&self, conversation_id: &ConversationId, bytes: Bytes, mime: &str) -> BackendResult<String>;

    async fn get_signed_url(&self, path: &str, ttl_secs: u64) -> BackendResult<Option<String>>;

    fn get_public_url(&self, path: &str) -> String;

    async fn register_push_token(&self, user_id: &UserId, token: &str) -> BackendResult<()>;
}
