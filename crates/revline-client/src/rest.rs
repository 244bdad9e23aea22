//! HTTP implementation of [`Backend`] against a PostgREST-style platform:
//! RPC functions under `/rest/v1/rpc`, table endpoints under `/rest/v1`,
//! and object storage under `/storage/v1`.

use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use revline_shared::protocol::{ConversationSummaryRow, MessageRow, ParticipantRow, ProfileRow};
use revline_shared::types::{ConversationId, UserId};
use revline_shared::{BackendError, Conversation, Message, PresenceRecord};

use crate::backend::{Backend, BackendResult};
use crate::config::EngineConfig;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Credentials of the signed-in user.
#[derive(Debug, Clone)]
struct Credentials {
    user_id: UserId,
    access_token: String,
}

pub struct RestBackend {
    http: Client,
    base_url: String,
    anon_key: String,
    bucket: String,
    credentials: RwLock<Option<Credentials>>,
}

impl RestBackend {
    pub fn new(config: &EngineConfig) -> BackendResult<Self> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| BackendError::Other(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: config.backend_url.clone(),
            anon_key: config.anon_key.clone().unwrap_or_default(),
            bucket: config.image_bucket.clone(),
            credentials: RwLock::new(None),
        })
    }

    /// Attach (or with `None`, drop) the session used for every request.
    pub fn set_session(&self, session: Option<(UserId, String)>) {
        let mut guard = self
            .credentials
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = session.map(|(user_id, access_token)| Credentials { user_id, access_token });
    }

    fn credentials(&self) -> Option<Credentials> {
        self.credentials
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn my_id(&self) -> BackendResult<UserId> {
        self.credentials()
            .map(|c| c.user_id)
            .ok_or(BackendError::Unauthenticated)
    }

    fn rest_url(&self, path: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, path)
    }

    fn storage_url(&self, path: &str) -> String {
        format!("{}/storage/v1/{}", self.base_url, path)
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        let bearer = self
            .credentials()
            .map(|c| c.access_token)
            .unwrap_or_else(|| self.anon_key.clone());
        req.header("apikey", &self.anon_key).bearer_auth(bearer)
    }

    async fn rpc<T: DeserializeOwned>(&self, function: &str, args: Value) -> BackendResult<T> {
        let req = self.http.post(self.rest_url(&format!("rpc/{function}"))).json(&args);
        let resp = send(self.authorize(req)).await?;
        decode(resp).await
    }

    /// For functions that may return nothing (`void`).
    async fn rpc_optional<T: DeserializeOwned>(&self, function: &str, args: Value) -> BackendResult<Option<T>> {
        let req = self.http.post(self.rest_url(&format!("rpc/{function}"))).json(&args);
        let resp = send(self.authorize(req)).await?;
        decode_optional(resp).await
    }

    async fn select<T: DeserializeOwned>(&self, table: &str, query: &[(&str, String)]) -> BackendResult<Vec<T>> {
        let req = self.http.get(self.rest_url(table)).query(query);
        let resp = send(self.authorize(req)).await?;
        decode(resp).await
    }

    async fn update(&self, table: &str, query: &[(&str, String)], body: Value) -> BackendResult<()> {
        let req = self.http.patch(self.rest_url(table)).query(query).json(&body);
        send(self.authorize(req)).await?;
        Ok(())
    }

    async fn insert_message(
        &self,
        conversation_id: &ConversationId,
        sender_id: &UserId,
        content: &str,
    ) -> BackendResult<Message> {
        let body = json!({
            "conversation_id": conversation_id.as_str(),
            "sender_id": sender_id.as_str(),
            "content": content,
            "is_read": false,
        });
        let req = self
            .http
            .post(self.rest_url("messages"))
            .header("Prefer", "return=representation")
            .json(&body);
        let resp = send(self.authorize(req)).await?;
        let rows: Vec<MessageRow> = decode(resp).await?;
        rows.into_iter()
            .next()
            .map(|row| row.into_message(Utc::now()))
            .ok_or_else(|| BackendError::Decode("insert returned no row".into()))
    }

    async fn find_direct_conversation(&self, other_user_id: &UserId) -> BackendResult<Option<ConversationId>> {
        let me = self.my_id()?;
        let mine: Vec<ParticipantRow> = self
            .select(
                "conversation_participants",
                &[
                    ("select", "conversation_id".to_string()),
                    ("user_id", format!("eq.{me}")),
                ],
            )
            .await?;
        if mine.is_empty() {
            return Ok(None);
        }

        let ids: Vec<&str> = mine.iter().map(|r| r.conversation_id.as_str()).collect();
        let shared: Vec<ParticipantRow> = self
            .select(
                "conversation_participants",
                &[
                    ("select", "conversation_id".to_string()),
                    ("conversation_id", in_list(&ids)),
                    ("user_id", format!("eq.{other_user_id}")),
                ],
            )
            .await?;
        if shared.is_empty() {
            return Ok(None);
        }

        #[derive(Deserialize)]
        struct IdRow {
            id: String,
        }

        let ids: Vec<&str> = shared.iter().map(|r| r.conversation_id.as_str()).collect();
        let direct: Vec<IdRow> = self
            .select("conversations", &direct_conversation_query(&ids))
            .await?;
        Ok(direct.into_iter().next().map(|r| ConversationId(r.id)))
    }
}

#[async_trait]
impl Backend for RestBackend {
    async fn list_conversations_with_unread(&self, user_id: &UserId) -> BackendResult<Vec<Conversation>> {
        let rows: Vec<ConversationSummaryRow> = self
            .rpc("list_conversations_with_unread", json!({ "p_user_id": user_id.as_str() }))
            .await?;
        Ok(rows.into_iter().map(Conversation::from).collect())
    }

    async fn list_messages(&self, conversation_id: &ConversationId, limit: u32) -> BackendResult<Vec<Message>> {
        let rows: Vec<MessageRow> = self
            .select(
                "messages",
                &[
                    ("conversation_id", format!("eq.{conversation_id}")),
                    ("order", "created_at.asc".to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;
        let now = Utc::now();
        Ok(rows.into_iter().map(|row| row.into_message(now)).collect())
    }

    async fn send_message(
        &self,
        conversation_id: &ConversationId,
        sender_id: &UserId,
        content: &str,
        summary_text: &str,
    ) -> BackendResult<Message> {
        let message = self.insert_message(conversation_id, sender_id, content).await?;

        // The message is stored; a failed summary write only delays the inbox.
        if let Err(e) = self
            .update(
                "conversations",
                &[("id", format!("eq.{conversation_id}"))],
                json!({
                    "last_message_at": message.created_at,
                    "last_message_text": summary_text,
                }),
            )
            .await
        {
            warn!(conversation = %conversation_id, error = %e, "Failed to update conversation summary");
        }

        debug!(conversation = %conversation_id, message = %message.id, "Message sent");
        Ok(message)
    }

    async fn mark_messages_as_read(&self, conversation_id: &ConversationId, user_id: &UserId) -> BackendResult<()> {
        let _: Option<Value> = self
            .rpc_optional(
                "mark_messages_as_read",
                json!({
                    "p_conversation_id": conversation_id.as_str(),
                    "p_user_id": user_id.as_str(),
                }),
            )
            .await?;
        Ok(())
    }

    async fn get_unread_count(&self, conversation_id: &ConversationId, user_id: &UserId) -> BackendResult<u32> {
        let count: Option<i64> = self
            .rpc(
                "get_unread_count",
                json!({
                    "p_conversation_id": conversation_id.as_str(),
                    "p_user_id": user_id.as_str(),
                }),
            )
            .await?;
        Ok(u32::try_from(count.unwrap_or(0).max(0)).unwrap_or(u32::MAX))
    }

    async fn start_direct_conversation(
        &self,
        other_user_id: &UserId,
        initial_message: Option<&str>,
    ) -> BackendResult<ConversationId> {
        let me = self.my_id()?;
        let initial = initial_message.map(str::trim).filter(|m| !m.is_empty());

        if let Some(existing) = self.find_direct_conversation(other_user_id).await? {
            if let Some(text) = initial {
                self.send_message(&existing, &me, text, text).await?;
            }
            return Ok(existing);
        }

        let id: String = self
            .rpc(
                "start_direct_conversation",
                json!({
                    "p_other_user": other_user_id.as_str(),
                    "p_initial_message": initial,
                }),
            )
            .await?;
        Ok(ConversationId(id))
    }

    async fn delete_conversation_if_member(&self, conversation_id: &ConversationId) -> BackendResult<bool> {
        let result: Option<Value> = self
            .rpc_optional(
                "delete_conversation_if_member",
                json!({ "p_conversation_id": conversation_id.as_str() }),
            )
            .await?;
        // A void variant of the function answers 204 with no body.
        Ok(result.and_then(|v| v.as_bool()).unwrap_or(true))
    }

    async fn is_participant(&self, conversation_id: &ConversationId, user_id: &UserId) -> BackendResult<bool> {
        let rows: Vec<ParticipantRow> = self
            .select(
                "conversation_participants",
                &[
                    ("select", "conversation_id,user_id".to_string()),
                    ("conversation_id", format!("eq.{conversation_id}")),
                    ("user_id", format!("eq.{user_id}")),
                ],
            )
            .await?;
        Ok(!rows.is_empty())
    }

    async fn get_username(&self, user_id: &UserId) -> BackendResult<Option<String>> {
        let rows: Vec<ProfileRow> = self
            .select(
                "user_profiles",
                &[
                    ("select", "id,username".to_string()),
                    ("id", format!("eq.{user_id}")),
                ],
            )
            .await?;
        Ok(rows.into_iter().next().and_then(|row| row.username))
    }

    async fn fetch_presence(&self, user_ids: &[UserId]) -> BackendResult<Vec<PresenceRecord>> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<&str> = user_ids.iter().map(UserId::as_str).collect();
        let rows: Vec<ProfileRow> = self
            .select(
                "user_profiles",
                &[
                    ("select", "id,last_seen_at,online_threshold_seconds,is_online".to_string()),
                    ("id", in_list(&ids)),
                ],
            )
            .await?;
        Ok(rows.iter().map(ProfileRow::to_presence).collect())
    }

    async fn update_presence(&self, user_id: &UserId, is_online: bool, last_seen_at: DateTime<Utc>) -> BackendResult<()> {
        self.update(
            "user_profiles",
            &[("id", format!("eq.{user_id}"))],
            json!({ "is_online": is_online, "last_seen_at": last_seen_at }),
        )
        .await
    }

    async fn upload_image(&self, conversation_id: &ConversationId, bytes: Bytes, mime: &str) -> BackendResult<String> {
        let path = object_path(conversation_id, mime, Utc::now());
        let req = self
            .http
            .post(self.storage_url(&format!("object/{}/{}", self.bucket, path)))
            .header("Content-Type", mime)
            .header("x-upsert", "false")
            .body(bytes);
        send(self.authorize(req)).await?;
        debug!(conversation = %conversation_id, path = %path, "Image uploaded");
        Ok(path)
    }

    async fn get_signed_url(&self, path: &str, ttl_secs: u64) -> BackendResult<Option<String>> {
        #[derive(Deserialize)]
        struct Signed {
            #[serde(rename = "signedURL")]
            signed_url: Option<String>,
        }

        let req = self
            .http
            .post(self.storage_url(&format!("object/sign/{}/{}", self.bucket, path)))
            .json(&json!({ "expiresIn": ttl_secs }));
        let resp = send(self.authorize(req)).await?;
        let signed: Signed = decode(resp).await?;
        Ok(signed
            .signed_url
            .map(|relative| format!("{}/storage/v1{}", self.base_url, relative)))
    }

    fn get_public_url(&self, path: &str) -> String {
        self.storage_url(&format!("object/public/{}/{}", self.bucket, path))
    }

    async fn register_push_token(&self, user_id: &UserId, token: &str) -> BackendResult<()> {
        self.update(
            "user_profiles",
            &[("id", format!("eq.{user_id}"))],
            json!({ "push_token": token }),
        )
        .await
    }
}

async fn send(req: RequestBuilder) -> BackendResult<Response> {
    let resp = req.send().await.map_err(map_transport)?;
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(BackendError::Status {
        status: status.as_u16(),
        message: error_message(&body),
    })
}

async fn decode<T: DeserializeOwned>(resp: Response) -> BackendResult<T> {
    resp.json::<T>()
        .await
        .map_err(|e| BackendError::Decode(e.to_string()))
}

async fn decode_optional<T: DeserializeOwned>(resp: Response) -> BackendResult<Option<T>> {
    if resp.status() == StatusCode::NO_CONTENT {
        return Ok(None);
    }
    let body = resp.text().await.map_err(map_transport)?;
    parse_optional(&body)
}

/// Empty and `null` bodies both mean no value.
fn parse_optional<T: DeserializeOwned>(body: &str) -> BackendResult<Option<T>> {
    if body.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str::<Option<T>>(body).map_err(|e| BackendError::Decode(e.to_string()))
}

fn map_transport(e: reqwest::Error) -> BackendError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        BackendError::Transport(e.to_string())
    } else if e.is_decode() {
        BackendError::Decode(e.to_string())
    } else {
        BackendError::Other(e.to_string())
    }
}

/// Pull the human-readable message out of an error body.
fn error_message(body: &str) -> String {
    match serde_json::from_str::<Value>(body) {
        Ok(value) => value
            .get("message")
            .or_else(|| value.get("error"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| body.to_string()),
        Err(_) => body.to_string(),
    }
}

/// Direct (non-group) conversations among `ids`, oldest first.
fn direct_conversation_query(ids: &[&str]) -> [(&'static str, String); 4] {
    [
        ("select", "id".to_string()),
        ("id", in_list(ids)),
        ("is_group", "eq.false".to_string()),
        ("order", "created_at.asc".to_string()),
    ]
}

/// PostgREST `in.(a,b,c)` filter.
fn in_list(ids: &[&str]) -> String {
    format!("in.({})", ids.join(","))
}

/// `<conversation>/<millis>-<random>.<ext>`
fn object_path(conversation_id: &ConversationId, mime: &str, now: DateTime<Utc>) -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!(
        "{}/{}-{}.{}",
        conversation_id,
        now.timestamp_millis(),
        &random[..12],
        extension_for(mime)
    )
}

fn extension_for(mime: &str) -> &'static str {
    match mime {
        "image/png" => "png",
        "image/webp" => "webp",
        "image/gif" => "gif",
        "image/heic" => "heic",
        _ => "jpg",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_error_message_extraction() {
        let body = r#"{"code":"42501","message":"new row violates row-level security policy for table \"messages\""}"#;
        let message = error_message(body);
        assert!(message.contains("row-level security policy"));

        assert_eq!(error_message(r#"{"error":"Bucket not found"}"#), "Bucket not found");
        assert_eq!(error_message("Bad Gateway"), "Bad Gateway");
    }

    #[test]
    fn test_rls_body_classifies_as_permission() {
        let err = BackendError::Status {
            status: 400,
            message: error_message(r#"{"message":"violates row-level security policy"}"#),
        };
        assert_eq!(err.kind(), revline_shared::ErrorKind::Permission);
    }

    #[test]
    fn test_object_path_shape() {
        let now = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        let path = object_path(&ConversationId::new("c1"), "image/png", now);
        assert!(path.starts_with("c1/1700000000123-"));
        assert!(path.ends_with(".png"));
        assert_eq!(extension_for("image/jpeg"), "jpg");
        assert_eq!(extension_for("application/octet-stream"), "jpg");
    }

    #[test]
    fn test_urls() {
        let config = EngineConfig {
            backend_url: "https://api.revline.app".into(),
            ..EngineConfig::default()
        };
        let backend = RestBackend::new(&config).unwrap();
        assert_eq!(
            backend.get_public_url("c1/x.jpg"),
            "https://api.revline.app/storage/v1/object/public/chat-uploads/c1/x.jpg"
        );
        assert_eq!(backend.rest_url("rpc/get_unread_count"), "https://api.revline.app/rest/v1/rpc/get_unread_count");
        assert_eq!(in_list(&["a", "b"]), "in.(a,b)");
    }

    #[test]
    fn test_direct_lookup_excludes_groups() {
        let query = direct_conversation_query(&["c1", "g1"]);
        assert!(query.contains(&("is_group", "eq.false".to_string())));
        assert!(query.contains(&("id", "in.(c1,g1)".to_string())));
    }

    #[test]
    fn test_optional_body_parsing() {
        assert_eq!(parse_optional::<Value>("").unwrap(), None);
        assert_eq!(parse_optional::<Value>("  \n").unwrap(), None);
        assert_eq!(parse_optional::<bool>("null").unwrap(), None);
        assert_eq!(parse_optional::<bool>("false").unwrap(), Some(false));
        assert!(matches!(parse_optional::<bool>("{oops"), Err(BackendError::Decode(_))));
    }

    /// Answer exactly one HTTP request with `response` and return the base URL.
    async fn serve_once(response: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut chunk = [0u8; 4096];
            // Headers, then as many body bytes as Content-Length announces.
            loop {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(end) = text.find("\r\n\r\n") {
                    let length = text[..end]
                        .lines()
                        .find_map(|l| {
                            let (name, value) = l.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if request.len() >= end + 4 + length {
                        break;
                    }
                }
            }
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
        });
        format!("http://{addr}")
    }

    fn backend_at(url: String) -> RestBackend {
        let config = EngineConfig {
            backend_url: url,
            ..EngineConfig::default()
        };
        RestBackend::new(&config).unwrap()
    }

    const NO_CONTENT: &str = "HTTP/1.1 204 No Content\r\nConnection: close\r\n\r\n";

    #[tokio::test]
    async fn test_void_rpc_responses_are_success() {
        let backend = backend_at(serve_once(NO_CONTENT).await);
        let result = backend
            .mark_messages_as_read(&ConversationId::new("c1"), &UserId::new("u1"))
            .await;
        assert_eq!(result, Ok(()));

        let backend = backend_at(serve_once(NO_CONTENT).await);
        let result = backend
            .delete_conversation_if_member(&ConversationId::new("c1"))
            .await;
        assert_eq!(result, Ok(true));
    }

    #[tokio::test]
    async fn test_delete_refusal_is_reported() {
        let refused = "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 5\r\nConnection: close\r\n\r\nfalse";
        let backend = backend_at(serve_once(refused).await);
        let result = backend
            .delete_conversation_if_member(&ConversationId::new("c1"))
            .await;
        assert_eq!(result, Ok(false));
    }

    #[test]
    fn test_session_required_for_self_queries() {
        let backend = RestBackend::new(&EngineConfig::default()).unwrap();
        assert_eq!(backend.my_id(), Err(BackendError::Unauthenticated));
        backend.set_session(Some((UserId::new("u1"), "jwt".into())));
        assert_eq!(backend.my_id(), Ok(UserId::new("u1")));
        backend.set_session(None);
        assert!(backend.my_id().is_err());
    }
}
