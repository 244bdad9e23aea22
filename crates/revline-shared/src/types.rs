use serde::{Deserialize, Serialize};

use crate::constants::TEMP_ID_PREFIX;

// Backend user id (auth uid, UUID text)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        let end = self.0.char_indices().nth(8).map(|(i, _)| i).unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Realtime topic for the single-thread message feed.
    pub fn to_topic(&self) -> String {
        format!("thread:{}", self.0)
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Message identifier: either the server-assigned id or a local
/// `temp-<ts>` placeholder for an unconfirmed optimistic send.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn temp(stamp: u64) -> Self {
        Self(format!("{TEMP_ID_PREFIX}{stamp}"))
    }

    pub fn is_temp(&self) -> bool {
        self.0.starts_with(TEMP_ID_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temp_ids() {
        let id = MessageId::temp(1_700_000_000_123);
        assert_eq!(id.as_str(), "temp-1700000000123");
        assert!(id.is_temp());
        assert!(!MessageId::new("5b1c0e9a-7f1d-4c52-9c7e-1c2d3e4f5a6b").is_temp());
    }

    #[test]
    fn test_user_id_short() {
        assert_eq!(UserId::new("0123456789abcdef").short(), "01234567");
        assert_eq!(UserId::new("abc").short(), "abc");
    }

    #[test]
    fn test_serde_transparent() {
        let id = ConversationId::new("c1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"c1\"");
        assert_eq!(id.to_topic(), "thread:c1");
    }
}
