use revline_shared::constants::{INBOX_TOPIC, PRESENCE_TOPIC};
use revline_shared::protocol::{ChangeKind, ChangeRecord, Table};
use revline_shared::types::{ConversationId, UserId};

/// What a subscription listens to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FeedScope {
    /// Every conversation the session can see.
    Inbox,
    /// Messages and membership changes of one conversation.
    Thread(ConversationId),
    /// The global presence channel.
    Presence,
    /// Profile updates of one user.
    Peer(UserId),
}

impl FeedScope {
    pub fn to_topic(&self) -> String {
        match self {
            FeedScope::Inbox => INBOX_TOPIC.to_string(),
            FeedScope::Thread(id) => id.to_topic(),
            FeedScope::Presence => PRESENCE_TOPIC.to_string(),
            FeedScope::Peer(id) => format!("peer:{id}"),
        }
    }

    /// Parse `inbox`, `presence`, `thread:<id>` or `peer:<id>`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "inbox" | INBOX_TOPIC => Some(FeedScope::Inbox),
            "presence" | PRESENCE_TOPIC => Some(FeedScope::Presence),
            _ => {
                if let Some(id) = s.strip_prefix("thread:").filter(|id| !id.is_empty()) {
                    Some(FeedScope::Thread(ConversationId::new(id)))
                } else {
                    s.strip_prefix("peer:")
                        .filter(|id| !id.is_empty())
                        .map(|id| FeedScope::Peer(UserId::new(id)))
                }
            }
        }
    }

    /// Row filters the transport must apply for this scope.
    pub fn filters(&self) -> Vec<TableFilter> {
        match self {
            FeedScope::Inbox => vec![
                TableFilter::new(Table::Messages, &[ChangeKind::Insert, ChangeKind::Update]),
                TableFilter::new(Table::Conversations, &[ChangeKind::Update]),
                TableFilter::new(Table::UserProfiles, &[ChangeKind::Update]),
            ],
            FeedScope::Thread(id) => vec![
                TableFilter::new(Table::Messages, &[ChangeKind::Insert, ChangeKind::Update])
                    .eq("conversation_id", id.as_str()),
                TableFilter::new(Table::ConversationParticipants, &[ChangeKind::Delete])
                    .eq("conversation_id", id.as_str()),
                TableFilter::new(Table::Conversations, &[ChangeKind::Delete]).eq("id", id.as_str()),
            ],
            FeedScope::Presence => Vec::new(),
            FeedScope::Peer(id) => vec![
                TableFilter::new(Table::UserProfiles, &[ChangeKind::Update]).eq("id", id.as_str()),
            ],
        }
    }
}

impl std::fmt::Display for FeedScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeedScope::Inbox => f.write_str("inbox"),
            FeedScope::Thread(id) => write!(f, "thread:{id}"),
            FeedScope::Presence => f.write_str("presence"),
            FeedScope::Peer(id) => write!(f, "peer:{id}"),
        }
    }
}

/// `table` changes of the listed kinds, optionally restricted to rows whose
/// `column` equals `value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableFilter {
    pub table: Table,
    pub kinds: Vec<ChangeKind>,
    pub column_eq: Option<(String, String)>,
}

impl TableFilter {
    pub fn new(table: Table, kinds: &[ChangeKind]) -> Self {
        Self {
            table,
            kinds: kinds.to_vec(),
            column_eq: None,
        }
    }

    pub fn eq(mut self, column: &str, value: &str) -> Self {
        self.column_eq = Some((column.to_string(), value.to_string()));
        self
    }

    pub fn matches(&self, record: &ChangeRecord) -> bool {
        if record.table != self.table || !self.kinds.contains(&record.kind) {
            return false;
        }
        let Some((ref column, ref value)) = self.column_eq else {
            return true;
        };
        // DELETE payloads only carry the old row.
        let row = if record.kind == ChangeKind::Delete {
            &record.old
        } else {
            &record.new
        };
        match row.get(column) {
            Some(serde_json::Value::String(s)) => s == value,
            Some(other) if !other.is_null() => other.to_string() == *value,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_scopes() {
        assert_eq!(FeedScope::parse("inbox"), Some(FeedScope::Inbox));
        assert_eq!(FeedScope::parse("presence"), Some(FeedScope::Presence));
        assert_eq!(
            FeedScope::parse("thread:c1"),
            Some(FeedScope::Thread(ConversationId::new("c1")))
        );
        assert_eq!(FeedScope::parse("peer:u7"), Some(FeedScope::Peer(UserId::new("u7"))));
        assert_eq!(FeedScope::parse("thread:"), None);
        assert_eq!(FeedScope::parse("garage"), None);
    }

    #[test]
    fn test_display_matches_parse() {
        for scope in [
            FeedScope::Inbox,
            FeedScope::Presence,
            FeedScope::Thread(ConversationId::new("c1")),
            FeedScope::Peer(UserId::new("u1")),
        ] {
            assert_eq!(FeedScope::parse(&scope.to_string()), Some(scope));
        }
    }

    #[test]
    fn test_thread_filter_matches_only_its_conversation() {
        let filters = FeedScope::Thread(ConversationId::new("c1")).filters();
        let hit = ChangeRecord::new(
            Table::Messages,
            ChangeKind::Insert,
            json!({"id": "m1", "conversation_id": "c1", "sender_id": "u1"}),
        );
        let miss = ChangeRecord::new(
            Table::Messages,
            ChangeKind::Insert,
            json!({"id": "m2", "conversation_id": "c2", "sender_id": "u1"}),
        );
        let removed = ChangeRecord::deleted(
            Table::ConversationParticipants,
            json!({"conversation_id": "c1", "user_id": "u1"}),
        );
        assert!(filters.iter().any(|f| f.matches(&hit)));
        assert!(!filters.iter().any(|f| f.matches(&miss)));
        assert!(filters.iter().any(|f| f.matches(&removed)));
    }

    #[test]
    fn test_inbox_ignores_deletes() {
        let filters = FeedScope::Inbox.filters();
        let deleted = ChangeRecord::deleted(Table::Messages, json!({"id": "m1"}));
        assert!(!filters.iter().any(|f| f.matches(&deleted)));
    }
}
