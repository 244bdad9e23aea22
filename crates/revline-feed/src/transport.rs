//! Realtime transport seam and the in-process hub.
//!
//! A transport delivers raw notifications for a topic: row changes that
//! pass the channel's filters, and presence membership changes. Vendor
//! adapters implement [`RealtimeTransport`]; [`LocalTransport`] is a
//! complete in-process implementation used for offline sessions and by
//! the test suites.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::channel::mpsc;
use futures::stream::BoxStream;
use futures::StreamExt;
use tracing::{debug, trace};

use revline_shared::protocol::ChangeRecord;

use crate::error::FeedError;
use crate::scope::TableFilter;

/// Identifies one open channel on a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelToken(pub u64);

#[derive(Debug, Clone, PartialEq)]
pub enum RawNotification {
    Change(ChangeRecord),
    /// Authoritative list of presence keys on the topic.
    PresenceSync(Vec<String>),
    PresenceJoin(Vec<String>),
    PresenceLeave(Vec<String>),
}

pub type NotificationStream = BoxStream<'static, RawNotification>;

pub trait RealtimeTransport: Send + Sync {
    /// Open a channel on `topic`. A channel with no filters only carries
    /// presence notifications and starts with a sync of current members.
    fn open(
        &self,
        topic: &str,
        filters: &[TableFilter],
    ) -> Result<(ChannelToken, NotificationStream), FeedError>;

    /// Close a channel. Unknown tokens are ignored.
    fn close(&self, token: ChannelToken);

    /// Announce `key` on a topic's presence.
    fn track(&self, topic: &str, key: &str) -> Result<(), FeedError>;

    fn untrack(&self, topic: &str, key: &str);
}

struct Channel {
    topic: String,
    filters: Vec<TableFilter>,
    tx: mpsc::UnboundedSender<RawNotification>,
}

#[derive(Default)]
struct Hub {
    next_token: u64,
    channels: HashMap<u64, Channel>,
    // Multiset of tracked keys per topic.
    presence: HashMap<String, Vec<String>>,
    offline: bool,
    shut_down: bool,
}

impl Hub {
    fn broadcast_presence(&mut self, topic: &str, first: RawNotification) {
        let members = self.presence.get(topic).cloned().unwrap_or_default();
        self.channels.retain(|_, ch| {
            if ch.topic != topic {
                return true;
            }
            ch.tx.unbounded_send(first.clone()).is_ok()
                && ch
                    .tx
                    .unbounded_send(RawNotification::PresenceSync(members.clone()))
                    .is_ok()
        });
    }
}

/// In-process realtime hub.
///
/// Cloning yields another handle to the same hub, so tests can keep one to
/// publish changes while the engine owns another.
#[derive(Clone, Default)]
pub struct LocalTransport {
    hub: Arc<Mutex<Hub>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Hub> {
        self.hub.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Deliver a change to every open channel whose filters accept it.
    /// Returns how many channels received it.
    pub fn publish(&self, record: ChangeRecord) -> usize {
        let mut hub = self.lock();
        let mut delivered = 0;
        hub.channels.retain(|token, ch| {
            if !ch.filters.iter().any(|f| f.matches(&record)) {
                return true;
            }
            match ch.tx.unbounded_send(RawNotification::Change(record.clone())) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => {
                    trace!(token, "dropping channel with closed receiver");
                    false
                }
            }
        });
        debug!(table = record.table.as_str(), delivered, "change published");
        delivered
    }

    /// While offline every `open` fails.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Close every channel and refuse new ones.
    pub fn shutdown(&self) {
        let mut hub = self.lock();
        hub.shut_down = true;
        hub.channels.clear();
        hub.presence.clear();
    }

    pub fn open_channels(&self) -> usize {
        self.lock().channels.len()
    }

    pub fn open_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.lock().channels.values().map(|c| c.topic.clone()).collect();
        topics.sort();
        topics
    }

    pub fn tracked(&self, topic: &str) -> Vec<String> {
        self.lock().presence.get(topic).cloned().unwrap_or_default()
    }
}

impl RealtimeTransport for LocalTransport {
    fn open(
        &self,
        topic: &str,
        filters: &[TableFilter],
    ) -> Result<(ChannelToken, NotificationStream), FeedError> {
        let mut hub = self.lock();
        if hub.shut_down {
            return Err(FeedError::TransportClosed);
        }
        if hub.offline {
            return Err(FeedError::Open {
                topic: topic.to_string(),
                reason: "transport offline".into(),
            });
        }

        let (tx, rx) = mpsc::unbounded();
        if filters.is_empty() {
            let members = hub.presence.get(topic).cloned().unwrap_or_default();
            // Cannot fail: the receiver is still in hand.
            let _ = tx.unbounded_send(RawNotification::PresenceSync(members));
        }

        hub.next_token += 1;
        let token = hub.next_token;
        hub.channels.insert(
            token,
            Channel {
                topic: topic.to_string(),
                filters: filters.to_vec(),
                tx,
            },
        );
        debug!(topic, token, "channel opened");
        Ok((ChannelToken(token), rx.boxed()))
    }

    fn close(&self, token: ChannelToken) {
        if let Some(ch) = self.lock().channels.remove(&token.0) {
            debug!(topic = %ch.topic, token = token.0, "channel closed");
        }
    }

    fn track(&self, topic: &str, key: &str) -> Result<(), FeedError> {
        let mut hub = self.lock();
        if hub.shut_down {
            return Err(FeedError::TransportClosed);
        }
        hub.presence
            .entry(topic.to_string())
            .or_default()
            .push(key.to_string());
        hub.broadcast_presence(topic, RawNotification::PresenceJoin(vec![key.to_string()]));
        Ok(())
    }

    fn untrack(&self, topic: &str, key: &str) {
        let mut hub = self.lock();
        let removed = match hub.presence.get_mut(topic) {
            Some(keys) => match keys.iter().position(|k| k == key) {
                Some(pos) => {
                    keys.remove(pos);
                    true
                }
                None => false,
            },
            None => false,
        };
        if removed {
            hub.broadcast_presence(topic, RawNotification::PresenceLeave(vec![key.to_string()]));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    use revline_shared::protocol::{ChangeKind, Table};

    fn insert(conversation: &str) -> ChangeRecord {
        ChangeRecord::new(
            Table::Messages,
            ChangeKind::Insert,
            json!({"id": "m1", "conversation_id": conversation, "sender_id": "u1"}),
        )
    }

    #[tokio::test]
    async fn test_publish_respects_filters() {
        let transport = LocalTransport::new();
        let filter = TableFilter::new(Table::Messages, &[ChangeKind::Insert]).eq("conversation_id", "c1");
        let (_token, mut stream) = transport.open("thread:c1", &[filter]).unwrap();

        assert_eq!(transport.publish(insert("c2")), 0);
        assert_eq!(transport.publish(insert("c1")), 1);
        assert_eq!(stream.next().await, Some(RawNotification::Change(insert("c1"))));
    }

    #[tokio::test]
    async fn test_close_ends_stream() {
        let transport = LocalTransport::new();
        let (token, mut stream) = transport
            .open("inbox-live", &[TableFilter::new(Table::Messages, &[ChangeKind::Insert])])
            .unwrap();
        assert_eq!(transport.open_channels(), 1);
        transport.close(token);
        transport.close(token);
        assert_eq!(transport.open_channels(), 0);
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn test_presence_track_and_untrack() {
        let transport = LocalTransport::new();
        transport.track("presence-users", "u1").unwrap();

        let (_token, mut stream) = transport.open("presence-users", &[]).unwrap();
        assert_eq!(
            stream.next().await,
            Some(RawNotification::PresenceSync(vec!["u1".into()]))
        );

        transport.track("presence-users", "u2").unwrap();
        assert_eq!(stream.next().await, Some(RawNotification::PresenceJoin(vec!["u2".into()])));
        assert_eq!(
            stream.next().await,
            Some(RawNotification::PresenceSync(vec!["u1".into(), "u2".into()]))
        );

        transport.untrack("presence-users", "u1");
        assert_eq!(stream.next().await, Some(RawNotification::PresenceLeave(vec!["u1".into()])));
        assert_eq!(transport.tracked("presence-users"), ["u2"]);
    }

    #[test]
    fn test_offline_and_shutdown_refuse_open() {
        let transport = LocalTransport::new();
        transport.set_offline(true);
        assert!(matches!(transport.open("inbox-live", &[]), Err(FeedError::Open { .. })));
        transport.set_offline(false);
        assert!(transport.open("inbox-live", &[]).is_ok());

        transport.shutdown();
        assert_eq!(transport.open_channels(), 0);
        assert!(matches!(transport.open("inbox-live", &[]), Err(FeedError::TransportClosed)));
    }
}
