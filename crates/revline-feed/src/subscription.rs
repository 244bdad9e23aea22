//! Subscriptions: one pump task per open channel, feeding the event bus.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use revline_shared::types::UserId;

use crate::error::FeedError;
use crate::events::{normalize, FeedEvent, ScopedEvent};
use crate::presence::PresenceTracker;
use crate::scope::FeedScope;
use crate::transport::{ChannelToken, NotificationStream, RawNotification, RealtimeTransport};

/// Opens subscriptions on a transport and forwards their typed events,
/// tagged with the originating scope, onto a single bus.
#[derive(Clone)]
pub struct FeedAdapter {
    transport: Arc<dyn RealtimeTransport>,
    bus: mpsc::UnboundedSender<ScopedEvent>,
}

impl FeedAdapter {
    pub fn new(transport: Arc<dyn RealtimeTransport>, bus: mpsc::UnboundedSender<ScopedEvent>) -> Self {
        Self { transport, bus }
    }

    /// Must be called from within a tokio runtime.
    pub fn subscribe(&self, scope: FeedScope) -> Result<SubscriptionHandle, FeedError> {
        let topic = scope.to_topic();
        let (token, stream) = self.transport.open(&topic, &scope.filters())?;
        info!(scope = %scope, "Subscribed");

        let task = tokio::spawn(pump(scope.clone(), stream, self.bus.clone()));
        Ok(SubscriptionHandle {
            scope,
            token,
            tracked_key: None,
            transport: self.transport.clone(),
            task,
            closed: AtomicBool::new(false),
        })
    }

    /// Join the presence channel and announce `self_key` on it.
    pub fn subscribe_presence(&self, self_key: &UserId) -> Result<SubscriptionHandle, FeedError> {
        let mut handle = self.subscribe(FeedScope::Presence)?;
        // On failure the handle drops here and closes the channel.
        self.transport
            .track(&FeedScope::Presence.to_topic(), self_key.as_str())?;
        handle.tracked_key = Some(self_key.to_string());
        Ok(handle)
    }
}

async fn pump(scope: FeedScope, mut stream: NotificationStream, bus: mpsc::UnboundedSender<ScopedEvent>) {
    let mut tracker = PresenceTracker::new();

    while let Some(raw) = stream.next().await {
        let event = match raw {
            RawNotification::Change(record) => match normalize(&record) {
                Ok(Some(event)) => event,
                Ok(None) => continue,
                Err(e) => {
                    warn!(scope = %scope, error = %e, "Dropping malformed change");
                    continue;
                }
            },
            RawNotification::PresenceSync(keys) => {
                tracker.on_sync(keys);
                FeedEvent::PresenceSync(tracker.online())
            }
            RawNotification::PresenceJoin(keys) => {
                tracker.on_join(keys);
                FeedEvent::PresenceSync(tracker.online())
            }
            RawNotification::PresenceLeave(keys) => {
                tracker.on_leave(keys);
                FeedEvent::PresenceSync(tracker.online())
            }
        };

        if bus
            .send(ScopedEvent {
                scope: scope.clone(),
                event,
            })
            .is_err()
        {
            debug!(scope = %scope, "Event bus closed, stopping pump");
            break;
        }
    }

    debug!(scope = %scope, "Subscription stream ended");
}

/// An open subscription. Closing is idempotent; dropping the handle closes it.
pub struct SubscriptionHandle {
    scope: FeedScope,
    token: ChannelToken,
    tracked_key: Option<String>,
    transport: Arc<dyn RealtimeTransport>,
    task: JoinHandle<()>,
    closed: AtomicBool,
}

impl SubscriptionHandle {
    pub fn scope(&self) -> &FeedScope {
        &self.scope
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stops forwarding. Events already queued on the bus stay there.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.task.abort();
        if let Some(ref key) = self.tracked_key {
            self.transport.untrack(&self.scope.to_topic(), key);
        }
        self.transport.close(self.token);
        debug!(scope = %self.scope, "Subscription closed");
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("scope", &self.scope)
            .field("token", &self.token)
            .field("closed", &self.is_closed())
            .finish()
    }
}
