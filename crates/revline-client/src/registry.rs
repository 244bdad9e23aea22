//! Ownership of every subscription and background task of a session.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::task::AbortHandle;
use tracing::{debug, info};

use revline_feed::{FeedScope, SubscriptionHandle};

#[derive(Default)]
struct Inner {
    subscriptions: HashMap<FeedScope, SubscriptionHandle>,
    tasks: Vec<AbortHandle>,
}

/// Registry of live subscriptions and detached tasks, torn down together
/// on sign-out.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a subscription, closing any previous one on the same scope.
    pub fn add_subscription(&self, handle: SubscriptionHandle) {
        let previous = self.lock().subscriptions.insert(handle.scope().clone(), handle);
        if let Some(old) = previous {
            debug!(scope = %old.scope(), "Replacing subscription");
            old.close();
        }
    }

    pub fn has_subscription(&self, scope: &FeedScope) -> bool {
        self.lock()
            .subscriptions
            .get(scope)
            .is_some_and(|h| !h.is_closed())
    }

    pub fn close_subscription(&self, scope: &FeedScope) -> bool {
        let removed = self.lock().subscriptions.remove(scope);
        match removed {
            Some(handle) => {
                handle.close();
                true
            }
            None => false,
        }
    }

    pub fn active_scopes(&self) -> Vec<FeedScope> {
        self.lock().subscriptions.keys().cloned().collect()
    }

    /// Track a detached task so sign-out can abort it.
    pub fn track_task(&self, handle: AbortHandle) {
        let mut inner = self.lock();
        inner.tasks.retain(|t| !t.is_finished());
        inner.tasks.push(handle);
    }

    pub fn live_tasks(&self) -> usize {
        self.lock().tasks.iter().filter(|t| !t.is_finished()).count()
    }

    /// Close every subscription and abort every task.
    pub fn teardown(&self) {
        let (subscriptions, tasks) = {
            let mut inner = self.lock();
            (
                std::mem::take(&mut inner.subscriptions),
                std::mem::take(&mut inner.tasks),
            )
        };

        let closed = subscriptions.len();
        for handle in subscriptions.into_values() {
            handle.close();
        }
        let aborted = tasks.len();
        for task in tasks {
            task.abort();
        }
        info!(subscriptions = closed, tasks = aborted, "Session torn down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use revline_feed::{FeedAdapter, LocalTransport};
    use revline_shared::types::ConversationId;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_teardown_closes_everything() {
        let transport = LocalTransport::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let adapter = FeedAdapter::new(Arc::new(transport.clone()), tx);
        let registry = SessionRegistry::new();

        registry.add_subscription(adapter.subscribe(FeedScope::Inbox).unwrap());
        registry.add_subscription(
            adapter
                .subscribe(FeedScope::Thread(ConversationId::new("c1")))
                .unwrap(),
        );
        let task = tokio::spawn(async { tokio::time::sleep(Duration::from_secs(3600)).await });
        registry.track_task(task.abort_handle());
        assert_eq!(transport.open_channels(), 2);
        assert_eq!(registry.live_tasks(), 1);

        registry.teardown();
        assert_eq!(transport.open_channels(), 0);
        assert!(registry.active_scopes().is_empty());
        assert!(task.await.unwrap_err().is_cancelled());

        // A second teardown has nothing left to do.
        registry.teardown();
    }

    #[tokio::test]
    async fn test_replacing_a_scope_closes_the_old_handle() {
        let transport = LocalTransport::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let adapter = FeedAdapter::new(Arc::new(transport.clone()), tx);
        let registry = SessionRegistry::new();

        registry.add_subscription(adapter.subscribe(FeedScope::Inbox).unwrap());
        registry.add_subscription(adapter.subscribe(FeedScope::Inbox).unwrap());
        assert_eq!(transport.open_channels(), 1);
        assert!(registry.has_subscription(&FeedScope::Inbox));

        assert!(registry.close_subscription(&FeedScope::Inbox));
        assert!(!registry.close_subscription(&FeedScope::Inbox));
        assert!(!registry.has_subscription(&FeedScope::Inbox));
    }
}
