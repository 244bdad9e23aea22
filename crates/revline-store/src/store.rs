//! Keyed reactive cache.
//!
//! The [`CacheStore`] handle is cheap to clone; all clones share one map
//! guarded by a mutex. Every operation completes under a single lock
//! acquisition, and listeners run after the lock is released, so a listener
//! only ever observes committed values and may read the store again.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::trace;

use crate::keys::{CacheKey, CacheValue};

/// Change notification delivered to listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
    /// The key now holds `value` (`None` when removed).
    Updated {
        key: CacheKey,
        value: Option<CacheValue>,
    },
    /// The key was marked stale; its owner should refetch it.
    Invalidated { key: CacheKey },
}

pub type Listener = Arc<dyn Fn(&CacheEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Saved values of a set of keys, restorable with [`CacheStore::restore`].
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    entries: Vec<(CacheKey, Option<CacheValue>)>,
}

impl Snapshot {
    pub fn get(&self, key: &CacheKey) -> Option<&Option<CacheValue>> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }
}

#[derive(Default)]
struct Inner {
    entries: HashMap<CacheKey, CacheValue>,
    stale: HashSet<CacheKey>,
    listeners: HashMap<ListenerId, (CacheKey, Listener)>,
    next_listener: u64,
}

impl Inner {
    fn listeners_for(&self, key: &CacheKey) -> Vec<Listener> {
        self.listeners
            .values()
            .filter(|(k, _)| k == key)
            .map(|(_, l)| l.clone())
            .collect()
    }
}

#[derive(Clone, Default)]
pub struct CacheStore {
    inner: Arc<Mutex<Inner>>,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panicking listener never runs under the lock, so the map is
        // consistent even if the mutex was poisoned.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn notify(listeners: Vec<Listener>, event: &CacheEvent) {
        for listener in listeners {
            listener(event);
        }
    }

    pub fn read(&self, key: &CacheKey) -> Option<CacheValue> {
        self.lock().entries.get(key).cloned()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.lock().entries.contains_key(key)
    }

    /// Authoritative write; clears the stale flag.
    pub fn write(&self, key: CacheKey, value: CacheValue) {
        self.commit(key, move |_| Some(value), true);
    }

    pub fn remove(&self, key: &CacheKey) -> Option<CacheValue> {
        let mut removed = None;
        self.commit(
            key.clone(),
            |prev| {
                removed = prev;
                None
            },
            true,
        );
        removed
    }

    /// Replace the value at `key` with `updater(prev)`.
    ///
    /// `updater` receives `None` for a missing key and may initialize it;
    /// returning `None` removes the key. It runs under the store lock and
    /// must not touch the store itself. Returns the committed value.
    ///
    /// An incremental patch leaves a stale key stale.
    pub fn patch<F>(&self, key: CacheKey, updater: F) -> Option<CacheValue>
    where
        F: FnOnce(Option<CacheValue>) -> Option<CacheValue>,
    {
        self.commit(key, updater, false)
    }

    fn commit<F>(&self, key: CacheKey, updater: F, fresh: bool) -> Option<CacheValue>
    where
        F: FnOnce(Option<CacheValue>) -> Option<CacheValue>,
    {
        let (next, listeners) = {
            let mut inner = self.lock();
            let prev = inner.entries.remove(&key);
            let next = updater(prev);
            if let Some(ref value) = next {
                inner.entries.insert(key.clone(), value.clone());
            }
            if fresh || next.is_none() {
                inner.stale.remove(&key);
            }
            (next, inner.listeners_for(&key))
        };

        trace!(key = %key, present = next.is_some(), "cache patched");

        let event = CacheEvent::Updated {
            key,
            value: next.clone(),
        };
        Self::notify(listeners, &event);
        next
    }

    /// Mark `key` stale. Never fetches anything by itself.
    pub fn invalidate(&self, key: &CacheKey) {
        let listeners = {
            let mut inner = self.lock();
            inner.stale.insert(key.clone());
            inner.listeners_for(key)
        };
        trace!(key = %key, "cache invalidated");
        Self::notify(listeners, &CacheEvent::Invalidated { key: key.clone() });
    }

    pub fn is_stale(&self, key: &CacheKey) -> bool {
        self.lock().stale.contains(key)
    }

    pub fn snapshot(&self, keys: &[CacheKey]) -> Snapshot {
        let inner = self.lock();
        Snapshot {
            entries: keys
                .iter()
                .map(|k| (k.clone(), inner.entries.get(k).cloned()))
                .collect(),
        }
    }

    /// Put every key of `snapshot` back to its saved value.
    pub fn restore(&self, snapshot: Snapshot) {
        for (key, value) in snapshot.entries {
            self.patch(key, move |_| value);
        }
    }

    pub fn subscribe<F>(&self, key: CacheKey, listener: F) -> ListenerId
    where
        F: Fn(&CacheEvent) + Send + Sync + 'static,
    {
        let mut inner = self.lock();
        let id = ListenerId(inner.next_listener);
        inner.next_listener += 1;
        inner.listeners.insert(id, (key, Arc::new(listener)));
        id
    }

    /// Returns `false` if the listener was already gone.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.lock().listeners.remove(&id).is_some()
    }

    /// Drop every cached value. Listeners stay registered and are told
    /// about each removed key.
    pub fn clear(&self) {
        let removed: Vec<(CacheKey, Vec<Listener>)> = {
            let mut inner = self.lock();
            inner.stale.clear();
            let keys: Vec<CacheKey> = inner.entries.drain().map(|(k, _)| k).collect();
            keys.into_iter()
                .map(|k| {
                    let listeners = inner.listeners_for(&k);
                    (k, listeners)
                })
                .collect()
        };

        for (key, listeners) in removed {
            Self::notify(listeners, &CacheEvent::Updated { key, value: None });
        }
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
