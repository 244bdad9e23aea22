//! Presence channel membership tracking.
//!
//! Maintains the set of users currently tracked on the presence channel,
//! keyed by the presence key each client announces (its user id).

use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use revline_shared::types::UserId;

/// Tracks who is present on the presence channel.
///
/// A user may be tracked from several devices at once, so each key is
/// reference counted and only leaves the online set when its last
/// connection goes away.
#[derive(Debug, Clone, Default)]
pub struct PresenceTracker {
    members: HashMap<UserId, usize>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole membership with an authoritative sync.
    pub fn on_sync<I>(&mut self, keys: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.members.clear();
        for key in keys {
            *self.members.entry(UserId(key)).or_insert(0) += 1;
        }
        debug!(online = self.members.len(), "Presence synced");
    }

    pub fn on_join<I>(&mut self, keys: I)
    where
        I: IntoIterator<Item = String>,
    {
        for key in keys {
            let user = UserId(key);
            let count = self.members.entry(user.clone()).or_insert(0);
            *count += 1;
            if *count == 1 {
                debug!(user = %user, "Presence join");
            }
        }
    }

    pub fn on_leave<I>(&mut self, keys: I)
    where
        I: IntoIterator<Item = String>,
    {
        for key in keys {
            let user = UserId(key);
            if let Some(count) = self.members.get_mut(&user) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.members.remove(&user);
                    debug!(user = %user, "Presence leave");
                }
            }
        }
    }

    pub fn is_online(&self, user: &UserId) -> bool {
        self.members.contains_key(user)
    }

    /// Snapshot of every tracked user.
    pub fn online(&self) -> BTreeSet<UserId> {
        self.members.keys().cloned().collect()
    }

    pub fn online_count(&self) -> usize {
        self.members.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_tracker_empty() {
        let tracker = PresenceTracker::new();
        assert_eq!(tracker.online_count(), 0);
        assert!(tracker.online().is_empty());
    }

    #[test]
    fn test_join_and_leave() {
        let mut tracker = PresenceTracker::new();
        tracker.on_join(keys(&["u1", "u2"]));
        assert!(tracker.is_online(&UserId::new("u1")));
        assert_eq!(tracker.online_count(), 2);

        tracker.on_leave(keys(&["u1"]));
        assert!(!tracker.is_online(&UserId::new("u1")));
        assert_eq!(tracker.online_count(), 1);

        // Leaving twice is harmless.
        tracker.on_leave(keys(&["u1"]));
        assert_eq!(tracker.online_count(), 1);
    }

    #[test]
    fn test_second_device_keeps_user_online() {
        let mut tracker = PresenceTracker::new();
        tracker.on_join(keys(&["u1"]));
        tracker.on_join(keys(&["u1"]));
        tracker.on_leave(keys(&["u1"]));
        assert!(tracker.is_online(&UserId::new("u1")));
        tracker.on_leave(keys(&["u1"]));
        assert!(!tracker.is_online(&UserId::new("u1")));
    }

    #[test]
    fn test_sync_replaces_membership() {
        let mut tracker = PresenceTracker::new();
        tracker.on_join(keys(&["u1", "u2"]));
        tracker.on_sync(keys(&["u3"]));
        let online: Vec<String> = tracker.online().into_iter().map(|u| u.0).collect();
        assert_eq!(online, ["u3"]);
    }
}
