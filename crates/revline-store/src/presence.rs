//! Presence records and the live online set.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use revline_shared::types::UserId;
use revline_shared::PresenceRecord;

use crate::keys::{CacheKey, CacheValue};
use crate::store::CacheStore;

impl CacheStore {
    pub fn presence(&self, user_id: &UserId) -> Option<PresenceRecord> {
        self.read(&CacheKey::Presence(user_id.clone()))
            .and_then(CacheValue::into_presence)
    }

    /// Last writer wins.
    pub fn set_presence(&self, record: PresenceRecord) {
        self.write(
            CacheKey::Presence(record.user_id.clone()),
            CacheValue::Presence(record),
        );
    }

    pub fn online_users(&self) -> BTreeSet<UserId> {
        self.read(&CacheKey::OnlineUsers)
            .and_then(CacheValue::into_online_users)
            .unwrap_or_default()
    }

    pub fn set_online_users(&self, users: BTreeSet<UserId>) {
        self.write(CacheKey::OnlineUsers, CacheValue::OnlineUsers(users));
    }

    /// Derived status from the cached profile fields only.
    pub fn is_online_at(&self, user_id: &UserId, now: DateTime<Utc>) -> bool {
        self.presence(user_id)
            .is_some_and(|record| record.is_online_at(now))
    }

    /// Profile-derived status, or membership in the live presence channel.
    pub fn is_reachable_at(&self, user_id: &UserId, now: DateTime<Utc>) -> bool {
        self.is_online_at(user_id, now) || self.online_users().contains(user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_presence_roundtrip_and_derivation() {
        let store = CacheStore::new();
        let now = Utc::now();
        let user = UserId::new("u1");
        assert!(!store.is_online_at(&user, now));

        let mut record = PresenceRecord::new(user.clone());
        record.last_seen_at = Some(now - Duration::seconds(10));
        store.set_presence(record.clone());
        assert!(store.is_online_at(&user, now));
        assert!(!store.is_online_at(&user, now + Duration::seconds(60)));
        assert_eq!(store.presence(&user), Some(record));
    }

    #[test]
    fn test_online_set() {
        let store = CacheStore::new();
        let now = Utc::now();
        assert!(store.online_users().is_empty());

        store.set_online_users([UserId::new("u2")].into_iter().collect());
        assert!(store.is_reachable_at(&UserId::new("u2"), now));
        assert!(!store.is_online_at(&UserId::new("u2"), now));
        assert!(!store.is_reachable_at(&UserId::new("u3"), now));
    }
}
