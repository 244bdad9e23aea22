// Realtime change feed: vendor notifications in, typed engine events out.

pub mod error;
pub mod events;
pub mod presence;
pub mod scope;
pub mod subscription;
pub mod transport;

pub use error::FeedError;
pub use events::{normalize, FeedEvent, ProfileUpdate, ScopedEvent};
pub use presence::PresenceTracker;
pub use scope::{FeedScope, TableFilter};
pub use subscription::{FeedAdapter, SubscriptionHandle};
pub use transport::{ChannelToken, LocalTransport, RawNotification, RealtimeTransport};
