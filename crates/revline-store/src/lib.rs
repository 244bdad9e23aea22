//! # revline-store
//!
//! In-memory reactive cache for the Revline conversation engine.
//!
//! The crate exposes a cloneable `CacheStore` handle over a keyed map of
//! collections (inbox, threads, presence) with synchronous read, write and
//! patch operations plus per-key listeners. Pure reducers for every realtime
//! event live next to the typed helpers that apply them, and unread totals
//! are always derived from the conversation list.

pub mod conversations;
pub mod keys;
pub mod messages;
pub mod presence;
pub mod store;
pub mod unread;

pub use keys::{CacheKey, CacheValue};
pub use store::{CacheEvent, CacheStore, ListenerId, Snapshot};
pub use unread::UnreadSnapshot;
