//! Types shared by every Revline crate: identifiers, domain models, the raw
//! realtime rows the backend emits, and the sync error taxonomy.

pub mod constants;
pub mod content;
pub mod error;
pub mod models;
pub mod protocol;
pub mod types;

pub use error::{BackendError, ErrorKind, SyncError};
pub use models::{Conversation, ConversationUpdate, Message, OtherUser, PresenceRecord};
pub use types::{ConversationId, MessageId, UserId};
