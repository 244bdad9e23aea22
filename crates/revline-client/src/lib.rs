//! # revline-client
//!
//! Realtime conversation sync and presence for the Revline app. The
//! [`SyncEngine`] owns one signed-in session: it keeps the inbox, open
//! threads, unread badges and presence in a reactive cache, applies
//! optimistic mutations with rollback, and raises in-app notifications.

pub mod backend;
pub mod config;
pub mod engine;
pub mod events;
pub mod mutation;
pub mod notifications;
pub mod presence;
pub mod refresh;
pub mod registry;
pub mod rest;
pub mod state;

use tracing_subscriber::{fmt, EnvFilter};

pub use backend::{Backend, BackendResult};
pub use config::EngineConfig;
pub use engine::SyncEngine;
pub use events::{ChatNotification, EngineEvent, EventSink, TapTarget};
pub use mutation::{ImageUpload, MutationState, OperationKind, OperationRecord};
pub use notifications::TapPayload;
pub use presence::HeartbeatState;
pub use rest::RestBackend;
pub use state::{Screen, SessionState};

/// Install the global tracing subscriber. `RUST_LOG` overrides the default
/// filter. Call once at startup.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("revline_client=debug,revline_feed=debug,revline_store=info,warn")
    });

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    tracing::info!("Revline sync engine logging initialised");
}
