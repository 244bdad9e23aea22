use thiserror::Error;

use revline_shared::protocol::Table;

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("Failed to open realtime channel {topic}: {reason}")]
    Open { topic: String, reason: String },

    #[error("Realtime transport is shut down")]
    TransportClosed,

    #[error("Malformed {table:?} row: {source}")]
    Decode {
        table: Table,
        #[source]
        source: serde_json::Error,
    },

    #[error("Change record for {table:?} is missing {field}")]
    MissingField { table: Table, field: &'static str },
}
