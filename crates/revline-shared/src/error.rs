use thiserror::Error;

/// Error taxonomy surfaced by the sync engine.
///
/// The mutation coordinator recovers `Network` and `Permission` locally;
/// only `Validation` and `Unknown` reach callers as errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Permission denied: {0}")]
    Permission(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Unexpected error: {0}")]
    Unknown(String),

    #[error("No active session")]
    NotSignedIn,
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Validation(_) => ErrorKind::Validation,
            SyncError::Permission(_) => ErrorKind::Permission,
            SyncError::Network(_) => ErrorKind::Network,
            SyncError::Unknown(_) | SyncError::NotSignedIn => ErrorKind::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    Permission,
    Network,
    Unknown,
}

/// Failure reported by the backend collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Transport-level failure (timeout, connection refused, DNS).
    #[error("Transport error: {0}")]
    Transport(String),

    /// Non-success HTTP response.
    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    /// Response body could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Caller is not authenticated.
    #[error("Not authenticated")]
    Unauthenticated,

    #[error("{0}")]
    Other(String),
}

impl BackendError {
    /// Classify into the sync taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BackendError::Transport(_) => ErrorKind::Network,
            BackendError::Status { status, message } => {
                if *status == 401 || *status == 403 || is_rls_violation(message) {
                    ErrorKind::Permission
                } else if *status == 408 || *status == 429 || *status >= 500 {
                    ErrorKind::Network
                } else {
                    ErrorKind::Unknown
                }
            }
            BackendError::Unauthenticated => ErrorKind::Permission,
            BackendError::Decode(_) => ErrorKind::Unknown,
            BackendError::Other(message) => {
                if is_rls_violation(message) {
                    ErrorKind::Permission
                } else {
                    ErrorKind::Unknown
                }
            }
        }
    }
}

impl From<BackendError> for SyncError {
    fn from(e: BackendError) -> Self {
        let message = e.to_string();
        match e.kind() {
            ErrorKind::Validation => SyncError::Validation(message),
            ErrorKind::Permission => SyncError::Permission(message),
            ErrorKind::Network => SyncError::Network(message),
            ErrorKind::Unknown => SyncError::Unknown(message),
        }
    }
}

fn is_rls_violation(message: &str) -> bool {
    message.contains("row-level security policy")
}
