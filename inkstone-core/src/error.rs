//! Error taxonomy for the sync engine.
//!
//! Remote failures are classified by the transport into the variants below
//! and travel unchanged through the reconciler and planner. The only variant
//! the engine acts on itself is [`SyncError::Conflict`] at commit time.

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors that can occur while caching, reconciling or committing
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The path does not resolve to a single blob at the given ref.
    #[error("Not found: {path} at {reference}")]
    NotFound { path: String, reference: String },

    /// The branch moved underneath a commit.
    #[error("Ref conflict: {0}")]
    Conflict(String),

    /// Credential rejected by the remote.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Timeouts, connection failures, rate limits and 5xx responses.
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    /// A cached row could not be decoded.
    #[error("Local store corruption at {path}: {reason}")]
    LocalStoreCorruption { path: String, reason: String },

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Any other unsuccessful remote response.
    #[error("Remote error ({status}): {message}")]
    Remote { status: u16, message: String },

    /// A remote payload could not be decoded (JSON, Base64, UTF-8).
    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Database error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The conflict resolver failed or was abandoned.
    #[error("Conflict resolution aborted: {0}")]
    Resolver(String),
}

impl SyncError {
    pub fn not_found(path: impl Into<String>, reference: impl Into<String>) -> Self {
        Self::NotFound {
            path: path.into(),
            reference: reference.into(),
        }
    }

    /// Whether the caller may retry the same call later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientNetwork(_))
    }

    /// Whether the error ends the current session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }
}
