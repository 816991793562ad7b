//! Error types for harbor-core.

use crate::session::{SessionId, SessionStatus};
use std::time::Duration;
use thiserror::Error;

/// Result type alias for harbor-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur in session, file sync and realtime operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Compute API failure while creating a session's instance.
    #[error("provisioning failed for session {session_id}: {source}")]
    Provisioning {
        /// Session left in `error`
        session_id: SessionId,
        /// Underlying compute API failure
        #[source]
        source: harbor_machine::MachineError,
    },

    /// Compute API failure outside session creation (teardown, lookup).
    #[error("machine error: {0}")]
    Machine(#[from] harbor_machine::MachineError),

    /// Pre-flight quota check rejected or could not be evaluated.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Session not found
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    /// Status change not on the lifecycle graph.
    #[error("invalid session transition: {from} -> {to}")]
    InvalidTransition {
        /// Current status
        from: SessionStatus,
        /// Requested status
        to: SessionStatus,
    },

    /// Write presented a stale version.
    #[error("version conflict on {path}: current version is {current_version:?}")]
    ConcurrencyConflict {
        /// Normalised file path
        path: String,
        /// Version currently stored (`None` when no record exists)
        current_version: Option<u64>,
    },

    /// No live record at the path.
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// Path is empty, absolute outside the project, or escapes it.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// A hydration stage failed.
    #[error("hydration failed: {0}")]
    Hydration(String),

    /// Snapshot archive could not be built or read.
    #[error("snapshot error: {0}")]
    Snapshot(String),

    /// Channel access policy denied the operation.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// Publish or request exceeded its rate window.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited {
        /// Time until the window resets
        retry_after: Duration,
    },

    /// Realtime transport closed or failed.
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// Invalid input
    #[error("validation failed: {0}")]
    Validation(String),

    /// Persistence backend failure.
    #[error("store error: {0}")]
    Store(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
