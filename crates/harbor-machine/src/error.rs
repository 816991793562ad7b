//! Error types for harbor-machine.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for harbor-machine operations.
pub type Result<T> = std::result::Result<T, MachineError>;

/// Errors that can occur while talking to the compute API.
#[derive(Debug, Error)]
pub enum MachineError {
    /// Resource request outside the platform's hard bounds.
    #[error("invalid resources: {0}")]
    Validation(String),

    /// The compute API rejected the request.
    #[error("compute API returned {status}: {message}")]
    Api {
        /// HTTP status code returned by the API
        status: u16,
        /// Response body or error message
        message: String,
    },

    /// The instance does not exist (or no longer exists).
    #[error("machine not found: {0}")]
    NotFound(String),

    /// Network-level failure (connect, reset, DNS).
    #[error("transport error: {0}")]
    Transport(String),

    /// A single call exceeded its per-call timeout.
    #[error("compute API call timed out after {0:?}")]
    Timeout(Duration),

    /// Response body could not be decoded.
    #[error("invalid response: {0}")]
    Decode(String),
}

impl MachineError {
    /// Build an error from a non-success HTTP status.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if status == 404 {
            Self::NotFound(message)
        } else {
            Self::Api { status, message }
        }
    }

    /// Whether the failed call may succeed if repeated.
    ///
    /// Transport failures, timeouts, 5xx and 429 are transient. Every other
    /// 4xx is a rejection of the request itself.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout(_) => true,
            Self::Api { status, .. } => *status >= 500 || *status == 429,
            Self::Validation(_) | Self::NotFound(_) | Self::Decode(_) => false,
        }
    }

    /// Whether the error means the instance is already gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<reqwest::Error> for MachineError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Decode(e.to_string())
        } else if let Some(status) = e.status() {
            Self::from_status(status.as_u16(), e.to_string())
        } else {
            Self::Transport(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(MachineError::from_status(503, "busy").is_retryable());
        assert!(MachineError::from_status(429, "slow down").is_retryable());
        assert!(!MachineError::from_status(422, "bad image").is_retryable());
        assert!(MachineError::from_status(404, "gone").is_not_found());
        assert!(!MachineError::from_status(404, "gone").is_retryable());
    }

    #[test]
    fn test_transport_is_retryable() {
        assert!(MachineError::Transport("reset".into()).is_retryable());
        assert!(MachineError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!MachineError::Validation("cpus".into()).is_retryable());
    }
}
