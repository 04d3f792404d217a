//! Error types for windowgate.

use thiserror::Error;

/// Main error type for windowgate operations.
#[derive(Error, Debug)]
pub enum WindowgateError {
    /// A call site referenced a policy that was never registered
    #[error("Unknown rate limit policy: {0}")]
    PolicyNotFound(String),

    /// The identifier has used up its quota for the policy
    #[error("{message}")]
    RateLimitExceeded {
        /// Name of the policy that denied the request
        policy: String,
        /// Denial message configured on the policy
        message: String,
        /// Seconds until the oldest admission leaves the window
        retry_after: u64,
    },

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WindowgateError {
    /// Seconds the caller should wait, when this is a rate limit denial.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            WindowgateError::RateLimitExceeded { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

/// Result type alias for windowgate operations.
pub type Result<T> = std::result::Result<T, WindowgateError>;
