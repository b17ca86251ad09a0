//! Error types for a3s-stream

use thiserror::Error;

/// Errors that can occur while driving a stream
#[derive(Debug, Error)]
pub enum StreamError {
    /// `start` was called on a stream that is already started
    #[error("Stream '{stream}' is already started (state: {state})")]
    AlreadyStarted {
        stream: String,
        state: String,
    },

    /// `write` was called on a stream that is not open
    #[error("Cannot write to stream '{stream}' while it is not open (state: {state})")]
    NotOpen {
        stream: String,
        state: String,
    },

    /// Credential fetch failure
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Executor creation or shutdown failure
    #[error("Queue error: {0}")]
    Queue(String),
}

impl StreamError {
    /// Whether this error indicates a caller bug rather than a runtime condition
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            StreamError::AlreadyStarted { .. } | StreamError::NotOpen { .. }
        )
    }
}

/// Result type alias for stream operations
pub type Result<T> = std::result::Result<T, StreamError>;
