//! Error types for the streaming core

use thiserror::Error;

/// Streaming core error types
#[derive(Error, Debug)]
pub enum StreamError {
    /// The token source failed after the event stream was opened.
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// The token source could not be opened at all.
    #[error("Inference backend unavailable: {0}")]
    Backend(String),

    #[error("Transcript error: {0}")]
    Transcript(String),

    #[error("Invalid event frame: {0}")]
    InvalidFrame(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for streaming core operations
pub type Result<T> = std::result::Result<T, StreamError>;
