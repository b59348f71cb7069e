//! Error types for the Takopi core library.

use thiserror::Error;

/// Result type alias using the Takopi core Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for Takopi operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// An engine name was not recognised
    #[error("Unknown engine: {0}")]
    UnknownEngine(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
