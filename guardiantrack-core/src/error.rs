//! Error types for guardiantrack-core

use thiserror::Error;

/// Main error type for the guardiantrack-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Upload transport error (client construction, probe setup)
    #[error("transport error: {0}")]
    Transport(String),

    /// Payload could not be encoded or decoded
    #[error("malformed payload: {0}")]
    Payload(String),

    /// The upload worker is no longer running
    #[error("upload coordinator has shut down")]
    Shutdown,
}

/// Result type alias for guardiantrack-core
pub type Result<T> = std::result::Result<T, Error>;
