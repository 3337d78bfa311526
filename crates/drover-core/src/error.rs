//! Error types for the `drover` core library.

use thiserror::Error;

/// Result type alias using the core [`enum@Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for `drover` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or unreadable configuration. Fatal at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// NDJSON parsing error
    #[error("Failed to parse NDJSON: {0}")]
    NdjsonParse(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML config file error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
