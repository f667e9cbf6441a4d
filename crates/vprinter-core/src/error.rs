//! Error types for `VPrinter` core library.

use thiserror::Error;

/// Result type alias using `VPrinter` Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for `VPrinter` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error (missing or invalid field for the selected mode)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unknown printer model code
    #[error("Unknown device model: {0}")]
    UnknownModel(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
