//! Relay error types.

use std::net::SocketAddr;

/// Errors from relay listeners and outbound connections.
///
/// Outbound failures close the inbound slicer connection; nothing retries,
/// since the slicer reconnects on its own.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to connect to {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Timed out connecting to {target}")]
    Timeout { target: String },

    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    #[error("Invalid relay target: {0}")]
    InvalidTarget(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
