//! Implicit-TLS file-transfer server.
//!
//! Only the command subset slicers use is implemented. The directory tree is
//! flattened to a single root and uploads land in the configured cache
//! directory under their base name.

pub mod command;
pub mod passive;
pub mod server;
pub mod session;

use std::time::Duration;

pub use command::{Command, sanitize_filename};
pub use passive::PassivePorts;
pub use server::FtpServer;
pub use session::{DataState, Flow, FtpSession, SessionContext, run_session};

/// The only accepted user name.
pub const FTP_USER: &str = "bblp";

/// Session timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Idle control connection.
    pub idle: Duration,
    /// Wait for the client to open the passive data connection.
    pub data_connect: Duration,
    /// Wait for each read on the data connection.
    pub data_read: Duration,
    /// TLS handshake on accept.
    pub handshake: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            idle: Duration::from_secs(5 * 60),
            data_connect: Duration::from_secs(30),
            data_read: Duration::from_secs(60),
            handshake: Duration::from_secs(10),
        }
    }
}

/// Data-channel failures. Each maps to a negative completion reply.
#[derive(Debug, thiserror::Error)]
pub enum FtpError {
    #[error("no data connection within {0:?}")]
    DataConnectTimeout(Duration),

    #[error("data connection stalled for {0:?}")]
    DataReadTimeout(Duration),

    /// The peer dropped the data connection without a TLS `close_notify`.
    #[error("data connection cut without close_notify after {0} bytes")]
    Truncated(usize),

    #[error("data connection I/O error: {0}")]
    Io(#[from] std::io::Error),
}
