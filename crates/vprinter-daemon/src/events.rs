//! Collaborator interfaces.
//!
//! Archiving, review queues and print dispatch live outside this crate. The
//! protocol servers and the lifecycle manager only talk to them through the
//! traits below; every method may be awaited.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::info;

/// Identifier an archive assigns to a stored job.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArchiveId(pub String);

impl std::fmt::Display for ArchiveId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Errors reported by an archive collaborator.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("Archive rejected {path}: {reason}")]
    Rejected { path: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Receives every completed upload from the file-transfer server.
#[async_trait]
pub trait FileReceivedHandler: Send + Sync {
    async fn on_file_received(&self, path: PathBuf, source: IpAddr);
}

/// Receives print-start commands observed on the broker.
#[async_trait]
pub trait PrintCommandHandler: Send + Sync {
    async fn on_print_command(&self, filename: &str, payload: &serde_json::Value);
}

/// Storage for uploaded job files.
///
/// Implementations copy what they need; the caller deletes `path` once a
/// method returns `Ok`.
#[async_trait]
pub trait JobArchive: Send + Sync {
    /// Archive immediately.
    async fn archive(&self, path: &Path, source: IpAddr) -> Result<ArchiveId, ArchiveError>;

    /// Hold for operator review before archiving.
    async fn queue_for_review(&self, path: &Path, source: IpAddr)
    -> Result<ArchiveId, ArchiveError>;

    /// Archive and add to the print queue without assigning a printer.
    async fn enqueue_unassigned(
        &self,
        path: &Path,
        source: IpAddr,
    ) -> Result<ArchiveId, ArchiveError>;
}

/// Print-command handler that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingPrintHandler;

#[async_trait]
impl PrintCommandHandler for LoggingPrintHandler {
    async fn on_print_command(&self, filename: &str, payload: &serde_json::Value) {
        let plate = payload
            .pointer("/print/param")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        info!(filename = %filename, plate = %plate, "Print command received");
    }
}
