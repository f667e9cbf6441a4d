//! Directory-backed job archive.
//!
//! Stands in for an external archive service: each pipeline copies the job
//! into its own subdirectory under the archive root.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use tracing::info;

use crate::events::{ArchiveError, ArchiveId, JobArchive};

const ARCHIVED_DIR: &str = "archived";
const REVIEW_DIR: &str = "review";
const QUEUE_DIR: &str = "queue";

#[derive(Debug, Clone)]
pub struct DirectoryArchive {
    root: PathBuf,
}

impl DirectoryArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn store(
        &self,
        bucket: &str,
        path: &Path,
        source: IpAddr,
    ) -> Result<ArchiveId, ArchiveError> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ArchiveError::Rejected {
                path: path.display().to_string(),
                reason: "no file name".to_string(),
            })?;
        let stamp = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map_or(0, |d| d.as_millis());

        let dir = self.root.join(bucket);
        tokio::fs::create_dir_all(&dir).await?;
        let stored = format!("{stamp}-{name}");
        tokio::fs::copy(path, dir.join(&stored)).await?;

        let id = ArchiveId(format!("{bucket}/{stored}"));
        info!(id = %id, source = %source, "Job archived");
        Ok(id)
    }
}

#[async_trait]
impl JobArchive for DirectoryArchive {
    async fn archive(&self, path: &Path, source: IpAddr) -> Result<ArchiveId, ArchiveError> {
        self.store(ARCHIVED_DIR, path, source).await
    }

    async fn queue_for_review(
        &self,
        path: &Path,
        source: IpAddr,
    ) -> Result<ArchiveId, ArchiveError> {
        self.store(REVIEW_DIR, path, source).await
    }

    async fn enqueue_unassigned(
        &self,
        path: &Path,
        source: IpAddr,
    ) -> Result<ArchiveId, ArchiveError> {
        self.store(QUEUE_DIR, path, source).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn each_pipeline_has_its_own_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let job = dir.path().join("benchy.3mf");
        std::fs::write(&job, b"PK").unwrap();
        let archive = DirectoryArchive::new(dir.path().join("archive"));
        let source: IpAddr = "192.168.1.7".parse().unwrap();

        let a = archive.archive(&job, source).await.unwrap();
        let r = archive.queue_for_review(&job, source).await.unwrap();
        let q = archive.enqueue_unassigned(&job, source).await.unwrap();

        assert!(a.0.starts_with("archived/") && a.0.ends_with("-benchy.3mf"));
        assert!(r.0.starts_with("review/"));
        assert!(q.0.starts_with("queue/"));
        assert_eq!(std::fs::read(archive.root().join(&q.0)).unwrap(), b"PK");
        assert!(job.exists(), "the caller owns the source file");
    }

    #[tokio::test]
    async fn missing_source_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let archive = DirectoryArchive::new(dir.path());
        let result = archive
            .archive(&dir.path().join("gone.3mf"), "127.0.0.1".parse().unwrap())
            .await;
        assert!(matches!(result, Err(ArchiveError::Io(_))));
    }
}
