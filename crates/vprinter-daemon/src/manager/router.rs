//! Routes completed uploads to the archive pipeline for the active mode.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use vprinter_core::EmulationMode;

use crate::events::{ArchiveError, ArchiveId, FileReceivedHandler, JobArchive};
use crate::mqtt::{GcodeState, JobTracker};

/// Extension of print job archives.
pub const JOB_EXTENSION: &str = "3mf";

/// What happens to an accepted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pipeline {
    Archive,
    Review,
    Queue,
}

impl Pipeline {
    /// Pipeline for a server mode; relay mode stores nothing.
    pub const fn for_mode(mode: EmulationMode) -> Option<Self> {
        match mode {
            EmulationMode::ServerImmediate => Some(Self::Archive),
            EmulationMode::ServerReview => Some(Self::Review),
            EmulationMode::ServerQueue => Some(Self::Queue),
            EmulationMode::Relay => None,
        }
    }
}

pub fn is_job_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(JOB_EXTENSION))
}

/// File-received handler installed on the file-transfer server.
///
/// While the archive collaborator runs, the broker reports the job as
/// preparing; afterwards the printer goes back to idle.
pub struct UploadRouter {
    pipeline: Pipeline,
    archive: Arc<dyn JobArchive>,
    job: JobTracker,
}

impl UploadRouter {
    pub fn new(pipeline: Pipeline, archive: Arc<dyn JobArchive>, job: JobTracker) -> Self {
        Self {
            pipeline,
            archive,
            job,
        }
    }

    async fn dispatch(&self, path: &Path, source: IpAddr) -> Result<ArchiveId, ArchiveError> {
        match self.pipeline {
            Pipeline::Archive => self.archive.archive(path, source).await,
            Pipeline::Review => self.archive.queue_for_review(path, source).await,
            Pipeline::Queue => self.archive.enqueue_unassigned(path, source).await,
        }
    }
}

async fn discard(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        warn!(path = %path.display(), error = %e, "Failed to delete staged upload");
    }
}

#[async_trait]
impl FileReceivedHandler for UploadRouter {
    async fn on_file_received(&self, path: PathBuf, source: IpAddr) {
        if !is_job_file(&path) {
            debug!(path = %path.display(), "Discarding non-job upload");
            discard(&path).await;
            return;
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let preparing = self.job.set_job_state(GcodeState::Prepare, &name, 0);

        let ours = match self.dispatch(&path, source).await {
            Ok(id) => {
                info!(file = %name, source = %source, id = %id, pipeline = ?self.pipeline, "Upload stored");
                let done = self
                    .job
                    .replace_if_current(preparing, GcodeState::Prepare, &name, 100);
                discard(&path).await;
                done
            }
            Err(e) => {
                warn!(file = %name, source = %source, error = %e, "Archive rejected upload, keeping staged file");
                Some(preparing)
            }
        };

        // A print command may have claimed the job while archiving ran.
        let reset = ours.and_then(|rev| self.job.replace_if_current(rev, GcodeState::Idle, "", 0));
        if reset.is_none() {
            debug!(file = %name, "Job state changed during archiving, leaving it");
        }
    }
}
