//! On-disk layout under the data directory.
//!
//! ```text
//! <root>/certs/authority/           shared authority, all instances
//! <root>/instances/<id>/certs/      leaf chain for one instance
//! <root>/instances/<id>/uploads/cache/
//! <root>/archive/                   built-in directory archive
//! ```

use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoragePaths {
    root: PathBuf,
    instance: String,
}

impl StoragePaths {
    pub fn new(root: impl Into<PathBuf>, instance: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            instance: instance.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn authority_dir(&self) -> PathBuf {
        self.root.join("certs").join("authority")
    }

    pub fn instance_dir(&self) -> PathBuf {
        self.root.join("instances").join(&self.instance)
    }

    pub fn leaf_dir(&self) -> PathBuf {
        self.instance_dir().join("certs")
    }

    /// Staging directory for uploads; mirrors the device's `cache` folder.
    pub fn upload_dir(&self) -> PathBuf {
        self.instance_dir().join("uploads").join("cache")
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.root.join("archive")
    }
}
