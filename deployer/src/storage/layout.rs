//! Storage layout configuration

use std::path::PathBuf;

use crate::errors::DeployerError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;

/// On-disk layout of the deployer's state directory
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Base directory for all storage
    pub base_dir: PathBuf,
    /// Fleet file outside the base directory
    pub targets_override: Option<PathBuf>,
}

impl StorageLayout {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            targets_override: None,
        }
    }

    pub fn with_targets_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.targets_override = Some(path.into());
        self
    }

    pub fn settings_file(&self) -> File {
        File::new(self.base_dir.join("settings.json"))
    }

    /// Registered fleet targets
    pub fn targets_file(&self) -> File {
        match &self.targets_override {
            Some(path) => File::new(path),
            None => File::new(self.base_dir.join("targets.json")),
        }
    }

    /// Rollback snapshots, one JSON file each
    pub fn snapshots_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("snapshots"))
    }

    /// Final results of finished deployments
    pub fn results_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("results"))
    }

    pub fn logs_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("logs"))
    }

    /// Create the directories
    pub async fn setup(&self) -> Result<(), DeployerError> {
        self.snapshots_dir().create().await?;
        self.results_dir().create().await?;
        self.logs_dir().create().await?;
        Ok(())
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        #[cfg(target_os = "linux")]
        let base_dir = PathBuf::from("/var/lib/policy-deployer");

        #[cfg(not(target_os = "linux"))]
        let base_dir = std::env::var_os("HOME")
            .or_else(|| std::env::var_os("USERPROFILE"))
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".policy-deployer");

        Self::new(base_dir)
    }
}
