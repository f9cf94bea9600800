//! Snapshot storage backends
//!
//! Snapshots are write-once: `put` refuses to replace an existing id.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use async_trait::async_trait;
use tracing::debug;

use crate::errors::DeployerError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::models::rollback::RollbackSnapshot;

pub const BACKUPS_DIR: &str = "backups";

/// `{targetId}-{snapshotId}.json`
pub fn backup_name(target_id: &str, snapshot_id: &str) -> String {
    format!("{}-{}.json", target_id, snapshot_id)
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn put(&self, snapshot: &RollbackSnapshot) -> Result<(), DeployerError>;

    async fn get(&self, snapshot_id: &str) -> Result<Option<RollbackSnapshot>, DeployerError>;

    /// Returns whether a snapshot was removed
    async fn delete(&self, snapshot_id: &str) -> Result<bool, DeployerError>;

    async fn list(&self) -> Result<Vec<RollbackSnapshot>, DeployerError>;

    /// Store a backup artifact; returns its path
    async fn put_backup(
        &self,
        name: &str,
        configuration: &serde_json::Value,
    ) -> Result<String, DeployerError>;

    async fn backup_exists(&self, path: &str) -> bool;

    async fn delete_backup(&self, path: &str) -> Result<(), DeployerError>;
}

/// Process-local store
#[derive(Default)]
pub struct InMemorySnapshotStore {
    snapshots: RwLock<HashMap<String, RollbackSnapshot>>,
    backups: RwLock<HashMap<String, serde_json::Value>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn put(&self, snapshot: &RollbackSnapshot) -> Result<(), DeployerError> {
        let mut snapshots = self.snapshots.write().unwrap_or_else(|e| e.into_inner());
        if snapshots.contains_key(&snapshot.snapshot_id) {
            return Err(DeployerError::StorageError(format!(
                "snapshot {} already exists",
                snapshot.snapshot_id
            )));
        }
        snapshots.insert(snapshot.snapshot_id.clone(), snapshot.clone());
        Ok(())
    }

    async fn get(&self, snapshot_id: &str) -> Result<Option<RollbackSnapshot>, DeployerError> {
        let snapshots = self.snapshots.read().unwrap_or_else(|e| e.into_inner());
        Ok(snapshots.get(snapshot_id).cloned())
    }

    async fn delete(&self, snapshot_id: &str) -> Result<bool, DeployerError> {
        let mut snapshots = self.snapshots.write().unwrap_or_else(|e| e.into_inner());
        Ok(snapshots.remove(snapshot_id).is_some())
    }

    async fn list(&self) -> Result<Vec<RollbackSnapshot>, DeployerError> {
        let snapshots = self.snapshots.read().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<RollbackSnapshot> = snapshots.values().cloned().collect();
        list.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(list)
    }

    async fn put_backup(
        &self,
        name: &str,
        configuration: &serde_json::Value,
    ) -> Result<String, DeployerError> {
        let path = format!("{}/{}", BACKUPS_DIR, name);
        let mut backups = self.backups.write().unwrap_or_else(|e| e.into_inner());
        backups.insert(path.clone(), configuration.clone());
        Ok(path)
    }

    async fn backup_exists(&self, path: &str) -> bool {
        let backups = self.backups.read().unwrap_or_else(|e| e.into_inner());
        backups.contains_key(path)
    }

    async fn delete_backup(&self, path: &str) -> Result<(), DeployerError> {
        let mut backups = self.backups.write().unwrap_or_else(|e| e.into_inner());
        backups.remove(path);
        Ok(())
    }
}

/// One JSON file per snapshot, backups under `backups/`
pub struct FileSnapshotStore {
    dir: Dir,
    backups: Dir,
}

impl FileSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = Dir::new(dir);
        let backups = dir.subdir(BACKUPS_DIR);
        Self { dir, backups }
    }

    /// Create the snapshot and backup directories
    pub async fn setup(&self) -> Result<(), DeployerError> {
        self.dir.create().await?;
        self.backups.create().await
    }

    pub fn snapshot_file(&self, snapshot_id: &str) -> File {
        self.dir.file(&format!("{}.json", snapshot_id))
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn put(&self, snapshot: &RollbackSnapshot) -> Result<(), DeployerError> {
        let file = self.snapshot_file(&snapshot.snapshot_id);
        if file.exists().await {
            return Err(DeployerError::StorageError(format!(
                "snapshot {} already exists",
                snapshot.snapshot_id
            )));
        }
        file.write_json(snapshot).await?;
        debug!("Stored snapshot {}", file.path().display());
        Ok(())
    }

    async fn get(&self, snapshot_id: &str) -> Result<Option<RollbackSnapshot>, DeployerError> {
        self.snapshot_file(snapshot_id).read_json_opt().await
    }

    async fn delete(&self, snapshot_id: &str) -> Result<bool, DeployerError> {
        let file = self.snapshot_file(snapshot_id);
        if !file.exists().await {
            return Ok(false);
        }
        file.delete().await?;
        Ok(true)
    }

    async fn list(&self) -> Result<Vec<RollbackSnapshot>, DeployerError> {
        let mut snapshots = Vec::new();
        for path in self.dir.list_files_with_extension("json").await? {
            let snapshot: RollbackSnapshot = File::new(&path).read_json().await.map_err(|e| {
                DeployerError::StorageError(format!("unreadable snapshot {}: {}", path.display(), e))
            })?;
            snapshots.push(snapshot);
        }
        snapshots.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(snapshots)
    }

    async fn put_backup(
        &self,
        name: &str,
        configuration: &serde_json::Value,
    ) -> Result<String, DeployerError> {
        let file = self.backups.file(name);
        file.write_json(configuration).await?;
        Ok(file.path().display().to_string())
    }

    async fn backup_exists(&self, path: &str) -> bool {
        File::new(path).exists().await
    }

    async fn delete_backup(&self, path: &str) -> Result<(), DeployerError> {
        File::new(path).delete().await
    }
}
