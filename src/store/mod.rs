//! Local persistence: pending log, machine identity, config files and snapshots.

pub mod config_file;
pub mod identity;
pub mod pending;
pub mod snapshot;

pub use config_file::ConfigFiles;
pub use identity::MachineIdentity;
pub use pending::{Claim, PendingEntry, PendingLog};
pub use snapshot::{ExportInfo, SnapshotInfo, SnapshotStore};

use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Invalid storage path: {0}")]
    InvalidStoragePath(String),
}

/// All on-disk state owned by one installation, rooted at a single directory.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
    pending: PendingLog,
    identity: MachineIdentity,
    config_files: ConfigFiles,
    snapshots: SnapshotStore,
}

impl LocalStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        if root.as_os_str().is_empty() {
            return Err(StoreError::InvalidStoragePath("empty path".into()));
        }
        fs::create_dir_all(&root).await?;

        let identity = MachineIdentity::load_or_create(&root.join("machine_id")).await?;

        Ok(Self {
            pending: PendingLog::new(&root),
            config_files: ConfigFiles::new(&root),
            snapshots: SnapshotStore::new(root.join("snapshots")),
            identity,
            root,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn pending(&self) -> &PendingLog {
        &self.pending
    }

    pub fn identity(&self) -> &MachineIdentity {
        &self.identity
    }

    pub fn config_files(&self) -> &ConfigFiles {
        &self.config_files
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }
}

/// Write `bytes` to a sibling temp file, fsync, then rename over `path`.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| StoreError::InvalidStoragePath(path.display().to_string()))?;
    let tmp_path = path.with_file_name(format!("{file_name}.tmp"));

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let mut file = fs::File::create(&tmp_path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);

    fs::rename(&tmp_path, path).await?;
    Ok(())
}

pub(crate) async fn read_optional(path: &Path) -> Result<Option<String>, StoreError> {
    match fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
