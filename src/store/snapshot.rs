use super::{StoreError, write_atomic};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;
use serde_json::{Value, json};
use tracing::{info, warn};

const EXPORT_PREFIX: &str = "export_";

/// Metadata for one snapshot file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotInfo {
    pub name: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// Where [`SnapshotStore::export_all`] wrote the bundle and how many snapshots it holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportInfo {
    pub file: PathBuf,
    pub count: usize,
}

/// Timestamped JSON snapshots of the session cache, kept on local disk only.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn save<T: Serialize + ?Sized>(
        &self,
        tag: &str,
        value: &T,
    ) -> Result<PathBuf, StoreError> {
        if tag.is_empty() || tag.contains(['/', '\\']) || tag.starts_with('.') {
            return Err(StoreError::InvalidStoragePath(format!(
                "invalid snapshot tag '{tag}'"
            )));
        }

        let name = format!("{tag}_{}.json", Utc::now().format("%Y%m%d_%H%M%S%3f"));
        let path = self.dir.join(name);
        let bytes = serde_json::to_vec_pretty(value)?;
        write_atomic(&path, &bytes).await?;

        info!(path = %path.display(), bytes = bytes.len(), "wrote snapshot");
        Ok(path)
    }

    /// Snapshot files, newest first. An absent directory lists as empty.
    pub async fn list(&self) -> Result<Vec<SnapshotInfo>, StoreError> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut snapshots = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(".json") {
                continue;
            }
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let modified = metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            snapshots.push(SnapshotInfo {
                name,
                size: metadata.len(),
                modified,
            });
        }

        snapshots.sort_by(|a, b| b.modified.cmp(&a.modified).then(b.name.cmp(&a.name)));
        Ok(snapshots)
    }

    /// Bundle every snapshot into one `export_<ts>.json` file next to them.
    ///
    /// Earlier exports are not re-bundled. Files that cannot be read or parsed
    /// are skipped with a warning.
    pub async fn export_all(&self) -> Result<ExportInfo, StoreError> {
        let mut files = Vec::new();
        for snapshot in self.list().await? {
            if snapshot.name.starts_with(EXPORT_PREFIX) {
                continue;
            }
            let path = self.dir.join(&snapshot.name);
            let data = match fs::read(&path).await {
                Ok(bytes) => serde_json::from_slice::<Value>(&bytes).map_err(StoreError::from),
                Err(e) => Err(e.into()),
            };
            match data {
                Ok(data) => files.push(json!({ "name": snapshot.name, "data": data })),
                Err(e) => warn!(file = %snapshot.name, error = %e, "skipping unreadable snapshot"),
            }
        }

        let now = Utc::now();
        let count = files.len();
        let document = json!({
            "export_time": now.to_rfc3339(),
            "files": files,
        });

        let file = self.dir.join(format!(
            "{EXPORT_PREFIX}{}.json",
            now.format("%Y%m%d_%H%M%S%3f")
        ));
        write_atomic(&file, &serde_json::to_vec_pretty(&document)?).await?;

        info!(path = %file.display(), count, "exported snapshots");
        Ok(ExportInfo { file, count })
    }
}
