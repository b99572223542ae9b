use super::{StoreError, read_optional, write_atomic};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

const PENDING_FILE: &str = "pending.jsonl";
const CLAIM_FILE: &str = "pending.jsonl.claim";

/// One line of the pending log. Lines that are not valid JSON are kept verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEntry {
    line: String,
    unit: Option<Value>,
}

impl PendingEntry {
    pub fn from_unit(unit: &Value) -> Result<Self, StoreError> {
        Ok(Self {
            line: serde_json::to_string(unit)?,
            unit: Some(unit.clone()),
        })
    }

    fn parse(line: &str) -> Self {
        let unit = match serde_json::from_str(line) {
            Ok(unit) => Some(unit),
            Err(e) => {
                warn!(error = %e, "pending log line is not valid JSON, retaining as-is");
                None
            }
        };
        Self {
            line: line.to_string(),
            unit,
        }
    }

    /// The upload unit, or `None` for a malformed line.
    pub fn unit(&self) -> Option<&Value> {
        self.unit.as_ref()
    }

    pub fn line(&self) -> &str {
        &self.line
    }
}

/// Entries taken out of the live log by a reconciliation pass.
///
/// Holding a `Claim` excludes other reconciliations until it is settled or dropped.
#[derive(Debug)]
pub struct Claim {
    entries: Vec<PendingEntry>,
    _reconcile: OwnedMutexGuard<()>,
}

impl Claim {
    pub fn entries(&self) -> &[PendingEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Append-only JSON-lines log of upload units that could not be delivered.
///
/// Every mutation holds `lock`. Reconciliation moves the live log aside
/// (`claim`), retries without holding the lock, then `settle`s by writing
/// the still-failing entries plus anything appended meanwhile back in one
/// atomic rename.
#[derive(Debug, Clone)]
pub struct PendingLog {
    path: PathBuf,
    claim_path: PathBuf,
    lock: Arc<Mutex<()>>,
    reconcile: Arc<Mutex<()>>,
}

impl PendingLog {
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(PENDING_FILE),
            claim_path: dir.join(CLAIM_FILE),
            lock: Arc::new(Mutex::new(())),
            reconcile: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, unit: &Value) -> Result<(), StoreError> {
        self.append_many(std::slice::from_ref(unit)).await
    }

    pub async fn append_many(&self, units: &[Value]) -> Result<(), StoreError> {
        if units.is_empty() {
            return Ok(());
        }

        let mut buffer = Vec::new();
        for unit in units {
            serde_json::to_writer(&mut buffer, unit)?;
            buffer.push(b'\n');
        }

        let _guard = self.lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&buffer).await?;
        file.sync_data().await?;

        debug!(count = units.len(), "appended units to pending log");
        Ok(())
    }

    /// Number of entries awaiting delivery, including any claimed by a running reconciliation.
    pub async fn len(&self) -> Result<usize, StoreError> {
        let _guard = self.lock.lock().await;
        let live = read_entries(&self.path).await?.len();
        let claimed = read_entries(&self.claim_path).await?.len();
        Ok(live + claimed)
    }

    pub async fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len().await? == 0)
    }

    /// Snapshot of the live log.
    pub async fn entries(&self) -> Result<Vec<PendingEntry>, StoreError> {
        let _guard = self.lock.lock().await;
        read_entries(&self.path).await
    }

    /// Move the live log aside for reconciliation.
    ///
    /// A claim file left behind by an interrupted pass is merged first.
    /// Returns `None` when there is nothing to reconcile.
    pub async fn claim(&self) -> Result<Option<Claim>, StoreError> {
        let reconcile = self.reconcile.clone().lock_owned().await;
        let _guard = self.lock.lock().await;

        let leftover = fs::try_exists(&self.claim_path).await?;
        let live = fs::try_exists(&self.path).await?;

        if leftover {
            warn!("found claim from an interrupted reconciliation, merging");
            if live {
                let content = fs::read(&self.path).await?;
                let mut claim_file = OpenOptions::new()
                    .append(true)
                    .open(&self.claim_path)
                    .await?;
                claim_file.write_all(&content).await?;
                claim_file.sync_data().await?;
                fs::remove_file(&self.path).await?;
            }
        } else if live {
            fs::rename(&self.path, &self.claim_path).await?;
        } else {
            return Ok(None);
        }

        let entries = read_entries(&self.claim_path).await?;
        if entries.is_empty() {
            fs::remove_file(&self.claim_path).await?;
            return Ok(None);
        }

        info!(count = entries.len(), "claimed pending log for reconciliation");
        Ok(Some(Claim {
            entries,
            _reconcile: reconcile,
        }))
    }

    /// Finish a reconciliation: keep `still_failing` plus entries appended since `claim`.
    ///
    /// The live log is removed when nothing remains. Returns the remaining count.
    pub async fn settle(
        &self,
        claim: Claim,
        still_failing: Vec<PendingEntry>,
    ) -> Result<usize, StoreError> {
        let _guard = self.lock.lock().await;

        let appended = read_entries(&self.path).await?;
        let mut remaining = still_failing;
        remaining.extend(appended);

        if remaining.is_empty() {
            if fs::try_exists(&self.path).await? {
                fs::remove_file(&self.path).await?;
            }
        } else {
            let mut content = String::new();
            for entry in &remaining {
                content.push_str(&entry.line);
                content.push('\n');
            }
            write_atomic(&self.path, content.as_bytes()).await?;
        }

        if fs::try_exists(&self.claim_path).await? {
            fs::remove_file(&self.claim_path).await?;
        }

        drop(claim);
        Ok(remaining.len())
    }
}

async fn read_entries(path: &Path) -> Result<Vec<PendingEntry>, StoreError> {
    let Some(content) = read_optional(path).await? else {
        return Ok(Vec::new());
    };

    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(PendingEntry::parse)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_append_writes_one_line_per_unit() {
        let temp_dir = TempDir::new().unwrap();
        let log = PendingLog::new(temp_dir.path());

        log.append(&json!({"n": 1})).await.unwrap();
        log.append_many(&[json!({"n": 2}), json!({"n": 3})])
            .await
            .unwrap();

        let content = std::fs::read_to_string(log.path()).unwrap();
        assert_eq!(content.lines().count(), 3);
        assert_eq!(log.len().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_claim_on_absent_log_is_none() {
        let temp_dir = TempDir::new().unwrap();
        let log = PendingLog::new(temp_dir.path());
        assert!(log.claim().await.unwrap().is_none());
        assert!(log.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_settle_with_nothing_left_removes_files() {
        let temp_dir = TempDir::new().unwrap();
        let log = PendingLog::new(temp_dir.path());
        log.append(&json!({"n": 1})).await.unwrap();

        let claim = log.claim().await.unwrap().unwrap();
        assert_eq!(claim.len(), 1);
        assert!(!log.path().exists());

        assert_eq!(log.settle(claim, Vec::new()).await.unwrap(), 0);
        assert!(!log.path().exists());
        assert!(!temp_dir.path().join(CLAIM_FILE).exists());
    }

    #[tokio::test]
    async fn test_append_during_claim_survives_settle() {
        let temp_dir = TempDir::new().unwrap();
        let log = PendingLog::new(temp_dir.path());
        log.append(&json!({"old": 1})).await.unwrap();
        log.append(&json!({"old": 2})).await.unwrap();

        let claim = log.claim().await.unwrap().unwrap();
        log.append(&json!({"new": 1})).await.unwrap();
        assert_eq!(log.len().await.unwrap(), 3);

        let failing: Vec<PendingEntry> = claim
            .entries()
            .iter()
            .filter(|e| e.unit() == Some(&json!({"old": 2})))
            .cloned()
            .collect();
        assert_eq!(log.settle(claim, failing).await.unwrap(), 2);

        let units: Vec<Value> = log
            .entries()
            .await
            .unwrap()
            .into_iter()
            .filter_map(|e| e.unit().cloned())
            .collect();
        assert_eq!(units, vec![json!({"old": 2}), json!({"new": 1})]);
    }

    #[tokio::test]
    async fn test_interrupted_claim_is_merged() {
        let temp_dir = TempDir::new().unwrap();
        let log = PendingLog::new(temp_dir.path());
        std::fs::write(temp_dir.path().join(CLAIM_FILE), "{\"crashed\":true}\n").unwrap();
        log.append(&json!({"fresh": true})).await.unwrap();

        let claim = log.claim().await.unwrap().unwrap();
        assert_eq!(claim.len(), 2);
        assert_eq!(claim.entries()[0].unit(), Some(&json!({"crashed": true})));
        assert!(!log.path().exists());
    }

    #[tokio::test]
    async fn test_second_claim_waits_for_settle() {
        let temp_dir = TempDir::new().unwrap();
        let log = PendingLog::new(temp_dir.path());
        log.append(&json!({"n": 1})).await.unwrap();

        let claim = log.claim().await.unwrap().unwrap();
        let other = log.clone();
        let waiter = tokio::spawn(async move { other.claim().await.unwrap().is_none() });

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        log.settle(claim, Vec::new()).await.unwrap();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_malformed_lines_are_retained_verbatim() {
        let temp_dir = TempDir::new().unwrap();
        let log = PendingLog::new(temp_dir.path());
        std::fs::write(log.path(), "not json\n{\"ok\":1}\n").unwrap();

        let claim = log.claim().await.unwrap().unwrap();
        let malformed: Vec<PendingEntry> = claim
            .entries()
            .iter()
            .filter(|e| e.unit().is_none())
            .cloned()
            .collect();
        assert_eq!(malformed.len(), 1);

        log.settle(claim, malformed).await.unwrap();
        assert_eq!(std::fs::read_to_string(log.path()).unwrap(), "not json\n");
    }
}
