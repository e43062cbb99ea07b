//! Checkpoint store for resumable incremental sync.
//!
//! Invariants:
//! - Every read and write of the record map happens under one lock
//! - Snapshots are written atomically (write-then-rename), previous file kept as backup
//! - A missing or unreadable file at startup means "no progress known", never a fatal error
//! - The flush loop stops on cancellation without a final flush, so up to one
//!   interval of progress can be lost and re-delivered after restart

use super::CheckpointRecord;
use crate::models::{AuditError, Result};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Map of task ID to checkpoint record, as stored on disk.
pub type CheckpointMap = BTreeMap<String, CheckpointRecord>;

/// Lock-guarded checkpoint records with periodic disk snapshots.
#[derive(Debug)]
pub struct CheckpointStore {
    /// Path to the checkpoint file
    path: PathBuf,
    /// Path to the backup of the previous snapshot
    backup_path: PathBuf,
    /// In-memory records
    records: Mutex<CheckpointMap>,
}

impl CheckpointStore {
    /// Open the store, loading the checkpoint file when it exists.
    ///
    /// Read or parse failures are logged and start from an empty map.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let records = if path.exists() {
            match Self::load_file(&path) {
                Ok(records) => {
                    info!(
                        path = %path.display(),
                        tasks = records.len(),
                        "Loaded checkpoint"
                    );
                    records
                }
                Err(e) => {
                    error!(
                        path = %path.display(),
                        error = %e,
                        "Unreadable checkpoint, starting without progress"
                    );
                    CheckpointMap::new()
                }
            }
        } else {
            debug!(path = %path.display(), "No checkpoint file, starting fresh");
            CheckpointMap::new()
        };

        Self {
            backup_path: path.with_extension("backup.json"),
            path,
            records: Mutex::new(records),
        }
    }

    /// Parse a checkpoint file.
    pub fn load_file(path: &Path) -> Result<CheckpointMap> {
        let file = File::open(path).map_err(|e| AuditError::io("opening checkpoint", e))?;
        let reader = BufReader::new(file);
        serde_json::from_reader(reader)
            .map_err(|e| AuditError::ParseError(format!("Invalid checkpoint: {e}")))
    }

    fn lock(&self) -> MutexGuard<'_, CheckpointMap> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get a copy of a task's record.
    pub fn get(&self, task_id: &str) -> Option<CheckpointRecord> {
        self.lock().get(task_id).cloned()
    }

    /// Replace a task's record.
    pub fn set(&self, task_id: &str, record: CheckpointRecord) {
        self.lock().insert(task_id.to_string(), record);
    }

    /// Get a task's record, inserting `init()` first if absent.
    ///
    /// Returns the record and whether it was created by this call.
    pub fn get_or_init<F>(&self, task_id: &str, init: F) -> (CheckpointRecord, bool)
    where
        F: FnOnce() -> CheckpointRecord,
    {
        let mut records = self.lock();
        if let Some(record) = records.get(task_id) {
            return (record.clone(), false);
        }
        let record = init();
        records.insert(task_id.to_string(), record.clone());
        (record, true)
    }

    /// Modify a task's record in place under the lock.
    ///
    /// Returns false if the task has no record.
    pub fn update<F>(&self, task_id: &str, f: F) -> bool
    where
        F: FnOnce(&mut CheckpointRecord),
    {
        match self.lock().get_mut(task_id) {
            Some(record) => {
                f(record);
                true
            }
            None => false,
        }
    }

    /// Copy of all records.
    pub fn snapshot(&self) -> CheckpointMap {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a snapshot of all records to disk (atomic write).
    pub fn persist(&self) -> Result<()> {
        let snapshot = self.snapshot();

        // Backup existing checkpoint
        if self.path.exists() {
            fs::copy(&self.path, &self.backup_path)
                .map_err(|e| AuditError::io("backing up checkpoint", e))?;
        }

        // Write to temp file
        let temp_path = self.path.with_extension("tmp.json");
        let file =
            File::create(&temp_path).map_err(|e| AuditError::io("creating temp checkpoint", e))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, &snapshot)
            .map_err(|e| AuditError::Internal(format!("Serializing checkpoint: {e}")))?;
        writer
            .flush()
            .map_err(|e| AuditError::io("writing temp checkpoint", e))?;

        // Atomic rename
        fs::rename(&temp_path, &self.path)
            .map_err(|e| AuditError::io("renaming checkpoint", e))?;

        debug!(tasks = snapshot.len(), "Checkpoint saved");
        Ok(())
    }

    /// Snapshot to disk every `interval` until `cancel` fires.
    ///
    /// Failed snapshots are logged and retried on the next tick. Cancellation
    /// does not trigger a final flush.
    pub async fn run_periodic_flush(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; nothing has changed yet.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Stopping periodic checkpoint flush");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.persist() {
                        warn!(path = %self.path.display(), error = %e, "Checkpoint flush failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use tempfile::TempDir;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn sample_record() -> CheckpointRecord {
        let mut record =
            CheckpointRecord::initial(t(0), &["main".to_string(), "dev".to_string()]);
        record.advance_commit("main", t(120));
        record.advance_pull_request(17);
        record.advance_issue(t(60));
        record.last_run_time = Some(t(200));
        record
    }

    #[test]
    fn test_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("taskStats.json");

        let store = CheckpointStore::open(&path);
        store.set("job1$acme$widgets", sample_record());
        store.set("job2$acme$gadgets", CheckpointRecord::initial(t(5), &["master".to_string()]));
        store.persist().unwrap();

        let reloaded = CheckpointStore::open(&path);
        assert_eq!(reloaded.snapshot(), store.snapshot());
        assert_eq!(reloaded.get("job1$acme$widgets"), Some(sample_record()));
    }

    #[test]
    fn test_file_format() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("taskStats.json");

        let store = CheckpointStore::open(&path);
        store.set("job1$acme$widgets", sample_record());
        store.persist().unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        let record = &raw["job1$acme$widgets"];
        assert_eq!(record["last_pr_number"], 17);
        assert!(record["last_commit_time"]["main"].is_string());
        assert!(record["last_issue_time"].is_string());
        assert!(record["last_run_time"].is_string());
    }

    #[test]
    fn test_missing_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::open(dir.path().join("absent.json"));
        assert!(store.is_empty());
        assert!(store.get("job1$acme$repo").is_none());
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("taskStats.json");
        fs::write(&path, "{ not json").unwrap();

        let store = CheckpointStore::open(&path);
        assert!(store.is_empty());
    }

    #[test]
    fn test_persist_keeps_backup() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("taskStats.json");

        let store = CheckpointStore::open(&path);
        store.set("a", sample_record());
        store.persist().unwrap();
        store.set("b", sample_record());
        store.persist().unwrap();

        let backup = CheckpointStore::load_file(&dir.path().join("taskStats.backup.json")).unwrap();
        assert_eq!(backup.len(), 1);
        assert_eq!(CheckpointStore::load_file(&path).unwrap().len(), 2);
    }

    #[test]
    fn test_persist_error_keeps_memory() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::open(dir.path().join("missing-dir").join("taskStats.json"));
        store.set("a", sample_record());

        assert!(store.persist().is_err());
        assert_eq!(store.get("a"), Some(sample_record()));
    }

    #[test]
    fn test_get_or_init_only_initialises_once() {
        let store = CheckpointStore::open("/nonexistent/taskStats.json");

        let (first, created) = store.get_or_init("a", || CheckpointRecord::initial(t(0), &[]));
        assert!(created);
        let (second, created) = store.get_or_init("a", || CheckpointRecord::initial(t(99), &[]));
        assert!(!created);
        assert_eq!(first, second);
    }

    #[test]
    fn test_update_touches_only_requested_field() {
        let store = CheckpointStore::open("/nonexistent/taskStats.json");
        store.set("a", sample_record());

        assert!(store.update("a", |r| r.advance_commit("dev", t(500))));
        assert!(!store.update("missing", |r| r.advance_pull_request(1)));

        let record = store.get("a").unwrap();
        assert_eq!(record.commit_marker("dev"), Some(t(500)));
        assert_eq!(record.commit_marker("main"), Some(t(120)));
        assert_eq!(record.last_pr_number, 17);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_flush_and_cancel_without_final_flush() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("taskStats.json");
        let store = Arc::new(CheckpointStore::open(&path));
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(
            Arc::clone(&store).run_periodic_flush(Duration::from_secs(30), cancel.clone()),
        );

        store.set("a", sample_record());
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(CheckpointStore::load_file(&path).unwrap().len(), 1);

        store.set("b", sample_record());
        cancel.cancel();
        handle.await.unwrap();

        // The second record was never flushed.
        assert_eq!(CheckpointStore::load_file(&path).unwrap().len(), 1);
    }
}
