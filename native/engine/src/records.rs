//! Durable store of run and operation records.
//!
//! Every run lives in its own `run_<timestamp>.json` file. Writers are serialized and
//! publish a fresh immutable snapshot after each persisted change, so readers never
//! block on the writer and never see a half-applied category update.

use std::{
    collections::BTreeMap,
    error::Error,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result, anyhow};
use fs_err::tokio::{self as fs, File, OpenOptions};
use fs4::fs_err3_tokio::AsyncFileExt as _;
use futures::Stream;
use lazy_regex::regex_captures;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{Mutex, watch},
    time::{Duration, sleep},
};
use tokio_stream::{StreamExt as _, wrappers::WatchStream};
use tracing::{debug, instrument, warn};

use crate::models::{
    CategoryOperationRecord, DataCategory, OperationState, PackageOperationRecord, RecordKind,
    RunKind, RunRecord,
};

pub const RECORDS_DIR: &str = "records";

/// A run together with the records of every item it processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecords {
    pub run: RunRecord,
    pub packages: Vec<PackageOperationRecord>,
}

impl RunRecords {
    fn package_mut(&mut self, kind: RecordKind, name: &str) -> Option<&mut PackageOperationRecord> {
        self.packages.iter_mut().find(|p| p.kind == kind && p.name == name)
    }

    pub fn package(&self, kind: RecordKind, name: &str) -> Option<&PackageOperationRecord> {
        self.packages.iter().find(|p| p.kind == kind && p.name == name)
    }
}

pub type Snapshot = Arc<BTreeMap<i64, Arc<RunRecords>>>;

/// Per-state tallies of one category across a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateCounts {
    pub idle: usize,
    pub processing: usize,
    pub done: usize,
    pub error: usize,
    pub skip: usize,
}

impl StateCounts {
    fn add(&mut self, state: OperationState) {
        match state {
            OperationState::Idle => self.idle += 1,
            OperationState::Processing => self.processing += 1,
            OperationState::Done => self.done += 1,
            OperationState::Error => self.error += 1,
            OperationState::Skip => self.skip += 1,
        }
    }

    pub fn finished(&self) -> usize {
        self.done + self.error + self.skip
    }

    pub fn total(&self) -> usize {
        self.finished() + self.idle + self.processing
    }
}

/// Cross-process lock held while a run file is replaced.
struct StoreFileLock(File);

impl StoreFileLock {
    async fn acquire(dir: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(dir.join("records.lock"))
            .await?;
        while !file.try_lock_exclusive()? {
            sleep(Duration::from_millis(20)).await;
        }
        Ok(Self(file))
    }
}

impl Drop for StoreFileLock {
    fn drop(&mut self) {
        let _ = self.0.unlock();
    }
}

#[derive(Debug)]
pub struct RecordStore {
    dir: PathBuf,
    tx: watch::Sender<Snapshot>,
    write_lock: Mutex<()>,
}

impl RecordStore {
    /// Opens the store under `data_dir`, loading every run file found there.
    #[instrument(level = "debug", skip_all, fields(dir = %data_dir.as_ref().display()), err)]
    pub async fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let dir = data_dir.as_ref().join(RECORDS_DIR);
        fs::create_dir_all(&dir).await.context("Failed to create records directory")?;

        let mut runs = BTreeMap::new();
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name().to_string_lossy().to_string();
            let Some((_, ts)) = regex_captures!(r"^run_(\d+)\.json$", &file_name) else { continue };
            let Ok(ts) = ts.parse::<i64>() else { continue };
            let content = fs::read_to_string(entry.path()).await?;
            match serde_json::from_str::<RunRecords>(&content) {
                Ok(run) => {
                    runs.insert(ts, Arc::new(run));
                }
                Err(e) => {
                    warn!(error = &e as &dyn Error, file = file_name, "Ignoring unreadable run record");
                }
            }
        }
        debug!(count = runs.len(), "Loaded run records");

        Ok(Self { dir, tx: watch::Sender::new(Arc::new(runs)), write_lock: Mutex::new(()) })
    }

    fn run_file(&self, timestamp: i64) -> PathBuf {
        self.dir.join(format!("run_{timestamp}.json"))
    }

    async fn persist(&self, run: &RunRecords) -> Result<()> {
        let path = self.run_file(run.run.timestamp);
        let tmp = self.dir.join(format!(".{}.tmp", uuid::Uuid::new_v4()));
        let json = serde_json::to_vec_pretty(run)?;
        let result: Result<()> = async {
            fs::write(&tmp, json).await?;
            let _lock = StoreFileLock::acquire(&self.dir).await?;
            fs::rename(&tmp, &path).await.with_context(|| format!("Failed to replace {}", path.display()))
        }
        .await;
        if result.is_err()
            && let Err(e) = fs::remove_file(&tmp).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(error = &e as &dyn Error, tmp = %tmp.display(), "Failed to remove temporary record file");
        }
        result
    }

    /// Applies `f` to a copy of one run, persists it, then publishes it.
    async fn mutate_run<R>(&self, timestamp: i64, f: impl FnOnce(&mut RunRecords) -> R) -> Result<R> {
        let _guard = self.write_lock.lock().await;
        let current = self.tx.borrow().get(&timestamp).cloned();
        let mut run = current
            .map(|run| run.as_ref().clone())
            .ok_or_else(|| anyhow!("Unknown run {timestamp}"))?;
        let result = f(&mut run);
        self.persist(&run).await?;
        let run = Arc::new(run);
        self.tx.send_modify(|snapshot| {
            Arc::make_mut(snapshot).insert(timestamp, run);
        });
        Ok(result)
    }

    pub fn snapshot(&self) -> Snapshot {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.tx.subscribe()
    }

    /// Yields the run's current state on every store change.
    pub fn watch_run(&self, timestamp: i64) -> impl Stream<Item = Option<Arc<RunRecords>>> + use<> {
        WatchStream::new(self.tx.subscribe()).map(move |snapshot| snapshot.get(&timestamp).cloned())
    }

    #[instrument(level = "debug", skip(self), err)]
    pub async fn begin_run(&self, timestamp: i64, kind: RunKind, start_time: i64) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let run = RunRecords {
            run: RunRecord {
                timestamp,
                kind,
                start_time,
                end_time: None,
                state: OperationState::Processing,
            },
            packages: Vec::new(),
        };
        self.persist(&run).await?;
        let run = Arc::new(run);
        self.tx.send_modify(|snapshot| {
            Arc::make_mut(snapshot).insert(timestamp, run);
        });
        Ok(())
    }

    /// Closes a run; its state is `Error` if any item failed.
    pub async fn finish_run(&self, timestamp: i64, end_time: i64) -> Result<OperationState> {
        self.mutate_run(timestamp, |run| {
            let state = if run.packages.iter().any(|p| p.overall_state == OperationState::Error) {
                OperationState::Error
            } else {
                OperationState::Done
            };
            run.run.end_time = Some(end_time);
            run.run.state = state;
            state
        })
        .await
    }

    /// Adds an item record to a run, replacing one with the same kind and name.
    pub async fn begin_package(&self, timestamp: i64, record: PackageOperationRecord) -> Result<()> {
        self.mutate_run(timestamp, |run| {
            match run.package_mut(record.kind, &record.name) {
                Some(existing) => *existing = record,
                None => run.packages.push(record),
            }
        })
        .await
    }

    /// Applies `update` to one category record.
    ///
    /// State changes that would break the lifecycle order are discarded; the other
    /// fields of the update still apply. Returns whether the state was accepted.
    pub async fn update_category(
        &self,
        timestamp: i64,
        kind: RecordKind,
        name: &str,
        category: DataCategory,
        update: impl FnOnce(&mut CategoryOperationRecord),
    ) -> Result<bool> {
        self.mutate_run(timestamp, |run| {
            let record = run
                .package_mut(kind, name)
                .and_then(|p| p.sub_record_mut(category))
                .ok_or_else(|| anyhow!("No {category} record for {name} in run {timestamp}"))?;
            let previous = record.state;
            update(record);
            if !previous.can_transition_to(record.state) {
                warn!(name, %category, from = %previous, to = %record.state, "Rejected state regression");
                record.state = previous;
                return Ok(false);
            }
            Ok(true)
        })
        .await?
    }

    /// Computes the overall state and end time. Only the first call has an effect.
    pub async fn finalize_package(
        &self,
        timestamp: i64,
        kind: RecordKind,
        name: &str,
        end_time: i64,
    ) -> Result<OperationState> {
        self.mutate_run(timestamp, |run| {
            let record = run
                .package_mut(kind, name)
                .ok_or_else(|| anyhow!("No record for {name} in run {timestamp}"))?;
            if !record.is_finalized() {
                record.overall_state = record.compute_overall_state();
                record.end_time = Some(end_time);
            }
            Ok(record.overall_state)
        })
        .await?
    }

    pub fn run(&self, timestamp: i64) -> Option<Arc<RunRecords>> {
        self.tx.borrow().get(&timestamp).cloned()
    }

    pub fn runs(&self) -> Vec<RunRecord> {
        self.tx.borrow().values().map(|r| r.run.clone()).collect()
    }

    pub fn records_for_run(&self, timestamp: i64) -> Vec<PackageOperationRecord> {
        self.run(timestamp).map(|r| r.packages.clone()).unwrap_or_default()
    }

    /// Records of one item across all runs, oldest run first.
    pub fn records_for_package(&self, kind: RecordKind, name: &str) -> Vec<(i64, PackageOperationRecord)> {
        self.tx
            .borrow()
            .iter()
            .filter_map(|(ts, run)| run.package(kind, name).map(|p| (*ts, p.clone())))
            .collect()
    }

    /// Item records that have not been finalized.
    pub fn unfinished(&self) -> Vec<(i64, PackageOperationRecord)> {
        self.tx
            .borrow()
            .iter()
            .flat_map(|(ts, run)| {
                run.packages.iter().filter(|p| !p.is_finalized()).map(|p| (*ts, p.clone()))
            })
            .collect()
    }

    pub fn category_counts(&self, timestamp: i64) -> BTreeMap<DataCategory, StateCounts> {
        let mut counts = BTreeMap::<DataCategory, StateCounts>::new();
        if let Some(run) = self.run(timestamp) {
            for sub in run.packages.iter().flat_map(|p| p.sub_records.iter()) {
                counts.entry(sub.category).or_default().add(sub.state);
            }
        }
        counts
    }

    /// Latest backup run in which `category` of `name` finished `Done`, with the bytes it captured.
    pub fn last_backup_bytes(&self, name: &str, category: DataCategory) -> Option<(i64, u64)> {
        self.tx.borrow().iter().rev().find_map(|(ts, run)| {
            if run.run.kind != RunKind::Backup {
                return None;
            }
            let sub = run.package(RecordKind::Package, name)?.sub_record(category)?;
            (sub.state == OperationState::Done).then_some((*ts, sub.byte_count))
        })
    }

    /// Removes a run and all of its records. Returns whether it existed.
    #[instrument(level = "debug", skip(self), err)]
    pub async fn delete_run(&self, timestamp: i64) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let path = self.run_file(timestamp);
        {
            let _lock = StoreFileLock::acquire(&self.dir).await?;
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        let mut existed = false;
        self.tx.send_if_modified(|snapshot| {
            existed = snapshot.contains_key(&timestamp);
            if existed {
                Arc::make_mut(snapshot).remove(&timestamp);
            }
            existed
        });
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;
    use tokio_stream::StreamExt as _;

    use super::*;

    fn package(name: &str, start: i64) -> PackageOperationRecord {
        PackageOperationRecord::new(
            RecordKind::Package,
            name,
            name,
            0,
            &[DataCategory::Executable, DataCategory::UserData],
            start,
        )
    }

    async fn finish_category(store: &RecordStore, ts: i64, name: &str, category: DataCategory, bytes: u64) {
        store
            .update_category(ts, RecordKind::Package, name, category, |r| {
                r.transition(OperationState::Done);
                r.byte_count = bytes;
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn persists_and_reloads_runs() {
        let dir = tempdir().unwrap();
        {
            let store = RecordStore::open(dir.path()).await.unwrap();
            store.begin_run(100, RunKind::Backup, 100).await.unwrap();
            store.begin_package(100, package("com.example.app", 101)).await.unwrap();
            finish_category(&store, 100, "com.example.app", DataCategory::UserData, 42).await;
        }
        assert!(dir.path().join("records/run_100.json").exists());

        let store = RecordStore::open(dir.path()).await.unwrap();
        let records = store.records_for_run(100);
        assert_eq!(records.len(), 1);
        let sub = records[0].sub_record(DataCategory::UserData).unwrap();
        assert_eq!(sub.state, OperationState::Done);
        assert_eq!(sub.byte_count, 42);
    }

    #[tokio::test]
    async fn failed_replace_leaves_no_temporary_file() {
        let dir = tempdir().unwrap();
        let store = RecordStore::open(dir.path()).await.unwrap();
        let blocker = dir.path().join("records/run_200.json");
        std::fs::create_dir_all(blocker.join("occupied")).unwrap();

        assert!(store.begin_run(200, RunKind::Backup, 200).await.is_err());
        assert!(store.run(200).is_none());
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("records"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .filter(|name| name.ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }

    #[tokio::test]
    async fn rejects_regressions_but_keeps_other_fields() {
        let dir = tempdir().unwrap();
        let store = RecordStore::open(dir.path()).await.unwrap();
        store.begin_run(1, RunKind::Backup, 1).await.unwrap();
        store.begin_package(1, package("com.example.app", 1)).await.unwrap();
        finish_category(&store, 1, "com.example.app", DataCategory::UserData, 10).await;

        let accepted = store
            .update_category(1, RecordKind::Package, "com.example.app", DataCategory::UserData, |r| {
                r.state = OperationState::Processing;
                r.append_log("late output");
            })
            .await
            .unwrap();
        assert!(!accepted);
        let record = store.records_for_run(1).remove(0);
        let sub = record.sub_record(DataCategory::UserData).unwrap();
        assert_eq!(sub.state, OperationState::Done);
        assert_eq!(sub.log_text, "late output");

        let accepted = store
            .update_category(1, RecordKind::Package, "com.example.app", DataCategory::UserData, |r| {
                r.transition(OperationState::Error);
            })
            .await
            .unwrap();
        assert!(accepted);
    }

    #[tokio::test]
    async fn finalize_happens_once() {
        let dir = tempdir().unwrap();
        let store = RecordStore::open(dir.path()).await.unwrap();
        store.begin_run(1, RunKind::Restore, 1).await.unwrap();
        store.begin_package(1, package("com.example.app", 1)).await.unwrap();
        store
            .update_category(1, RecordKind::Package, "com.example.app", DataCategory::Executable, |r| {
                r.transition(OperationState::Error);
            })
            .await
            .unwrap();

        let state = store.finalize_package(1, RecordKind::Package, "com.example.app", 5).await.unwrap();
        assert_eq!(state, OperationState::Error);
        let state = store.finalize_package(1, RecordKind::Package, "com.example.app", 9).await.unwrap();
        assert_eq!(state, OperationState::Error);
        assert_eq!(store.records_for_run(1)[0].end_time, Some(5));
        assert_eq!(store.finish_run(1, 10).await.unwrap(), OperationState::Error);
        assert!(store.unfinished().is_empty());
    }

    #[tokio::test]
    async fn counts_and_history_queries() {
        let dir = tempdir().unwrap();
        let store = RecordStore::open(dir.path()).await.unwrap();
        for (ts, bytes) in [(10, 100), (20, 200)] {
            store.begin_run(ts, RunKind::Backup, ts).await.unwrap();
            store.begin_package(ts, package("com.example.app", ts)).await.unwrap();
            store.begin_package(ts, package("org.other.app", ts)).await.unwrap();
            finish_category(&store, ts, "com.example.app", DataCategory::UserData, bytes).await;
        }
        store
            .update_category(20, RecordKind::Package, "org.other.app", DataCategory::UserData, |r| {
                r.transition(OperationState::Skip);
            })
            .await
            .unwrap();

        let counts = store.category_counts(20);
        let user = counts[&DataCategory::UserData];
        assert_eq!((user.done, user.skip, user.total()), (1, 1, 2));
        assert_eq!(counts[&DataCategory::Executable].idle, 2);

        assert_eq!(store.last_backup_bytes("com.example.app", DataCategory::UserData), Some((20, 200)));
        assert_eq!(store.last_backup_bytes("org.other.app", DataCategory::UserData), None);
        assert_eq!(store.records_for_package(RecordKind::Package, "com.example.app").len(), 2);
        assert_eq!(store.unfinished().len(), 4);
        assert_eq!(store.runs().len(), 2);
    }

    #[tokio::test]
    async fn delete_cascades_to_records() {
        let dir = tempdir().unwrap();
        let store = RecordStore::open(dir.path()).await.unwrap();
        store.begin_run(7, RunKind::Backup, 7).await.unwrap();
        store.begin_package(7, package("com.example.app", 7)).await.unwrap();

        assert!(store.delete_run(7).await.unwrap());
        assert!(!store.delete_run(7).await.unwrap());
        assert!(store.records_for_run(7).is_empty());
        assert!(!dir.path().join("records/run_7.json").exists());
        assert!(store.update_category(7, RecordKind::Package, "com.example.app", DataCategory::UserData, |_| {}).await.is_err());
    }

    #[tokio::test]
    async fn subscribers_see_complete_updates() {
        let dir = tempdir().unwrap();
        let store = RecordStore::open(dir.path()).await.unwrap();
        store.begin_run(3, RunKind::Backup, 3).await.unwrap();
        store.begin_package(3, package("com.example.app", 3)).await.unwrap();

        let mut updates = Box::pin(store.watch_run(3));
        let first = updates.next().await.unwrap().unwrap();
        assert_eq!(first.packages.len(), 1);

        store
            .update_category(3, RecordKind::Package, "com.example.app", DataCategory::UserData, |r| {
                r.transition(OperationState::Error);
                r.append_log("tar: short read");
            })
            .await
            .unwrap();
        let next = updates.next().await.unwrap().unwrap();
        let sub = next.packages[0].sub_record(DataCategory::UserData).unwrap();
        assert_eq!((sub.state, sub.log_text.as_str()), (OperationState::Error, "tar: short read"));
    }
}
