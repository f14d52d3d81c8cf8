//! Backup and restore runs.
//!
//! At most one run is active at a time; packages and their categories are
//! processed strictly in sequence because every step goes through the same
//! privileged channel and root shell.

use std::{
    collections::HashMap,
    error::Error,
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
};

use anyhow::{Context, Result, anyhow, bail, ensure};
use tokio::{
    sync::{Mutex, OnceCell, RwLock, Semaphore},
    task::JoinHandle,
};
use tokio_stream::{StreamExt, wrappers::WatchStream};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, instrument, warn};

use crate::{
    archive::ArchiveEngine,
    bridge::RootSession,
    models::{
        CategoryOperationRecord, DataCategory, MediaEntry, MediaRestoreEntry, OperationStage,
        OperationState, PackageEntry, PackageRestoreEntry, RecordKind, RunKind, Settings,
    },
    paths::{ARCHIVES_DIR, BackupLayout, DeviceLayout},
    records::RecordStore,
    remote::{self, RemoteStorage},
    shell::{CommandRunner, EXIT_CANCELLED, ShellResult},
    utils::now_millis,
};

mod backup;
mod restore;

macro_rules! acquire_permit_or_cancel {
    ($semaphore:expr, $token:expr, $semaphore_name:literal) => {{
        if $token.is_cancelled() {
            info!(concat!("Run already cancelled before ", $semaphore_name, " semaphore acquisition"));
            return Err(anyhow!(concat!("Run cancelled before ", $semaphore_name)));
        }

        debug!(concat!("Waiting for ", $semaphore_name, " semaphore"));
        tokio::select! {
            permit = $semaphore.acquire() => permit,
            _ = $token.cancelled() => {
                info!(concat!("Run cancelled while waiting for ", $semaphore_name, " semaphore"));
                return Err(anyhow!(concat!("Run cancelled while waiting for ", $semaphore_name, " semaphore")));
            }
        }
    }};
}

pub(crate) const CANCELLED_MESSAGE: &str = "Cancelled";

#[derive(Debug, Clone, Default)]
pub struct BackupRequest {
    pub packages: Vec<PackageEntry>,
    pub media: Vec<MediaEntry>,
}

#[derive(Debug, Clone, Default)]
pub struct RestoreRequest {
    pub packages: Vec<PackageRestoreEntry>,
    pub media: Vec<MediaRestoreEntry>,
    /// Fetch every archive from remote storage instead of the local backup root.
    pub from_remote: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemOutcome {
    pub kind: RecordKind,
    pub name: String,
    pub state: OperationState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub timestamp: i64,
    pub kind: RunKind,
    pub outcomes: Vec<ItemOutcome>,
    /// Items whose selection should be cleared (restore with reset enabled).
    pub deselect: Vec<String>,
    pub cancelled: bool,
}

impl RunSummary {
    pub fn outcome(&self, kind: RecordKind, name: &str) -> Option<OperationState> {
        self.outcomes.iter().find(|o| o.kind == kind && o.name == name).map(|o| o.state)
    }
}

/// Terminal result of one category step.
#[derive(Debug)]
pub(crate) struct StepOutcome {
    pub result: ShellResult,
    pub bytes: u64,
    /// Stays `Processing` at the upload stage instead of finishing.
    pub pending_upload: bool,
}

impl StepOutcome {
    pub fn new(result: ShellResult) -> Self {
        Self { result, bytes: 0, pending_upload: false }
    }

    pub fn with_bytes(mut self, bytes: u64) -> Self {
        self.bytes = bytes;
        self
    }

    pub fn state(&self) -> OperationState {
        if self.result.exit_code == EXIT_CANCELLED {
            return OperationState::Error;
        }
        OperationState::from_exit_code(self.result.exit_code)
    }
}

/// Everything one run needs, resolved from the settings at its start.
pub(crate) struct RunContext<'a> {
    pub timestamp: i64,
    pub settings: Settings,
    pub bridge: &'a RootSession,
    pub runner: &'a dyn CommandRunner,
    pub archive: ArchiveEngine,
    pub store: &'a RecordStore,
    pub remote: Option<Arc<dyn RemoteStorage>>,
    remote_ready: OnceCell<Result<(), String>>,
    pub layout: BackupLayout,
    pub device: DeviceLayout,
    pub cancel: CancellationToken,
}

impl RunContext<'_> {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> Option<&CancellationToken> {
        Some(&self.cancel)
    }

    /// Connects the remote once per run; later calls return the first outcome.
    pub async fn remote(&self) -> Result<Arc<dyn RemoteStorage>, String> {
        let Some(remote) = self.remote.clone() else {
            return Err("Remote storage is not configured".to_string());
        };
        self.remote_ready
            .get_or_init(|| async {
                remote.connect().await.map_err(|e| {
                    warn!(error = e.as_ref() as &dyn Error, "Failed to connect remote storage");
                    format!("Failed to connect remote storage: {e:#}")
                })
            })
            .await
            .clone()
            .map(|()| remote)
    }

    /// Applies `update` to a category record, logging store failures.
    pub async fn update(
        &self,
        kind: RecordKind,
        name: &str,
        category: DataCategory,
        update: impl FnOnce(&mut CategoryOperationRecord),
    ) {
        if let Err(e) = self.store.update_category(self.timestamp, kind, name, category, update).await {
            warn!(error = e.as_ref() as &dyn Error, name, %category, "Failed to update record");
        }
    }

    pub async fn start_category(&self, kind: RecordKind, name: &str, category: DataCategory, stage: OperationStage) {
        self.update(kind, name, category, |r| {
            r.transition(OperationState::Processing);
            r.stage = stage;
        })
        .await;
    }

    /// Writes the outcome of a category step.
    pub async fn finish_category(
        &self,
        kind: RecordKind,
        name: &str,
        category: DataCategory,
        stage: OperationStage,
        outcome: &StepOutcome,
    ) {
        let state = if outcome.pending_upload && outcome.state() == OperationState::Done {
            OperationState::Processing
        } else {
            outcome.state()
        };
        debug!(name, %category, %state, exit_code = outcome.result.exit_code, "Category step finished");
        self.update(kind, name, category, |r| {
            r.transition(state);
            r.stage = if outcome.pending_upload && state == OperationState::Processing {
                OperationStage::Upload
            } else {
                stage
            };
            if outcome.bytes > 0 {
                r.byte_count = outcome.bytes;
            }
            r.append_result(&outcome.result);
            if outcome.result.exit_code == EXIT_CANCELLED {
                r.append_log(CANCELLED_MESSAGE);
            }
        })
        .await;
    }

    pub async fn finish_with(
        &self,
        kind: RecordKind,
        name: &str,
        category: DataCategory,
        state: OperationState,
        log: &str,
    ) {
        self.update(kind, name, category, |r| {
            r.transition(state);
            r.append_log(log);
        })
        .await;
    }

    /// Marks every still unfinished category `Error` with `message`.
    pub async fn fail_unfinished(&self, kind: RecordKind, name: &str, message: &str) {
        let Some(record) = self.store.run(self.timestamp).and_then(|r| r.package(kind, name).cloned()) else {
            return;
        };
        for sub in record.sub_records.iter().filter(|s| s.state.is_unfinished()) {
            self.finish_with(kind, name, sub.category, OperationState::Error, message).await;
        }
    }

    /// Finalizes a record, returning its overall state.
    pub async fn finalize(&self, kind: RecordKind, name: &str) -> OperationState {
        match self.store.finalize_package(self.timestamp, kind, name, now_millis()).await {
            Ok(state) => state,
            Err(e) => {
                warn!(error = e.as_ref() as &dyn Error, name, "Failed to finalize record");
                OperationState::Error
            }
        }
    }
}

/// Schedules backup and restore runs, one at a time.
#[derive(Debug)]
pub struct OperationManager {
    run_semaphore: Semaphore,
    runs: Mutex<HashMap<i64, (RunKind, CancellationToken)>>,
    last_timestamp: AtomicI64,
    bridge: Arc<RootSession>,
    runner: Arc<dyn CommandRunner>,
    store: Arc<RecordStore>,
    remote: RwLock<Option<Arc<dyn RemoteStorage>>>,
    settings: RwLock<Settings>,
}

impl OperationManager {
    pub fn new(
        bridge: Arc<RootSession>,
        runner: Arc<dyn CommandRunner>,
        store: Arc<RecordStore>,
        settings: Settings,
    ) -> Arc<Self> {
        let remote = settings.remote.as_ref().map(remote::from_settings);
        Arc::new(Self {
            run_semaphore: Semaphore::new(1),
            runs: Mutex::new(HashMap::new()),
            last_timestamp: AtomicI64::new(0),
            bridge,
            runner,
            store,
            remote: RwLock::new(remote),
            settings: RwLock::new(settings),
        })
    }

    /// Follows settings changes; the remote client is rebuilt from each update.
    pub fn watch_settings(self: &Arc<Self>, mut settings_stream: WatchStream<Settings>) {
        tokio::spawn({
            let handle = self.clone();
            async move {
                while let Some(settings) = settings_stream.next().await {
                    debug!("Operation manager received settings update");
                    let remote = settings.remote.as_ref().map(remote::from_settings);
                    *handle.remote.write().await = remote;
                    *handle.settings.write().await = settings;
                }
            }
            .instrument(info_span!("task_settings_watch"))
        });
    }

    /// Replaces the remote client used by runs started afterwards.
    pub async fn set_remote(&self, remote: Option<Arc<dyn RemoteStorage>>) {
        *self.remote.write().await = remote;
    }

    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    /// Allocates a strictly increasing millisecond timestamp.
    fn next_timestamp(&self) -> i64 {
        let now = now_millis();
        let mut last = self.last_timestamp.load(Ordering::SeqCst);
        loop {
            let next = now.max(last + 1);
            match self.last_timestamp.compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => return next,
                Err(actual) => last = actual,
            }
        }
    }

    async fn register(&self, kind: RunKind) -> (i64, CancellationToken) {
        let timestamp = self.next_timestamp();
        let token = CancellationToken::new();
        self.runs.lock().await.insert(timestamp, (kind, token.clone()));
        (timestamp, token)
    }

    /// Cancels a queued or active run. Returns whether it was found.
    #[instrument(skip(self))]
    pub async fn cancel(&self, timestamp: i64) -> bool {
        let runs = self.runs.lock().await;
        if let Some((kind, token)) = runs.get(&timestamp) {
            info!(%kind, active_runs = runs.len(), "Cancelling run");
            token.cancel();
            true
        } else {
            warn!(active_runs = runs.len(), "Run not found for cancellation, may have already completed");
            false
        }
    }

    pub async fn backup(&self, request: BackupRequest) -> Result<RunSummary> {
        let (timestamp, token) = self.register(RunKind::Backup).await;
        self.run_backup(timestamp, token, request).await
    }

    pub async fn restore(&self, request: RestoreRequest) -> Result<RunSummary> {
        let (timestamp, token) = self.register(RunKind::Restore).await;
        self.run_restore(timestamp, token, request).await
    }

    /// Queues a backup run, returning its timestamp right away.
    pub async fn spawn_backup(self: &Arc<Self>, request: BackupRequest) -> (i64, JoinHandle<Result<RunSummary>>) {
        let (timestamp, token) = self.register(RunKind::Backup).await;
        let handle = self.clone();
        let join = tokio::spawn(async move { handle.run_backup(timestamp, token, request).await });
        (timestamp, join)
    }

    /// Queues a restore run, returning its timestamp right away.
    pub async fn spawn_restore(self: &Arc<Self>, request: RestoreRequest) -> (i64, JoinHandle<Result<RunSummary>>) {
        let (timestamp, token) = self.register(RunKind::Restore).await;
        let handle = self.clone();
        let join = tokio::spawn(async move { handle.run_restore(timestamp, token, request).await });
        (timestamp, join)
    }

    async fn run_backup(&self, timestamp: i64, token: CancellationToken, request: BackupRequest) -> Result<RunSummary> {
        let result = self.execute_backup(timestamp, &token, &request).await;
        self.runs.lock().await.remove(&timestamp);
        result
    }

    async fn run_restore(&self, timestamp: i64, token: CancellationToken, request: RestoreRequest) -> Result<RunSummary> {
        let result = self.execute_restore(timestamp, &token, &request).await;
        self.runs.lock().await.remove(&timestamp);
        result
    }

    #[instrument(skip(self, token, request), fields(packages = request.packages.len(), media = request.media.len()))]
    async fn execute_backup(
        &self,
        timestamp: i64,
        token: &CancellationToken,
        request: &BackupRequest,
    ) -> Result<RunSummary> {
        let _permit = acquire_permit_or_cancel!(self.run_semaphore, token, "run")?;
        let ctx = self.context(timestamp, token.clone()).await;
        self.store.begin_run(timestamp, RunKind::Backup, now_millis()).await?;
        let summary = backup::run(&ctx, request).await;
        let state = self.store.finish_run(timestamp, now_millis()).await?;
        info!(%state, cancelled = summary.cancelled, "Backup run finished");
        Ok(summary)
    }

    #[instrument(skip(self, token, request), fields(packages = request.packages.len(), media = request.media.len()))]
    async fn execute_restore(
        &self,
        timestamp: i64,
        token: &CancellationToken,
        request: &RestoreRequest,
    ) -> Result<RunSummary> {
        let _permit = acquire_permit_or_cancel!(self.run_semaphore, token, "run")?;
        let ctx = self.context(timestamp, token.clone()).await;
        self.store.begin_run(timestamp, RunKind::Restore, now_millis()).await?;
        let summary = restore::run(&ctx, request).await;
        let state = self.store.finish_run(timestamp, now_millis()).await?;
        info!(%state, cancelled = summary.cancelled, "Restore run finished");
        Ok(summary)
    }

    /// Connects the configured remote and runs the probe directory round trip.
    #[instrument(skip(self), err)]
    pub async fn test_remote(&self) -> Result<()> {
        let Some(remote) = self.remote.read().await.clone() else {
            bail!("Remote storage is not configured");
        };
        remote.connect().await.context("Failed to connect remote storage")?;
        remote.test_connection().await
    }

    /// Deletes the archives of one backup, locally and on the remote if one is
    /// configured. Waits for the active run to finish first.
    #[instrument(skip(self), err)]
    pub async fn delete_backup(&self, kind: RecordKind, name: &str, timestamp: i64) -> Result<()> {
        let _permit = self.run_semaphore.acquire().await?;
        let layout = BackupLayout::new(&self.settings.read().await.backup_root);
        let dir = match kind {
            RecordKind::Package => layout.package_dir(name, timestamp),
            RecordKind::Media => layout.media_dir(name, timestamp),
        };
        if self.bridge.exists(&dir).await {
            ensure!(self.bridge.delete(&dir).await, "Failed to delete {}", dir.display());
            info!(path = %dir.display(), "Deleted local backup");
        }

        let Some(remote) = self.remote.read().await.clone() else {
            return Ok(());
        };
        let Some(remote_dir) = layout.relative(&dir) else {
            bail!("{} is outside of the backup root", dir.display());
        };
        remote.connect().await.context("Failed to connect remote storage")?;
        remote.purge(&remote_dir).await.context("Failed to purge remote backup")?;
        remote.clear_empty_dirs(ARCHIVES_DIR).await.context("Failed to clear empty remote directories")?;
        info!(remote_dir, "Deleted remote backup");
        Ok(())
    }

    async fn context(&self, timestamp: i64, cancel: CancellationToken) -> RunContext<'_> {
        let settings = self.settings.read().await.clone();
        let remote = self.remote.read().await.clone();
        RunContext {
            timestamp,
            layout: BackupLayout::new(&settings.backup_root),
            device: DeviceLayout::new(&settings.device_root),
            settings,
            bridge: &self.bridge,
            runner: self.runner.as_ref(),
            archive: ArchiveEngine::new(self.runner.clone()),
            store: &self.store,
            remote,
            remote_ready: OnceCell::new(),
            cancel,
        }
    }
}
