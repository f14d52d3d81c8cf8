use std::{
    error::Error,
    path::{Path, PathBuf},
};

use tempfile::TempDir;
use tracing::{debug, info, instrument, warn};

use super::{CANCELLED_MESSAGE, ItemOutcome, RunContext, RunSummary, StepOutcome};
use crate::{
    archive::ExtractSpec,
    models::{
        CompressionKind, DataCategory, MediaRestoreEntry, OperationStage, OperationState, PackageConfig,
        PackageOperationRecord, PackageRestoreEntry, RecordKind, RunKind,
    },
    paths::BackupLayout,
    pipeline::RestoreRequest,
    shell::{EXIT_CANCELLED, ShellResult, pm, selinux},
    utils::now_millis,
};

pub(super) async fn run(ctx: &RunContext<'_>, request: &RestoreRequest) -> RunSummary {
    let mut summary = RunSummary {
        timestamp: ctx.timestamp,
        kind: RunKind::Restore,
        outcomes: Vec::new(),
        deselect: Vec::new(),
        cancelled: false,
    };
    let reset = ctx.settings.reset_selection_after_restore;

    for entry in request.packages.iter().filter(|e| e.selected) {
        if ctx.is_cancelled() {
            break;
        }
        let state = restore_package(ctx, entry, request.from_remote).await;
        let name = entry.package.to_string();
        if reset && state == OperationState::Done {
            summary.deselect.push(name.clone());
        }
        summary.outcomes.push(ItemOutcome { kind: RecordKind::Package, name, state });
    }
    for entry in request.media.iter().filter(|e| e.selected) {
        if ctx.is_cancelled() {
            break;
        }
        let state = restore_media(ctx, entry, request.from_remote).await;
        if reset && state == OperationState::Done {
            summary.deselect.push(entry.name.clone());
        }
        summary.outcomes.push(ItemOutcome { kind: RecordKind::Media, name: entry.name.clone(), state });
    }

    summary.cancelled = ctx.is_cancelled();
    summary
}

/// Where the archives of one backup set live for the duration of a restore.
struct ArchiveSource<'a> {
    kind: RecordKind,
    name: &'a str,
    /// Local directory of the backup set.
    local_dir: PathBuf,
    compression: CompressionKind,
    from_remote: bool,
    scratch: TempDir,
}

impl ArchiveSource<'_> {
    fn file_path(&self, category: DataCategory) -> PathBuf {
        self.local_dir.join(BackupLayout::category_file_name(category, self.compression))
    }

    /// Returns the local archive, downloading it into scratch space when needed.
    ///
    /// A missing archive is an error for required categories and a skip otherwise.
    async fn locate(&self, ctx: &RunContext<'_>, category: DataCategory, required: bool) -> Result<PathBuf, ShellResult> {
        let local = self.file_path(category);
        if !self.from_remote && ctx.bridge.exists(&local).await {
            return Ok(local);
        }

        let missing = |message: String| {
            if required { ShellResult::failure(message) } else { ShellResult::not_present(message) }
        };
        if ctx.remote.is_none() {
            return Err(missing(format!("Archive not found: {}", local.display())));
        }

        ctx.update(self.kind, self.name, category, |r| r.stage = OperationStage::Download).await;
        let remote = ctx.remote().await.map_err(ShellResult::failure)?;
        let Some(remote_file) = ctx.layout.relative(&local) else {
            return Err(ShellResult::failure(format!("{} is outside the backup root", local.display())));
        };
        match remote.download(&remote_file, self.scratch.path(), ctx.cancel_token()).await {
            Ok(path) => {
                debug!(%category, remote_file, "Downloaded archive");
                Ok(path)
            }
            Err(_) if ctx.is_cancelled() => Err(ShellResult::cancelled(Vec::new())),
            Err(e) => {
                warn!(error = e.as_ref() as &dyn Error, %category, remote_file, "Failed to download archive");
                Err(missing(format!("Archive not found: {remote_file}: {e:#}")))
            }
        }
    }
}

async fn scratch_dir(ctx: &RunContext<'_>) -> Result<TempDir, String> {
    fs_err::tokio::create_dir_all(&ctx.settings.data_dir)
        .await
        .and_then(|()| tempfile::Builder::new().prefix("restore-").tempdir_in(&ctx.settings.data_dir))
        .map_err(|e| format!("Failed to create scratch directory: {e}"))
}

#[instrument(skip_all, fields(package = %entry.package, user_id = entry.user_id, backup = entry.backup_timestamp))]
async fn restore_package(ctx: &RunContext<'_>, entry: &PackageRestoreEntry, from_remote: bool) -> OperationState {
    let name = entry.package.as_str();
    let user_id = entry.user_id;
    let kind = RecordKind::Package;
    let record = PackageOperationRecord::new(kind, name, &entry.label, user_id, &DataCategory::ALL, now_millis());
    if let Err(e) = ctx.store.begin_package(ctx.timestamp, record).await {
        warn!(error = e.as_ref() as &dyn Error, "Failed to create package record");
        return OperationState::Error;
    }
    for category in DataCategory::ALL.into_iter().filter(|c| !entry.categories.contains(c)) {
        ctx.finish_with(kind, name, category, OperationState::Skip, "Not selected").await;
    }

    let scratch = match scratch_dir(ctx).await {
        Ok(scratch) => scratch,
        Err(message) => {
            for category in entry.categories.iter().copied() {
                ctx.finish_with(kind, name, category, OperationState::Error, &message).await;
            }
            return ctx.finalize(kind, name).await;
        }
    };
    let source = ArchiveSource {
        kind,
        name,
        local_dir: ctx.layout.package_dir(name, entry.backup_timestamp),
        compression: entry.compression,
        from_remote,
        scratch,
    };

    let mut stopped = false;
    for category in DataCategory::ALL.into_iter().filter(|c| entry.categories.contains(c)) {
        if ctx.is_cancelled() {
            break;
        }
        let stage = match category {
            DataCategory::Executable => OperationStage::Install,
            DataCategory::Config => OperationStage::Apply,
            _ => OperationStage::Extract,
        };
        ctx.start_category(kind, name, category, stage).await;

        if category.is_data() && !stopped {
            stopped = true;
            let result = ctx.runner.run(&pm::force_stop_tokens(name, user_id), ctx.cancel_token()).await;
            if !result.is_success() {
                debug!(exit_code = result.exit_code, "Force-stop failed, continuing");
            }
        }

        let result = match category {
            DataCategory::Executable => restore_executable(ctx, &source, user_id).await,
            DataCategory::Config => restore_config(ctx, &source, user_id).await,
            _ => restore_data(ctx, &source, user_id, category).await,
        };
        let outcome = StepOutcome::new(result);
        ctx.finish_category(kind, name, category, stage, &outcome).await;
        if outcome.result.exit_code == EXIT_CANCELLED {
            break;
        }
    }

    if ctx.is_cancelled() {
        info!("Restore cancelled");
        ctx.fail_unfinished(kind, name, CANCELLED_MESSAGE).await;
    }
    ctx.finalize(kind, name).await
}

async fn restore_executable(ctx: &RunContext<'_>, source: &ArchiveSource<'_>, user_id: u32) -> ShellResult {
    let archive = match source.locate(ctx, DataCategory::Executable, true).await {
        Ok(archive) => archive,
        Err(result) => return result,
    };
    let mut result = ctx.archive.test(&archive, source.compression, ctx.cancel_token()).await;
    if !result.is_success() {
        result.output_lines.push("Archive is corrupt".to_string());
        return result;
    }

    let apk_dir = source.scratch.path().join("apk");
    if !ctx.bridge.mkdirs(&apk_dir).await {
        return ShellResult::failure(format!("Failed to create {}", apk_dir.display()));
    }
    let spec = ExtractSpec {
        src: &archive,
        dst_dir: &apk_dir,
        exclusions: &[],
        clean: false,
        touch: false,
        kind: source.compression,
    };
    result.merge(ctx.archive.decompress(&spec, ctx.cancel_token()).await);
    if !result.is_success() {
        return result;
    }

    let apks: Vec<String> =
        ctx.bridge.list_paths(&apk_dir).await.into_iter().filter(|p| p.ends_with(".apk")).collect();
    if apks.is_empty() {
        result.merge(ShellResult::failure("Archive contains no apk"));
        return result;
    }
    debug!(count = apks.len(), "Installing apks");
    result.merge(ctx.bridge.install_packages(&apks, user_id).await);
    if result.is_success() && !ctx.bridge.query_installed(source.name, user_id).await {
        result.merge(ShellResult::failure("Package is still not installed"));
    }
    result
}

async fn restore_data(
    ctx: &RunContext<'_>,
    source: &ArchiveSource<'_>,
    user_id: u32,
    category: DataCategory,
) -> ShellResult {
    let name = source.name;
    let uid = ctx.bridge.package_uid(name, user_id).await;
    let Ok(uid) = i32::try_from(uid) else {
        return ShellResult::failure(format!("Invalid uid {uid}"));
    };
    if uid == -1 {
        return ShellResult::failure("Package is not installed");
    }
    let (Some(origin_dir), Some(origin)) =
        (ctx.device.origin_dir(category, user_id), ctx.device.origin_path(category, user_id, name))
    else {
        return ShellResult::failure(format!("{category} has no origin directory"));
    };

    let archive = match source.locate(ctx, category, category.is_required()).await {
        Ok(archive) => archive,
        Err(result) => return result,
    };
    let mut result = ctx.archive.test(&archive, source.compression, ctx.cancel_token()).await;
    if !result.is_success() {
        result.output_lines.push("Archive is corrupt".to_string());
        return result;
    }

    if !ctx.bridge.mkdirs(&origin_dir).await {
        return ShellResult::failure(format!("Failed to create {}", origin_dir.display()));
    }
    let context = selinux_context(ctx, &origin, &origin_dir).await;

    let exclusions = category.exclusions(name);
    let spec = ExtractSpec {
        src: &archive,
        dst_dir: &origin_dir,
        exclusions: &exclusions,
        clean: ctx.settings.clean_restoring,
        touch: true,
        kind: source.compression,
    };
    result.merge(ctx.archive.decompress(&spec, ctx.cancel_token()).await);
    if !result.is_success() {
        return result;
    }

    let gid = if category.is_external() {
        match ctx.bridge.stat(&origin_dir).await {
            Some(stat) => stat.gid,
            None => uid.unsigned_abs(),
        }
    } else {
        uid.unsigned_abs()
    };
    result.merge(ctx.runner.run(&selinux::chown_tokens(uid, gid, &origin), ctx.cancel_token()).await);
    match context {
        Some(context) => {
            result.merge(ctx.runner.run(&selinux::chcon_tokens(&context, &origin), ctx.cancel_token()).await)
        }
        None => debug!(%category, "No SELinux context found, skipping relabel"),
    }
    result
}

/// Label of the existing data directory, or one derived from its parent.
async fn selinux_context(ctx: &RunContext<'_>, origin: &Path, origin_dir: &Path) -> Option<String> {
    let current = ctx.runner.run(&selinux::context_tokens(origin), None).await;
    if let Some(context) = selinux::parse_context(&current.output_lines) {
        return Some(context);
    }
    let parent = ctx.runner.run(&selinux::context_tokens(origin_dir), None).await;
    selinux::parse_context(&parent.output_lines).map(|c| selinux::app_context_from_parent(&c))
}

async fn restore_config(ctx: &RunContext<'_>, source: &ArchiveSource<'_>, user_id: u32) -> ShellResult {
    let name = source.name;
    let path = match source.locate(ctx, DataCategory::Config, false).await {
        Ok(path) => path,
        Err(result) => return result,
    };
    let text = match ctx.bridge.try_read_text(&path).await {
        Ok(text) => text,
        Err(e) => return ShellResult::failure(format!("Failed to read {}: {e}", path.display())),
    };
    let config: PackageConfig = match serde_json::from_str(&text) {
        Ok(config) => config,
        Err(e) => return ShellResult::failure(format!("Failed to parse package config: {e}")),
    };

    let mut granted = 0;
    let mut failed = Vec::new();
    for permission in &config.permissions {
        let applied = if permission.granted {
            ctx.bridge.grant_permission(name, &permission.name, user_id).await
        } else {
            ctx.bridge.revoke_permission(name, &permission.name, user_id).await
        };
        match (applied, permission.granted) {
            (true, true) => granted += 1,
            (true, false) => {}
            (false, _) => failed.push(permission.name.clone()),
        }
    }
    if !failed.is_empty() {
        warn!(failed = ?failed, "Some runtime permissions could not be applied");
    }
    let mut result = ShellResult::ok(format!(
        "Applied {} runtime permissions ({granted} granted), {} failed",
        config.permissions.len() - failed.len(),
        failed.len()
    ));

    if let Some(ssaid) = config.ssaid.as_deref() {
        if ctx.bridge.set_device_scoped_id(name, user_id, ssaid).await {
            result.output_lines.push("Restored device id".to_string());
        } else {
            result.merge(ShellResult::failure("Failed to restore device id"));
        }
    }
    result
}

#[instrument(skip_all, fields(media = %entry.name, backup = entry.backup_timestamp))]
async fn restore_media(ctx: &RunContext<'_>, entry: &MediaRestoreEntry, from_remote: bool) -> OperationState {
    let kind = RecordKind::Media;
    let name = entry.name.as_str();
    let category = DataCategory::MediaData;
    let record =
        PackageOperationRecord::new(kind, name, name, ctx.settings.user_id, &[category], now_millis());
    if let Err(e) = ctx.store.begin_package(ctx.timestamp, record).await {
        warn!(error = e.as_ref() as &dyn Error, "Failed to create media record");
        return OperationState::Error;
    }
    ctx.start_category(kind, name, category, OperationStage::Extract).await;

    let result = match scratch_dir(ctx).await {
        Ok(scratch) => {
            let source = ArchiveSource {
                kind,
                name,
                local_dir: ctx.layout.media_dir(name, entry.backup_timestamp),
                compression: entry.compression,
                from_remote,
                scratch,
            };
            extract_media(ctx, &source, &entry.path).await
        }
        Err(message) => ShellResult::failure(message),
    };
    ctx.finish_category(kind, name, category, OperationStage::Extract, &StepOutcome::new(result)).await;
    if ctx.is_cancelled() {
        ctx.fail_unfinished(kind, name, CANCELLED_MESSAGE).await;
    }
    ctx.finalize(kind, name).await
}

async fn extract_media(ctx: &RunContext<'_>, source: &ArchiveSource<'_>, device_path: &str) -> ShellResult {
    let archive = match source.locate(ctx, DataCategory::MediaData, true).await {
        Ok(archive) => archive,
        Err(result) => return result,
    };
    let mut result = ctx.archive.test(&archive, source.compression, ctx.cancel_token()).await;
    if !result.is_success() {
        result.output_lines.push("Archive is corrupt".to_string());
        return result;
    }
    let Some(parent) = Path::new(device_path).parent() else {
        return ShellResult::failure(format!("{device_path} has no parent directory"));
    };
    let dst_dir = ctx.device.resolve(&parent.to_string_lossy());
    if !ctx.bridge.mkdirs(&dst_dir).await {
        return ShellResult::failure(format!("Failed to create {}", dst_dir.display()));
    }
    let spec = ExtractSpec {
        src: &archive,
        dst_dir: &dst_dir,
        exclusions: &[],
        clean: ctx.settings.clean_restoring,
        touch: true,
        kind: source.compression,
    };
    result.merge(ctx.archive.decompress(&spec, ctx.cancel_token()).await);
    result
}
