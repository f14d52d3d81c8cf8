use std::{
    collections::BTreeSet,
    error::Error,
    path::{Path, PathBuf},
};

use tracing::{debug, info, instrument, warn};

use super::{CANCELLED_MESSAGE, ItemOutcome, RunContext, RunSummary, StepOutcome};
use crate::{
    archive::CompressSpec,
    models::{
        DataCategory, MediaEntry, OperationStage, OperationState, PackageConfig, PackageEntry,
        PackageOperationRecord, RecordKind, RunKind,
    },
    pipeline::BackupRequest,
    settings::SETTINGS_FILE,
    shell::{EXIT_CANCELLED, ShellResult, pm},
    utils::{format_timestamp, human_size, now_millis},
};

pub(super) async fn run(ctx: &RunContext<'_>, request: &BackupRequest) -> RunSummary {
    let mut summary = RunSummary {
        timestamp: ctx.timestamp,
        kind: RunKind::Backup,
        outcomes: Vec::new(),
        deselect: Vec::new(),
        cancelled: false,
    };

    for entry in &request.packages {
        if ctx.is_cancelled() {
            break;
        }
        let state = backup_package(ctx, entry).await;
        summary.outcomes.push(ItemOutcome {
            kind: RecordKind::Package,
            name: entry.package.to_string(),
            state,
        });
    }
    for entry in &request.media {
        if ctx.is_cancelled() {
            break;
        }
        let state = backup_media(ctx, entry).await;
        summary.outcomes.push(ItemOutcome { kind: RecordKind::Media, name: entry.name.clone(), state });
    }

    save_settings_snapshot(ctx).await;
    summary.cancelled = ctx.is_cancelled();
    summary
}

/// Keeps a copy of the engine settings under `configs/`, next to the archives.
async fn save_settings_snapshot(ctx: &RunContext<'_>) {
    let configs_dir = ctx.layout.configs_dir();
    let path = configs_dir.join(SETTINGS_FILE);
    let json = match serde_json::to_vec_pretty(&ctx.settings) {
        Ok(json) => json,
        Err(e) => {
            warn!(error = &e as &dyn Error, "Failed to serialize settings snapshot");
            return;
        }
    };
    if !ctx.bridge.mkdirs(&configs_dir).await || !ctx.bridge.write_bytes(&path, json).await {
        warn!(path = %path.display(), "Failed to save settings snapshot");
        return;
    }
    debug!(path = %path.display(), "Saved settings snapshot");
    if ctx.remote.is_some() && !ctx.is_cancelled() {
        upload_untracked(ctx, &path, &configs_dir).await;
    }
}

#[instrument(skip_all, fields(package = %entry.package, user_id = entry.user_id))]
async fn backup_package(ctx: &RunContext<'_>, entry: &PackageEntry) -> OperationState {
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

    if ctx.settings.kill_app_before_backup {
        let result = ctx.runner.run(&pm::force_stop_tokens(name, user_id), ctx.cancel_token()).await;
        if !result.is_success() {
            debug!(exit_code = result.exit_code, output = %result.output(), "Force-stop failed, continuing");
        }
    }

    let uid = ctx.bridge.package_uid(name, user_id).await;
    let source_dir = ctx.bridge.package_source_dir(name, user_id).await;
    if uid == -1 && source_dir.is_empty() {
        warn!("Package is not installed");
        for category in entry.categories.iter().copied() {
            ctx.finish_with(kind, name, category, OperationState::Error, "Package is not installed").await;
        }
        return ctx.finalize(kind, name).await;
    }

    let package_dir = ctx.layout.package_dir(name, ctx.timestamp);
    if !ctx.bridge.mkdirs(&package_dir).await {
        let message = format!("Failed to create {}", package_dir.display());
        for category in entry.categories.iter().copied() {
            ctx.finish_with(kind, name, category, OperationState::Error, &message).await;
        }
        return ctx.finalize(kind, name).await;
    }

    let has_remote = ctx.remote.is_some();
    let mut archived = BTreeSet::new();
    let mut pending_uploads = Vec::new();

    let archive_categories =
        DataCategory::ALL.into_iter().filter(|c| entry.categories.contains(c) && *c != DataCategory::Config);
    for category in archive_categories {
        if ctx.is_cancelled() {
            break;
        }
        ctx.start_category(kind, name, category, OperationStage::Archive).await;
        let mut outcome = match category {
            DataCategory::Executable => backup_executable(ctx, name, &source_dir).await,
            _ => backup_data(ctx, name, user_id, category).await,
        };
        let state = outcome.state();
        outcome.pending_upload = has_remote && state == OperationState::Done;
        ctx.finish_category(kind, name, category, OperationStage::Archive, &outcome).await;

        if outcome.result.exit_code == EXIT_CANCELLED {
            break;
        }
        if state == OperationState::Done {
            archived.insert(category);
            if outcome.pending_upload {
                let path = ctx.layout.category_path(name, ctx.timestamp, category, ctx.settings.compression);
                pending_uploads.push((category, path));
            }
        }
    }

    if ctx.is_cancelled() {
        info!("Backup cancelled");
        ctx.fail_unfinished(kind, name, CANCELLED_MESSAGE).await;
        return ctx.finalize(kind, name).await;
    }

    let config_selected = entry.categories.contains(&DataCategory::Config);
    if config_selected {
        ctx.start_category(kind, name, DataCategory::Config, OperationStage::CapturingMetadata).await;
        archived.insert(DataCategory::Config);
    }
    let config_path =
        ctx.layout.category_path(name, ctx.timestamp, DataCategory::Config, ctx.settings.compression);
    let config_result = write_package_config(ctx, entry, i32::try_from(uid).unwrap_or(-1), archived, &config_path).await;
    let config_written = config_result.is_success();
    if config_selected {
        let mut outcome = StepOutcome::new(config_result);
        outcome.pending_upload = has_remote && config_written;
        ctx.finish_category(kind, name, DataCategory::Config, OperationStage::CapturingMetadata, &outcome)
            .await;
        if outcome.pending_upload {
            pending_uploads.push((DataCategory::Config, config_path.clone()));
        }
    }

    if has_remote {
        upload_pending(ctx, kind, name, &package_dir, &pending_uploads).await;
        if config_written && !config_selected {
            upload_untracked(ctx, &config_path, &package_dir).await;
        }
    }

    if ctx.is_cancelled() {
        ctx.fail_unfinished(kind, name, CANCELLED_MESSAGE).await;
    }
    ctx.finalize(kind, name).await
}

async fn backup_executable(ctx: &RunContext<'_>, name: &str, source_dir: &str) -> StepOutcome {
    if source_dir.is_empty() {
        return StepOutcome::new(ShellResult::failure("No installed apk found"));
    }
    let source = Path::new(source_dir);
    let bytes = ctx.bridge.calculate_size(source).await;
    let dst = ctx.layout.category_path(name, ctx.timestamp, DataCategory::Executable, ctx.settings.compression);
    let mut result = ctx
        .archive
        .compress_in_dir(
            source,
            "./*.apk",
            &dst,
            ctx.settings.compression,
            ctx.settings.compression_level,
            ctx.cancel_token(),
        )
        .await;
    verify_archive(ctx, &dst, &mut result).await;
    StepOutcome::new(result).with_bytes(bytes)
}

async fn backup_data(ctx: &RunContext<'_>, name: &str, user_id: u32, category: DataCategory) -> StepOutcome {
    let (Some(origin_dir), Some(origin)) =
        (ctx.device.origin_dir(category, user_id), ctx.device.origin_path(category, user_id, name))
    else {
        return StepOutcome::new(ShellResult::failure(format!("{category} has no origin directory")));
    };

    if !ctx.bridge.exists(&origin).await {
        let message = format!("{} does not exist", origin.display());
        debug!(%category, message, "Category origin missing");
        return StepOutcome::new(if category.is_required() {
            ShellResult::failure(message)
        } else {
            ShellResult::not_present(message)
        });
    }

    let bytes = ctx.bridge.calculate_size(&origin).await;
    let dst = ctx.layout.category_path(name, ctx.timestamp, category, ctx.settings.compression);

    if ctx.settings.skip_unchanged
        && let Some(outcome) = reuse_unchanged(ctx, name, category, bytes, &dst).await
    {
        return outcome;
    }

    let exclusions = category.exclusions(name);
    let spec = CompressSpec {
        src_dir: &origin_dir,
        src: name,
        dst: &dst,
        exclusions: &exclusions,
        follow_symlinks: ctx.settings.follow_symlinks,
        kind: ctx.settings.compression,
        level: ctx.settings.compression_level,
    };
    let mut result = ctx.archive.compress(&spec, ctx.cancel_token()).await;
    verify_archive(ctx, &dst, &mut result).await;
    StepOutcome::new(result).with_bytes(bytes)
}

/// Copies the archive of the last backup whose captured size matches `bytes`.
async fn reuse_unchanged(
    ctx: &RunContext<'_>,
    name: &str,
    category: DataCategory,
    bytes: u64,
    dst: &Path,
) -> Option<StepOutcome> {
    let (previous_ts, previous_bytes) = ctx.store.last_backup_bytes(name, category)?;
    if previous_ts == ctx.timestamp || previous_bytes != bytes {
        return None;
    }
    let previous = ctx.layout.category_path(name, previous_ts, category, ctx.settings.compression);
    if !ctx.bridge.exists(&previous).await {
        debug!(%category, previous = %previous.display(), "Previous archive is gone, archiving again");
        return None;
    }
    if !ctx.bridge.copy(&previous, dst, true).await {
        warn!(%category, "Failed to reuse previous archive, archiving again");
        return None;
    }
    info!(%category, previous_ts, "Data has not changed, reused previous archive");
    let message = format!("Data has not changed, reused archive from {}", format_timestamp(previous_ts));
    Some(StepOutcome::new(ShellResult::ok(message)).with_bytes(bytes))
}

/// Removes partial output of a failed archive step, or tests a finished one.
async fn verify_archive(ctx: &RunContext<'_>, archive: &Path, result: &mut ShellResult) {
    if !result.is_success() {
        if result.exit_code != EXIT_CANCELLED {
            warn!(archive = %archive.display(), exit_code = result.exit_code, "Archiving failed");
        }
        ctx.bridge.delete(archive).await;
        return;
    }
    if ctx.settings.compression_test {
        let test = ctx.archive.verify_or_discard(archive, ctx.settings.compression, ctx.cancel_token()).await;
        result.merge(test);
    }
}

async fn write_package_config(
    ctx: &RunContext<'_>,
    entry: &PackageEntry,
    uid: i32,
    categories: BTreeSet<DataCategory>,
    path: &Path,
) -> ShellResult {
    let name = entry.package.as_str();
    let capture = categories.contains(&DataCategory::Config);
    let permissions =
        if capture { ctx.bridge.list_runtime_permissions(name, entry.user_id).await } else { Vec::new() };
    let ssaid = if capture { ctx.bridge.device_scoped_id(name, entry.user_id).await } else { None };

    let config = PackageConfig {
        package: entry.package.clone(),
        label: entry.label.clone(),
        user_id: entry.user_id,
        uid,
        sdk_int: ctx.bridge.sdk_int().await,
        compression: ctx.settings.compression,
        timestamp: ctx.timestamp,
        categories,
        permissions,
        ssaid,
    };
    let json = match serde_json::to_vec_pretty(&config) {
        Ok(json) => json,
        Err(e) => return ShellResult::failure(format!("Failed to serialize package config: {e}")),
    };
    if !ctx.bridge.write_bytes(path, json).await {
        return ShellResult::failure(format!("Failed to write {}", path.display()));
    }
    ShellResult::ok(format!(
        "Saved {} runtime permissions, device id {}",
        config.permissions.len(),
        if config.ssaid.is_some() { "captured" } else { "not captured" }
    ))
}

/// Uploads the archives of categories left at the upload stage and finishes them.
async fn upload_pending(
    ctx: &RunContext<'_>,
    kind: RecordKind,
    name: &str,
    local_dir: &Path,
    pending: &[(DataCategory, PathBuf)],
) {
    if pending.is_empty() {
        return;
    }
    let remote = match ctx.remote().await {
        Ok(remote) => remote,
        Err(message) => return fail_uploads(ctx, kind, name, pending, &message).await,
    };
    let Some(remote_dir) = ctx.layout.relative(local_dir) else {
        let message = format!("{} is outside the backup root", local_dir.display());
        return fail_uploads(ctx, kind, name, pending, &message).await;
    };

    for (category, local) in pending {
        if ctx.is_cancelled() {
            break;
        }
        let before = remote.size(&remote_dir).await.unwrap_or(0);
        match remote.upload(local, &remote_dir, ctx.cancel_token()).await {
            Ok(()) => {
                let after = remote.size(&remote_dir).await.unwrap_or(before);
                let uploaded = human_size(after.saturating_sub(before));
                info!(%category, uploaded, "Uploaded archive");
                ctx.update(kind, name, *category, |r| {
                    r.transition(OperationState::Done);
                    r.stage = OperationStage::Upload;
                    r.append_log(&format!("Uploaded {uploaded} to {remote_dir}"));
                })
                .await;
            }
            Err(e) => {
                warn!(error = e.as_ref() as &dyn Error, %category, "Upload failed, keeping local archive");
                ctx.update(kind, name, *category, |r| {
                    r.transition(OperationState::Error);
                    r.stage = OperationStage::Upload;
                    r.append_log(&format!("Upload failed: {e:#}"));
                })
                .await;
            }
        }
    }
}

async fn fail_uploads(
    ctx: &RunContext<'_>,
    kind: RecordKind,
    name: &str,
    pending: &[(DataCategory, PathBuf)],
    message: &str,
) {
    for (category, _) in pending {
        ctx.update(kind, name, *category, |r| {
            r.transition(OperationState::Error);
            r.stage = OperationStage::Upload;
            r.append_log(message);
        })
        .await;
    }
}

/// Uploads a file nothing in the record tracks; failures are only logged.
async fn upload_untracked(ctx: &RunContext<'_>, local: &Path, local_dir: &Path) {
    let Ok(remote) = ctx.remote().await else { return };
    let Some(remote_dir) = ctx.layout.relative(local_dir) else { return };
    if let Err(e) = remote.upload(local, &remote_dir, ctx.cancel_token()).await {
        warn!(error = e.as_ref() as &dyn Error, file = %local.display(), "Failed to upload file");
    }
}

#[instrument(skip_all, fields(media = %entry.name))]
async fn backup_media(ctx: &RunContext<'_>, entry: &MediaEntry) -> OperationState {
    let kind = RecordKind::Media;
    let name = entry.name.as_str();
    let category = DataCategory::MediaData;
    let record =
        PackageOperationRecord::new(kind, name, name, ctx.settings.user_id, &[category], now_millis());
    if let Err(e) = ctx.store.begin_package(ctx.timestamp, record).await {
        warn!(error = e.as_ref() as &dyn Error, "Failed to create media record");
        return OperationState::Error;
    }
    ctx.start_category(kind, name, category, OperationStage::Archive).await;

    let media_dir = ctx.layout.media_dir(name, ctx.timestamp);
    let dst = ctx.layout.media_path(name, ctx.timestamp, ctx.settings.compression);
    let mut outcome = archive_media(ctx, &entry.path, &media_dir, &dst).await;
    outcome.pending_upload = ctx.remote.is_some() && outcome.state() == OperationState::Done;
    ctx.finish_category(kind, name, category, OperationStage::Archive, &outcome).await;

    if outcome.pending_upload {
        upload_pending(ctx, kind, name, &media_dir, &[(category, dst)]).await;
    }
    if ctx.is_cancelled() {
        ctx.fail_unfinished(kind, name, CANCELLED_MESSAGE).await;
    }
    ctx.finalize(kind, name).await
}

async fn archive_media(ctx: &RunContext<'_>, device_path: &str, media_dir: &Path, dst: &Path) -> StepOutcome {
    let source = ctx.device.resolve(device_path);
    if !ctx.bridge.exists(&source).await {
        return StepOutcome::new(ShellResult::failure(format!("{device_path} does not exist")));
    }
    let (Some(parent), Some(file_name)) = (source.parent(), source.file_name()) else {
        return StepOutcome::new(ShellResult::failure(format!("{device_path} is not a directory path")));
    };
    if !ctx.bridge.mkdirs(media_dir).await {
        return StepOutcome::new(ShellResult::failure(format!("Failed to create {}", media_dir.display())));
    }

    let bytes = ctx.bridge.calculate_size(&source).await;
    let src = file_name.to_string_lossy();
    let spec = CompressSpec {
        src_dir: parent,
        src: &src,
        dst,
        exclusions: &[],
        follow_symlinks: ctx.settings.follow_symlinks,
        kind: ctx.settings.compression,
        level: ctx.settings.compression_level,
    };
    let mut result = ctx.archive.compress(&spec, ctx.cancel_token()).await;
    verify_archive(ctx, dst, &mut result).await;
    StepOutcome::new(result).with_bytes(bytes)
}
