//! Executes privileged requests in the current process.
//!
//! This is what the `rootd` helper runs once it has been started with root
//! rights; the engine itself reaches it over [`super::process::ProcessChannel`].

use std::{
    os::unix::fs::{MetadataExt, PermissionsExt},
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result, bail, ensure};
use async_trait::async_trait;
use fs_err::tokio as fs;
use tokio::sync::OnceCell;
use tracing::{debug, instrument, warn};

use super::{
    BridgeError,
    channel::RootChannel,
    protocol::{FileStat, InstalledPackage, PathEntry, Reply, Request, StorageStats},
    ssaid,
};
use crate::{
    models::DataCategory,
    paths::DeviceLayout,
    shell::{CommandRunner, ShellExecutor, ShellResult, pm, quote_path},
};

const ABX_MAGIC: &[u8] = b"ABX";

#[derive(Debug, Clone)]
pub struct LocalChannel {
    shell: ShellExecutor,
    device: DeviceLayout,
    sdk_int: Arc<OnceCell<i64>>,
}

impl LocalChannel {
    pub fn new(shell: ShellExecutor, device: DeviceLayout) -> Self {
        Self { shell, device, sdk_int: Arc::new(OnceCell::new()) }
    }

    /// Executes one request.
    #[instrument(level = "debug", skip(self, request), fields(op = request.name()), err)]
    pub async fn handle(&self, request: Request) -> Result<Reply> {
        Ok(match request {
            Request::Ping => Reply::Unit,
            Request::Mkdirs { path } => {
                fs::create_dir_all(&path).await?;
                Reply::Bool(true)
            }
            Request::Copy { src, dst, overwrite } => {
                copy_recursively(Path::new(&src), Path::new(&dst), overwrite).await?;
                Reply::Bool(true)
            }
            Request::Rename { src, dst } => {
                fs::rename(&src, &dst).await?;
                Reply::Bool(true)
            }
            Request::Delete { path } => Reply::Bool(delete_recursively(Path::new(&path)).await?),
            Request::Exists { path } => Reply::Bool(tokio::fs::try_exists(&path).await.unwrap_or(false)),
            Request::ReadBytes { path } => Reply::Bytes(fs::read(&path).await?),
            Request::ReadText { path } => Reply::Text(fs::read_to_string(&path).await?),
            Request::WriteBytes { path, data } => {
                if let Some(parent) = Path::new(&path).parent() {
                    fs::create_dir_all(parent).await?;
                }
                fs::write(&path, data).await?;
                Reply::Unit
            }
            Request::Stat { path } => Reply::Stat(stat(Path::new(&path)).await),
            Request::Walk { path } => Reply::Entries(walk(Path::new(&path)).await?),
            Request::ListPaths { path } => Reply::Paths(list_paths(Path::new(&path)).await?),
            Request::CalculateSize { path } => Reply::Size(calculate_size(Path::new(&path)).await?),
            Request::Chmod { path, mode } => {
                fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).await?;
                Reply::Bool(true)
            }
            Request::ListInstalledPackages { user_id } => {
                Reply::Packages(self.installed_packages(user_id).await?)
            }
            Request::PackageSourceDir { package, user_id } => {
                Reply::Text(self.package_source_dir(&package, user_id).await?)
            }
            Request::PackageUid { package, user_id } => {
                Reply::Int(self.package_uid(&package, user_id).await?)
            }
            Request::QueryInstalled { package, user_id } => {
                Reply::Bool(!self.package_source_dir(&package, user_id).await?.is_empty())
            }
            Request::QueryStorageStats { package, user_id } => {
                Reply::Stats(self.storage_stats(&package, user_id).await?)
            }
            Request::GrantPermission { package, permission, user_id } => {
                self.checked(pm::grant_tokens(&package, &permission, user_id)).await?;
                Reply::Bool(true)
            }
            Request::RevokePermission { package, permission, user_id } => {
                self.checked(pm::revoke_tokens(&package, &permission, user_id)).await?;
                Reply::Bool(true)
            }
            Request::ListRuntimePermissions { package, user_id } => {
                let lines = self.checked(pm::dump_package_tokens(&package)).await?;
                Reply::Permissions(pm::parse_runtime_permissions(&lines, user_id))
            }
            Request::GetDeviceScopedId { package, user_id } => {
                Reply::OptionalText(self.device_scoped_id(&package, user_id).await?)
            }
            Request::SetDeviceScopedId { package, user_id, value } => {
                self.set_device_scoped_id(&package, user_id, &value).await?;
                Reply::Bool(true)
            }
            Request::InstallPackages { apks, user_id } => {
                Reply::Shell(self.install_packages(&apks, user_id).await)
            }
            Request::SdkInt => Reply::Int(self.sdk_int().await),
            Request::Shutdown => Reply::Unit,
        })
    }

    async fn checked(&self, tokens: Vec<String>) -> Result<Vec<String>> {
        let result = self.shell.run(&tokens, None).await;
        ensure!(
            result.is_success(),
            "`{}` failed with exit code {}: {}",
            result.input_tokens.join(" "),
            result.exit_code,
            result.output()
        );
        Ok(result.output_lines)
    }

    async fn sdk_int(&self) -> i64 {
        *self
            .sdk_int
            .get_or_init(|| async {
                let result = self.shell.run(&pm::sdk_int_tokens(), None).await;
                let sdk = result.output().trim().parse().unwrap_or(0);
                debug!(sdk, "Resolved SDK level");
                sdk
            })
            .await
    }

    async fn installed_packages(&self, user_id: u32) -> Result<Vec<InstalledPackage>> {
        let lines = self.checked(pm::list_packages_tokens(user_id)).await?;
        Ok(pm::parse_package_list(&lines)
            .into_iter()
            .map(|(package, uid)| InstalledPackage { package, uid })
            .collect())
    }

    /// `-1` when the package is not installed for the user.
    async fn package_uid(&self, package: &str, user_id: u32) -> Result<i64> {
        let packages = self.installed_packages(user_id).await?;
        Ok(packages.iter().find(|p| p.package == package).map_or(-1, |p| i64::from(p.uid)))
    }

    /// Directory holding the package's apks, empty when not installed.
    async fn package_source_dir(&self, package: &str, user_id: u32) -> Result<String> {
        let result = self.shell.run(&pm::path_tokens(package, user_id), None).await;
        if !result.is_success() {
            return Ok(String::new());
        }
        let dir = pm::parse_package_paths(&result.output_lines)
            .first()
            .and_then(|apk| Path::new(apk).parent().map(|p| p.to_string_lossy().to_string()))
            .unwrap_or_default();
        Ok(dir)
    }

    async fn storage_stats(&self, package: &str, user_id: u32) -> Result<Option<StorageStats>> {
        let source_dir = self.package_source_dir(package, user_id).await?;
        if source_dir.is_empty() {
            return Ok(None);
        }
        let mut stats =
            StorageStats { app_bytes: calculate_size(Path::new(&source_dir)).await?, ..Default::default() };
        for category in DataCategory::ALL.iter().filter(|c| c.is_data()) {
            let Some(origin) = self.device.origin_path(*category, user_id, package) else { continue };
            stats.data_bytes += calculate_size(&origin).await?;
            stats.cache_bytes += calculate_size(&origin.join("cache")).await?;
        }
        Ok(Some(stats))
    }

    async fn read_settings_xml(&self, path: &Path) -> Result<(String, bool)> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((String::new(), false)),
            Err(e) => return Err(e.into()),
        };
        if bytes.starts_with(ABX_MAGIC) {
            let lines =
                self.checked(vec!["abx2xml".into(), quote_path(path), "-".into()]).await?;
            return Ok((lines.join("\n"), true));
        }
        Ok((String::from_utf8_lossy(&bytes).to_string(), false))
    }

    async fn device_scoped_id(&self, package: &str, user_id: u32) -> Result<Option<String>> {
        let (xml, _) = self.read_settings_xml(&self.device.ssaid_file(user_id)).await?;
        Ok(ssaid::find(&xml, package))
    }

    async fn set_device_scoped_id(&self, package: &str, user_id: u32, value: &str) -> Result<()> {
        ensure!(!value.is_empty(), "Empty device-scoped id for {package}");
        let uid = self.package_uid(package, user_id).await?;
        ensure!(uid != -1, "{package} is not installed for user {user_id}");

        let path = self.device.ssaid_file(user_id);
        let (xml, binary) = self.read_settings_xml(&path).await?;
        let updated = ssaid::upsert(&xml, package, uid, value);
        if binary {
            let plain = path.with_extension("xml.plain");
            fs::write(&plain, updated).await?;
            let converted = self.checked(vec!["xml2abx".into(), quote_path(&plain), quote_path(&path)]).await;
            let _ = fs::remove_file(&plain).await;
            converted?;
        } else {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::write(&path, updated).await?;
        }
        Ok(())
    }

    /// Installs one apk directly, or several as one staged session.
    async fn install_packages(&self, apks: &[String], user_id: u32) -> ShellResult {
        let sdk = self.sdk_int().await;
        match apks {
            [] => ShellResult::failure("No apk to install"),
            [apk] => self.shell.run(&pm::install_tokens(apk, user_id, sdk), None).await,
            _ => {
                let created = self.shell.run(&pm::install_create_tokens(user_id, sdk), None).await;
                let Some(session) = pm::parse_session_id(&created.output_lines).filter(|_| created.is_success())
                else {
                    let mut result = ShellResult::failure("Failed to create install session");
                    result.merge(created);
                    return result;
                };
                let mut result = created;
                for apk in apks {
                    let name = Path::new(apk)
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_else(|| apk.clone());
                    let written = self.shell.run(&pm::install_write_tokens(&session, &name, apk), None).await;
                    let failed = !written.is_success();
                    result.merge(written);
                    if failed {
                        warn!(session, apk, "Staged write failed, abandoning session");
                        result.merge(self.shell.run(&pm::install_abandon_tokens(&session), None).await);
                        return result;
                    }
                }
                result.merge(self.shell.run(&pm::install_commit_tokens(&session), None).await);
                result
            }
        }
    }
}

#[async_trait]
impl RootChannel for LocalChannel {
    async fn call(&self, request: Request) -> Result<Reply, BridgeError> {
        self.handle(request).await.map_err(|e| BridgeError::Remote(format!("{e:#}")))
    }

    fn is_alive(&self) -> bool {
        true
    }

    async fn shutdown(&self, _kill_daemon: bool) {}
}

async fn stat(path: &Path) -> Option<FileStat> {
    let meta = fs::symlink_metadata(path).await.ok()?;
    Some(FileStat {
        size: meta.len(),
        mode: meta.mode(),
        uid: meta.uid(),
        gid: meta.gid(),
        modified: meta.mtime() * 1000 + meta.mtime_nsec() / 1_000_000,
        is_dir: meta.is_dir(),
        is_symlink: meta.file_type().is_symlink(),
    })
}

async fn list_paths(path: &Path) -> Result<Vec<String>> {
    let mut paths = Vec::new();
    let mut rd = fs::read_dir(path).await?;
    while let Some(entry) = rd.next_entry().await? {
        paths.push(entry.path().to_string_lossy().to_string());
    }
    paths.sort();
    Ok(paths)
}

/// Every entry below `root`, symlinks not followed.
async fn walk(root: &Path) -> Result<Vec<PathEntry>> {
    let mut entries = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut rd = match fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if dir == root => return Err(e.into()),
            Err(_) => continue,
        };
        while let Some(entry) = rd.next_entry().await? {
            let path = entry.path();
            let meta = fs::symlink_metadata(&path).await?;
            if meta.is_dir() {
                stack.push(path.clone());
            }
            entries.push(PathEntry {
                path: path.to_string_lossy().to_string(),
                is_dir: meta.is_dir(),
                size: if meta.is_file() { meta.len() } else { 0 },
            });
        }
    }
    Ok(entries)
}

/// Total file bytes below `path`; zero when it does not exist.
pub(crate) async fn calculate_size(path: &Path) -> Result<u64> {
    let meta = match fs::symlink_metadata(path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    if !meta.is_dir() {
        return Ok(if meta.is_file() { meta.len() } else { 0 });
    }
    Ok(walk(path).await?.iter().map(|e| e.size).sum())
}

async fn delete_recursively(path: &Path) -> Result<bool> {
    let meta = match fs::symlink_metadata(path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    if meta.is_dir() {
        fs::remove_dir_all(path).await?;
    } else {
        fs::remove_file(path).await?;
    }
    Ok(true)
}

async fn copy_recursively(src: &Path, dst: &Path, overwrite: bool) -> Result<()> {
    let meta = fs::symlink_metadata(src).await.with_context(|| format!("Cannot copy {}", src.display()))?;
    if !meta.is_dir() {
        if !overwrite && tokio::fs::try_exists(dst).await.unwrap_or(false) {
            bail!("{} already exists", dst.display());
        }
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::copy(src, dst).await?;
        return Ok(());
    }

    let mut stack: Vec<(PathBuf, PathBuf)> = vec![(src.to_path_buf(), dst.to_path_buf())];
    while let Some((from, to)) = stack.pop() {
        fs::create_dir_all(&to).await?;
        let mut rd = fs::read_dir(&from).await?;
        while let Some(entry) = rd.next_entry().await? {
            let target = to.join(entry.file_name());
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                stack.push((entry.path(), target));
            } else if file_type.is_file() {
                if !overwrite && tokio::fs::try_exists(&target).await.unwrap_or(false) {
                    bail!("{} already exists", target.display());
                }
                fs::copy(entry.path(), &target).await?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn channel(root: &Path) -> LocalChannel {
        LocalChannel::new(ShellExecutor::system(), DeviceLayout::new(root))
    }

    fn s(path: &Path) -> String {
        path.to_string_lossy().to_string()
    }

    #[tokio::test]
    async fn filesystem_primitives() {
        let dir = tempdir().unwrap();
        let channel = channel(dir.path());
        let nested = dir.path().join("a/b/c");

        assert_eq!(channel.handle(Request::Mkdirs { path: s(&nested) }).await.unwrap(), Reply::Bool(true));
        let file = nested.join("file.bin");
        channel.handle(Request::WriteBytes { path: s(&file), data: vec![1, 2, 3, 4] }).await.unwrap();
        assert_eq!(channel.handle(Request::Exists { path: s(&file) }).await.unwrap(), Reply::Bool(true));
        assert_eq!(channel.handle(Request::ReadBytes { path: s(&file) }).await.unwrap(), Reply::Bytes(vec![1, 2, 3, 4]));
        assert_eq!(
            channel.handle(Request::CalculateSize { path: s(&dir.path().join("a")) }).await.unwrap(),
            Reply::Size(4)
        );

        let Reply::Stat(Some(stat)) = channel.handle(Request::Stat { path: s(&file) }).await.unwrap() else {
            panic!("expected stat");
        };
        assert_eq!(stat.size, 4);
        assert!(!stat.is_dir);

        channel.handle(Request::Chmod { path: s(&file), mode: 0o600 }).await.unwrap();
        let Reply::Stat(Some(stat)) = channel.handle(Request::Stat { path: s(&file) }).await.unwrap() else {
            panic!("expected stat");
        };
        assert_eq!(stat.mode & 0o777, 0o600);

        let copy = dir.path().join("copy");
        channel
            .handle(Request::Copy { src: s(&dir.path().join("a")), dst: s(&copy), overwrite: false })
            .await
            .unwrap();
        assert!(copy.join("b/c/file.bin").exists());
        assert!(
            channel
                .handle(Request::Copy { src: s(&file), dst: s(&copy.join("b/c/file.bin")), overwrite: false })
                .await
                .is_err()
        );

        let Reply::Entries(entries) = channel.handle(Request::Walk { path: s(&copy) }).await.unwrap() else {
            panic!("expected entries");
        };
        assert_eq!(entries.len(), 3);

        assert_eq!(channel.handle(Request::Delete { path: s(&copy) }).await.unwrap(), Reply::Bool(true));
        assert_eq!(channel.handle(Request::Delete { path: s(&copy) }).await.unwrap(), Reply::Bool(false));
        assert_eq!(channel.handle(Request::Stat { path: s(&copy) }).await.unwrap(), Reply::Stat(None));
        assert_eq!(
            channel.handle(Request::CalculateSize { path: s(&copy) }).await.unwrap(),
            Reply::Size(0)
        );
    }

    #[tokio::test]
    async fn lists_direct_children_sorted() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("b.apk"), b"b").unwrap();
        std::fs::write(dir.path().join("a.apk"), b"a").unwrap();
        std::fs::create_dir(dir.path().join("lib")).unwrap();
        let Reply::Paths(paths) = channel(dir.path()).handle(Request::ListPaths { path: s(dir.path()) }).await.unwrap()
        else {
            panic!("expected paths");
        };
        let names: Vec<_> = paths.iter().map(|p| Path::new(p).file_name().unwrap().to_string_lossy().to_string()).collect();
        assert_eq!(names, vec!["a.apk", "b.apk", "lib"]);
    }

    #[tokio::test]
    async fn missing_file_reads_are_errors() {
        let dir = tempdir().unwrap();
        let result = channel(dir.path()).call(Request::ReadText { path: s(&dir.path().join("nope")) }).await;
        assert!(matches!(result, Err(BridgeError::Remote(_))));
    }

    #[tokio::test]
    async fn plain_ssaid_file_is_read_and_updated() {
        let dir = tempdir().unwrap();
        let channel = channel(dir.path());
        let file = DeviceLayout::new(dir.path()).ssaid_file(0);
        std::fs::create_dir_all(file.parent().unwrap()).unwrap();
        std::fs::write(
            &file,
            "<settings version=\"-1\">\n  <setting id=\"1\" name=\"10123\" value=\"aaaa\" package=\"com.example.app\" />\n</settings>\n",
        )
        .unwrap();
        assert_eq!(
            channel.device_scoped_id("com.example.app", 0).await.unwrap().as_deref(),
            Some("aaaa")
        );
        let (xml, binary) = channel.read_settings_xml(&file).await.unwrap();
        assert!(!binary);
        let updated = ssaid::upsert(&xml, "com.example.app", 10123, "bbbb");
        std::fs::write(&file, updated).unwrap();
        assert_eq!(
            channel.device_scoped_id("com.example.app", 0).await.unwrap().as_deref(),
            Some("bbbb")
        );
    }
}
