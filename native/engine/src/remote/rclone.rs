use std::{
    path::{Path, PathBuf},
    process::Stdio,
};

use anyhow::{Context, Result, anyhow, ensure};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::{io::AsyncReadExt, process::Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use super::{PROBE_DIR, RemoteStorage};

static CONNECTION_TIMEOUT: &str = "5s";
static IO_IDLE_TIMEOUT: &str = "30s";
static RETRIES: &str = "3";
static LOW_LEVEL_RETRIES: &str = "10";

#[derive(Debug, Clone, Deserialize)]
pub struct RcloneSizeOutput {
    pub count: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RcloneClient {
    rclone_path: PathBuf,
    config_path: Option<PathBuf>,
    bandwidth_limit: String,
}

impl RcloneClient {
    pub fn new(rclone_path: PathBuf, config_path: Option<PathBuf>, bandwidth_limit: String) -> Self {
        Self { rclone_path, config_path, bandwidth_limit }
    }

    #[instrument(skip(self), level = "trace")]
    fn command(&self, args: &[&str]) -> Command {
        let mut command = Command::new(&self.rclone_path);
        command.kill_on_drop(true);
        if let Some(config_path) = &self.config_path {
            command.arg("--config").arg(config_path);
        }
        command.arg("--use-json-log");
        command.args(args);
        trace!(command = ?command, "Constructed rclone command");
        command
    }

    #[instrument(skip(self), level = "trace")]
    async fn run_to_string(&self, args: &[&str]) -> Result<String> {
        let output = self.command(args).output().await.context("rclone command failed")?;
        if output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout).to_string();
            trace!(stdout, "rclone command successful");
            Ok(stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            error!(code = output.status.code().unwrap_or(-1), stderr, "rclone command failed");
            Err(anyhow!(
                "rclone returned exit code {}, stderr:\n{}",
                output.status.code().map_or("unknown".to_string(), |c| c.to_string()),
                stderr
            ))
        }
    }

    pub async fn remotes(&self) -> Result<Vec<String>> {
        let output = self.run_to_string(&["listremotes"]).await?;
        Ok(output
            .lines()
            .map(|line| line.trim().trim_end_matches(':').to_string())
            .filter(|line| !line.is_empty())
            .collect())
    }

    #[instrument(skip(self), ret, err)]
    pub async fn size(&self, path: &str) -> Result<RcloneSizeOutput> {
        let output = self.run_to_string(&["size", "--fast-list", "--json", path]).await?;
        serde_json::from_str(&output).context("Failed to parse rclone size output")
    }

    pub async fn mkdir(&self, path: &str) -> Result<()> {
        self.run_to_string(&["mkdir", path]).await.map(|_| ())
    }

    pub async fn purge(&self, path: &str) -> Result<()> {
        self.run_to_string(&["purge", path]).await.map(|_| ())
    }

    pub async fn rmdirs(&self, path: &str) -> Result<()> {
        self.run_to_string(&["rmdirs", "--leave-root", path]).await.map(|_| ())
    }

    /// `rclone copy` with bounded retries; killed when `cancellation_token` fires.
    #[instrument(skip(self, cancellation_token), err)]
    pub async fn copy(
        &self,
        source: &str,
        dest: &str,
        cancellation_token: Option<&CancellationToken>,
    ) -> Result<()> {
        let mut args = vec![
            "copy",
            "--contimeout",
            CONNECTION_TIMEOUT,
            "--timeout",
            IO_IDLE_TIMEOUT,
            "--retries",
            RETRIES,
            "--low-level-retries",
            LOW_LEVEL_RETRIES,
        ];
        if !self.bandwidth_limit.is_empty() {
            args.extend_from_slice(&["--bwlimit", &self.bandwidth_limit]);
        }
        args.extend_from_slice(&[source, dest]);

        let mut child = self
            .command(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .context("Failed to start rclone")?;
        let mut stderr = child.stderr.take().context("Failed to get stderr")?;

        let transfer_future = async {
            let mut stderr_str = String::new();
            stderr.read_to_string(&mut stderr_str).await?;
            let status = child.wait().await?;
            if status.success() {
                return Ok(());
            }
            error!(code = status.code().unwrap_or(-1), stderr = %stderr_str, "rclone copy failed");
            Err(anyhow!(
                "rclone failed with exit code: {}, stderr: {}",
                status.code().map_or("unknown".to_string(), |c| c.to_string()),
                stderr_str.trim()
            ))
        };

        match cancellation_token {
            Some(token) => {
                tokio::select! {
                    res = transfer_future => res,
                    _ = token.cancelled() => {
                        warn!("rclone copy cancelled");
                        child.kill().await.context("Failed to kill rclone process")?;
                        Err(anyhow!("Transfer cancelled"))
                    }
                }
            }
            None => transfer_future.await,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RcloneStorage {
    client: RcloneClient,
    remote: String,
    root_dir: String,
}

impl RcloneStorage {
    #[instrument]
    pub fn new(
        rclone_path: PathBuf,
        config_path: Option<PathBuf>,
        remote: String,
        root_dir: String,
        bandwidth_limit: String,
    ) -> Self {
        Self { client: RcloneClient::new(rclone_path, config_path, bandwidth_limit), remote, root_dir }
    }

    fn format_remote_path(&self, path: &str) -> String {
        let root = self.root_dir.trim_matches(['/', '\\']);
        let path = path.trim_start_matches('/');
        match (root.is_empty(), path.is_empty()) {
            (true, _) => format!("{}:{}", self.remote, path),
            (false, true) => format!("{}:{}", self.remote, root),
            (false, false) => format!("{}:{}/{}", self.remote, root, path),
        }
    }

    pub fn remote_name(&self) -> &str {
        &self.remote
    }
}

#[async_trait]
impl RemoteStorage for RcloneStorage {
    #[instrument(skip(self), err)]
    async fn connect(&self) -> Result<()> {
        let remotes = self.client.remotes().await?;
        ensure!(remotes.iter().any(|r| r == &self.remote), "Remote '{}' is not configured", self.remote);
        self.client.mkdir(&self.format_remote_path("")).await
    }

    #[instrument(skip(self), err)]
    async fn test_connection(&self) -> Result<()> {
        let probe = self.format_remote_path(PROBE_DIR);
        self.client.mkdir(&probe).await.context("Failed to create probe directory")?;
        self.client.purge(&probe).await.context("Failed to remove probe directory")?;
        info!(remote = self.remote, "Remote connection test passed");
        Ok(())
    }

    async fn size(&self, path: &str) -> Result<u64> {
        Ok(self.client.size(&self.format_remote_path(path)).await?.bytes)
    }

    #[instrument(skip(self, cancel), err)]
    async fn upload(&self, local: &Path, remote_dir: &str, cancel: Option<&CancellationToken>) -> Result<()> {
        ensure!(local.is_file(), "{} is not a file", local.display());
        let dest = self.format_remote_path(remote_dir);
        debug!(source = %local.display(), dest, "Uploading");
        self.client.copy(&local.to_string_lossy(), &dest, cancel).await
    }

    #[instrument(skip(self, cancel), err)]
    async fn download(
        &self,
        remote_file: &str,
        local_dir: &Path,
        cancel: Option<&CancellationToken>,
    ) -> Result<PathBuf> {
        ensure!(local_dir.is_dir(), "destination must be a directory");
        let file_name = remote_file
            .rsplit(['/', '\\'])
            .next()
            .filter(|n| !n.is_empty())
            .context("Failed to get source file name")?;
        let source = self.format_remote_path(remote_file);
        self.client.copy(&source, &local_dir.to_string_lossy(), cancel).await?;
        let local = local_dir.join(file_name);
        ensure!(local.is_file(), "{source} was not downloaded");
        Ok(local)
    }

    async fn purge(&self, path: &str) -> Result<()> {
        self.client.purge(&self.format_remote_path(path)).await
    }

    async fn clear_empty_dirs(&self, path: &str) -> Result<()> {
        self.client.rmdirs(&self.format_remote_path(path)).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::os::unix::fs::PermissionsExt;

    use tempfile::{TempDir, tempdir};

    use super::*;

    const FAKE_RCLONE: &str = r#"#!/bin/sh
BASE='@BASE@'
FAIL_COPY='@FAIL_COPY@'
cmd=''
a1=''
a2=''
while [ $# -gt 0 ]; do
  case "$1" in
    --config|--contimeout|--timeout|--retries|--low-level-retries|--bwlimit) shift 2; continue ;;
    --*) shift; continue ;;
  esac
  if [ -z "$cmd" ]; then cmd="$1"; elif [ -z "$a1" ]; then a1="$1"; else a2="$1"; fi
  shift
done
map() { printf '%s' "$1" | sed "s#^remote:#$BASE/#"; }
case "$cmd" in
  listremotes) echo 'remote:' ;;
  mkdir) mkdir -p "$(map "$a1")" ;;
  size)
    p="$(map "$a1")"
    [ -e "$p" ] || { echo 'directory not found' >&2; exit 3; }
    c=$(find "$p" -type f | wc -l)
    b=$(find "$p" -type f -exec cat {} + | wc -c)
    echo "{\"count\":$c,\"bytes\":$b,\"sizeless\":0}" ;;
  copy)
    [ "$FAIL_COPY" = 1 ] && { echo 'connection refused' >&2; exit 1; }
    src="$(map "$a1")"
    dst="$(map "$a2")"
    [ -e "$src" ] || { echo 'object not found' >&2; exit 3; }
    mkdir -p "$dst"
    if [ -d "$src" ]; then cp -R "$src/." "$dst/"; else cp "$src" "$dst/"; fi ;;
  purge) rm -rf "$(map "$a1")" ;;
  rmdirs) find "$(map "$a1")" -mindepth 1 -type d -empty -delete ;;
  *) echo "unknown command $cmd" >&2; exit 2 ;;
esac
"#;

    /// Scripted stand-in for rclone mapping `remote:` onto a local directory.
    pub(crate) struct FakeRemote {
        pub dir: TempDir,
        pub storage: RcloneStorage,
    }

    impl FakeRemote {
        pub(crate) fn new(fail_copy: bool) -> Self {
            let dir = tempdir().unwrap();
            let base = dir.path().join("remote");
            std::fs::create_dir_all(&base).unwrap();
            let script = dir.path().join("rclone");
            let body = FAKE_RCLONE
                .replace("@BASE@", &base.to_string_lossy())
                .replace("@FAIL_COPY@", if fail_copy { "1" } else { "0" });
            std::fs::write(&script, body).unwrap();
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
            let storage = RcloneStorage::new(
                script,
                None,
                "remote".to_string(),
                "DataBackup".to_string(),
                String::new(),
            );
            Self { dir, storage }
        }

        pub(crate) fn root(&self) -> PathBuf {
            self.dir.path().join("remote/DataBackup")
        }
    }

    #[test]
    fn formats_remote_paths() {
        let storage = RcloneStorage::new(
            "rclone".into(),
            None,
            "nas".into(),
            "/DataBackup/".into(),
            String::new(),
        );
        assert_eq!(storage.format_remote_path(""), "nas:DataBackup");
        assert_eq!(storage.format_remote_path("archives/packages"), "nas:DataBackup/archives/packages");
        let storage = RcloneStorage::new("rclone".into(), None, "nas".into(), String::new(), String::new());
        assert_eq!(storage.format_remote_path("/configs"), "nas:configs");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn connects_and_probes() {
        let remote = FakeRemote::new(false);
        remote.storage.connect().await.unwrap();
        assert!(remote.root().is_dir());
        remote.storage.test_connection().await.unwrap();
        assert!(!remote.root().join(PROBE_DIR).exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn uploads_measures_and_downloads() {
        let remote = FakeRemote::new(false);
        remote.storage.connect().await.unwrap();
        let local = tempdir().unwrap();
        let archive = local.path().join("user.tar.zst");
        std::fs::write(&archive, vec![7u8; 1024]).unwrap();

        let dir = "archives/packages/com.example.app/1000";
        remote.storage.upload(&archive, dir, None).await.unwrap();
        assert_eq!(remote.storage.size(dir).await.unwrap(), 1024);

        let scratch = tempdir().unwrap();
        let downloaded = remote
            .storage
            .download(&format!("{dir}/user.tar.zst"), scratch.path(), None)
            .await
            .unwrap();
        assert_eq!(downloaded, scratch.path().join("user.tar.zst"));
        assert_eq!(std::fs::read(downloaded).unwrap().len(), 1024);

        assert!(remote.storage.download("archives/missing.tar", scratch.path(), None).await.is_err());
        assert!(remote.storage.size("archives/nothing").await.is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn purge_and_clear_empty_dirs() {
        let remote = FakeRemote::new(false);
        remote.storage.connect().await.unwrap();
        std::fs::create_dir_all(remote.root().join("archives/medium/Pictures/1")).unwrap();
        std::fs::create_dir_all(remote.root().join("archives/packages/a/1")).unwrap();
        std::fs::write(remote.root().join("archives/packages/a/1/apk.tar"), b"x").unwrap();

        remote.storage.purge("archives/packages").await.unwrap();
        assert!(!remote.root().join("archives/packages").exists());
        remote.storage.clear_empty_dirs("archives").await.unwrap();
        assert!(remote.root().join("archives").is_dir());
        assert!(!remote.root().join("archives/medium").exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_copy_reports_stderr() {
        let remote = FakeRemote::new(true);
        let local = tempdir().unwrap();
        let archive = local.path().join("apk.tar");
        std::fs::write(&archive, b"apk").unwrap();
        let err = remote.storage.upload(&archive, "archives", None).await.unwrap_err();
        assert!(format!("{err:#}").contains("connection refused"));
    }
}
