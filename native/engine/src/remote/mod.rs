//! Off-device mirror of the archive tree.

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

mod rclone;

pub use rclone::{RcloneClient, RcloneSizeOutput, RcloneStorage};
#[cfg(test)]
pub(crate) use rclone::tests::FakeRemote;

use crate::models::RemoteSettings;

/// Directory created and purged by [`RemoteStorage::test_connection`].
pub const PROBE_DIR: &str = "DataBackupCloudTmpTest";

/// Remote paths are relative to the configured remote root and use `/` separators.
#[async_trait]
pub trait RemoteStorage: Send + Sync + fmt::Debug {
    /// Checks that the remote is reachable and creates the root directory.
    async fn connect(&self) -> Result<()>;

    /// Creates and removes a probe directory.
    async fn test_connection(&self) -> Result<()>;

    /// Total bytes below `path`.
    async fn size(&self, path: &str) -> Result<u64>;

    /// Copies the local file `local` into `remote_dir`.
    async fn upload(&self, local: &Path, remote_dir: &str, cancel: Option<&CancellationToken>) -> Result<()>;

    /// Copies `remote_file` into `local_dir`, returning the local path.
    async fn download(
        &self,
        remote_file: &str,
        local_dir: &Path,
        cancel: Option<&CancellationToken>,
    ) -> Result<PathBuf>;

    /// Removes `path` and everything below it.
    async fn purge(&self, path: &str) -> Result<()>;

    /// Removes empty directories below `path`, keeping `path` itself.
    async fn clear_empty_dirs(&self, path: &str) -> Result<()>;
}

pub fn from_settings(settings: &RemoteSettings) -> Arc<dyn RemoteStorage> {
    Arc::new(RcloneStorage::new(
        PathBuf::from(&settings.rclone_path),
        settings.rclone_config_path.as_ref().map(PathBuf::from),
        settings.remote_name.clone(),
        settings.root_dir.clone(),
        settings.bandwidth_limit.clone(),
    ))
}
