//! Privileged execution bridge.
//!
//! [`RootSession`] owns one channel to the privileged helper, reconnects it on
//! demand and exposes every filesystem and package-manager primitive twice: as a
//! `try_*` method returning [`BridgeError`], and as an infallible method that logs,
//! notifies the failure callback and returns a neutral default.

use std::{
    error::Error,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use derive_more::Debug;
use tokio::sync::{Mutex, RwLock, watch};
use tracing::{debug, info, instrument, warn};

mod channel;
mod error;
pub mod local;
pub mod process;
pub mod protocol;
pub mod server;
pub mod ssaid;

pub use channel::{Connector, RootChannel};
pub use error::BridgeError;
pub use protocol::{FileStat, InstalledPackage, PathEntry, Reply, Request, StorageStats};

use crate::{models::RuntimePermission, shell::ShellResult};

pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Passed to the failure callback whenever an infallible primitive falls back to its default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeFailure {
    pub operation: &'static str,
    pub error: BridgeError,
}

pub type FailureCallback = Arc<dyn Fn(&BridgeFailure) + Send + Sync>;

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn expect_reply<T>(
    op: &'static str,
    reply: Reply,
    extract: fn(Reply) -> Option<T>,
) -> Result<T, BridgeError> {
    extract(reply).ok_or(BridgeError::UnexpectedReply { op })
}

#[derive(Debug)]
pub struct RootSession {
    connector: Arc<dyn Connector>,
    channel: RwLock<Option<Arc<dyn RootChannel>>>,
    state: watch::Sender<ConnectionState>,
    connect_lock: Mutex<()>,
    connect_attempts: AtomicU64,
    retry_delay: Duration,
    #[debug(skip)]
    on_failure: std::sync::RwLock<Option<FailureCallback>>,
}

impl RootSession {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self::with_retry_delay(connector, DEFAULT_RETRY_DELAY)
    }

    pub fn with_retry_delay(connector: Arc<dyn Connector>, retry_delay: Duration) -> Self {
        Self {
            connector,
            channel: RwLock::new(None),
            state: watch::Sender::new(ConnectionState::Disconnected),
            connect_lock: Mutex::new(()),
            connect_attempts: AtomicU64::new(0),
            retry_delay,
            on_failure: std::sync::RwLock::new(None),
        }
    }

    /// Registers the callback fired by every infallible primitive that failed.
    pub fn set_failure_callback(&self, callback: FailureCallback) {
        if let Ok(mut slot) = self.on_failure.write() {
            *slot = Some(callback);
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Number of connection attempts made so far.
    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts.load(Ordering::Relaxed)
    }

    async fn live_channel(&self) -> Option<Arc<dyn RootChannel>> {
        self.channel.read().await.as_ref().filter(|c| c.is_alive()).cloned()
    }

    /// Returns the current channel, connecting a new one if there is none or it died.
    async fn channel(&self) -> Result<Arc<dyn RootChannel>, BridgeError> {
        if let Some(channel) = self.live_channel().await {
            return Ok(channel);
        }

        let _guard = self.connect_lock.lock().await;
        if let Some(channel) = self.live_channel().await {
            return Ok(channel);
        }

        self.state.send_replace(ConnectionState::Connecting);
        let attempt = self.connect_attempts.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(attempt, delay = ?self.retry_delay, "Connecting to privileged helper");
        tokio::time::sleep(self.retry_delay).await;

        match self.connector.connect().await {
            Ok(channel) => {
                *self.channel.write().await = Some(channel.clone());
                self.state.send_replace(ConnectionState::Connected);
                info!(attempt, "Privileged channel connected");
                Ok(channel)
            }
            Err(e) => {
                *self.channel.write().await = None;
                self.state.send_replace(ConnectionState::Disconnected);
                warn!(attempt, error = &e as &dyn Error, "Failed to connect privileged channel");
                Err(e)
            }
        }
    }

    async fn drop_channel(&self, dead: &Arc<dyn RootChannel>) {
        let mut slot = self.channel.write().await;
        if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, dead)) {
            *slot = None;
            self.state.send_replace(ConnectionState::Disconnected);
        }
    }

    /// Sends one request, retrying once on a fresh channel if the current one died.
    pub async fn call(&self, request: Request) -> Result<Reply, BridgeError> {
        let channel = self.channel().await?;
        match channel.call(request.clone()).await {
            Err(e) if e.is_channel_failure() => {
                debug!(op = request.name(), error = &e as &dyn Error, "Channel died, retrying once");
                self.drop_channel(&channel).await;
                let channel = self.channel().await?;
                let result = channel.call(request).await;
                if result.as_ref().is_err_and(BridgeError::is_channel_failure) {
                    self.drop_channel(&channel).await;
                }
                result
            }
            other => other,
        }
    }

    /// Releases the channel and optionally terminates the helper. Safe to call repeatedly.
    #[instrument(level = "debug", skip(self))]
    pub async fn destroy(&self, kill_daemon: bool) {
        let _guard = self.connect_lock.lock().await;
        let channel = self.channel.write().await.take();
        if let Some(channel) = channel {
            channel.shutdown(kill_daemon).await;
        }
        self.state.send_replace(ConnectionState::Disconnected);
    }

    fn settle<T>(&self, operation: &'static str, result: Result<T, BridgeError>, default: T) -> T {
        match result {
            Ok(value) => value,
            Err(error) => {
                warn!(operation, error = &error as &dyn Error, "Privileged operation failed");
                let callback = self.on_failure.read().ok().and_then(|slot| slot.clone());
                if let Some(callback) = callback {
                    callback(&BridgeFailure { operation, error });
                }
                default
            }
        }
    }

    async fn request<T>(
        &self,
        request: Request,
        extract: fn(Reply) -> Option<T>,
    ) -> Result<T, BridgeError> {
        let op = request.name();
        let reply = self.call(request).await?;
        expect_reply(op, reply, extract)
    }

    pub async fn try_ping(&self) -> Result<(), BridgeError> {
        self.request(Request::Ping, Reply::into_unit).await
    }

    // Filesystem primitives

    pub async fn try_mkdirs(&self, path: &Path) -> Result<bool, BridgeError> {
        self.request(Request::Mkdirs { path: path_arg(path) }, Reply::into_bool).await
    }

    pub async fn mkdirs(&self, path: &Path) -> bool {
        self.settle("mkdirs", self.try_mkdirs(path).await, false)
    }

    pub async fn try_copy(&self, src: &Path, dst: &Path, overwrite: bool) -> Result<bool, BridgeError> {
        let request = Request::Copy { src: path_arg(src), dst: path_arg(dst), overwrite };
        self.request(request, Reply::into_bool).await
    }

    pub async fn copy(&self, src: &Path, dst: &Path, overwrite: bool) -> bool {
        self.settle("copy", self.try_copy(src, dst, overwrite).await, false)
    }

    pub async fn try_rename(&self, src: &Path, dst: &Path) -> Result<bool, BridgeError> {
        self.request(Request::Rename { src: path_arg(src), dst: path_arg(dst) }, Reply::into_bool).await
    }

    pub async fn rename(&self, src: &Path, dst: &Path) -> bool {
        self.settle("rename", self.try_rename(src, dst).await, false)
    }

    /// `Ok(false)` when there was nothing to delete.
    pub async fn try_delete(&self, path: &Path) -> Result<bool, BridgeError> {
        self.request(Request::Delete { path: path_arg(path) }, Reply::into_bool).await
    }

    pub async fn delete(&self, path: &Path) -> bool {
        self.settle("delete", self.try_delete(path).await, false)
    }

    pub async fn try_exists(&self, path: &Path) -> Result<bool, BridgeError> {
        self.request(Request::Exists { path: path_arg(path) }, Reply::into_bool).await
    }

    pub async fn exists(&self, path: &Path) -> bool {
        self.settle("exists", self.try_exists(path).await, false)
    }

    pub async fn try_read_bytes(&self, path: &Path) -> Result<Vec<u8>, BridgeError> {
        self.request(Request::ReadBytes { path: path_arg(path) }, Reply::into_bytes).await
    }

    pub async fn read_bytes(&self, path: &Path) -> Vec<u8> {
        self.settle("read_bytes", self.try_read_bytes(path).await, Vec::new())
    }

    pub async fn try_read_text(&self, path: &Path) -> Result<String, BridgeError> {
        self.request(Request::ReadText { path: path_arg(path) }, Reply::into_text).await
    }

    pub async fn read_text(&self, path: &Path) -> String {
        self.settle("read_text", self.try_read_text(path).await, String::new())
    }

    pub async fn try_write_bytes(&self, path: &Path, data: Vec<u8>) -> Result<(), BridgeError> {
        self.request(Request::WriteBytes { path: path_arg(path), data }, Reply::into_unit).await
    }

    /// Creates missing parent directories.
    pub async fn write_bytes(&self, path: &Path, data: Vec<u8>) -> bool {
        let result = self.try_write_bytes(path, data).await.map(|()| true);
        self.settle("write_bytes", result, false)
    }

    pub async fn try_stat(&self, path: &Path) -> Result<Option<FileStat>, BridgeError> {
        self.request(Request::Stat { path: path_arg(path) }, Reply::into_stat).await
    }

    pub async fn stat(&self, path: &Path) -> Option<FileStat> {
        self.settle("stat", self.try_stat(path).await, None)
    }

    pub async fn try_walk(&self, path: &Path) -> Result<Vec<PathEntry>, BridgeError> {
        self.request(Request::Walk { path: path_arg(path) }, Reply::into_entries).await
    }

    pub async fn walk(&self, path: &Path) -> Vec<PathEntry> {
        self.settle("walk", self.try_walk(path).await, Vec::new())
    }

    pub async fn try_list_paths(&self, path: &Path) -> Result<Vec<String>, BridgeError> {
        self.request(Request::ListPaths { path: path_arg(path) }, Reply::into_paths).await
    }

    pub async fn list_paths(&self, path: &Path) -> Vec<String> {
        self.settle("list_paths", self.try_list_paths(path).await, Vec::new())
    }

    pub async fn try_calculate_size(&self, path: &Path) -> Result<u64, BridgeError> {
        self.request(Request::CalculateSize { path: path_arg(path) }, Reply::into_size).await
    }

    pub async fn calculate_size(&self, path: &Path) -> u64 {
        self.settle("calculate_size", self.try_calculate_size(path).await, 0)
    }

    pub async fn try_chmod(&self, path: &Path, mode: u32) -> Result<bool, BridgeError> {
        self.request(Request::Chmod { path: path_arg(path), mode }, Reply::into_bool).await
    }

    pub async fn chmod(&self, path: &Path, mode: u32) -> bool {
        self.settle("chmod", self.try_chmod(path, mode).await, false)
    }

    // Package manager primitives

    pub async fn try_list_installed_packages(
        &self,
        user_id: u32,
    ) -> Result<Vec<InstalledPackage>, BridgeError> {
        self.request(Request::ListInstalledPackages { user_id }, Reply::into_packages).await
    }

    pub async fn list_installed_packages(&self, user_id: u32) -> Vec<InstalledPackage> {
        self.settle("list_installed_packages", self.try_list_installed_packages(user_id).await, Vec::new())
    }

    /// Directory holding the package's apks; empty when not installed.
    pub async fn try_package_source_dir(&self, package: &str, user_id: u32) -> Result<String, BridgeError> {
        let request = Request::PackageSourceDir { package: package.to_string(), user_id };
        self.request(request, Reply::into_text).await
    }

    pub async fn package_source_dir(&self, package: &str, user_id: u32) -> String {
        self.settle("package_source_dir", self.try_package_source_dir(package, user_id).await, String::new())
    }

    /// `-1` when the package is not installed for `user_id`.
    pub async fn try_package_uid(&self, package: &str, user_id: u32) -> Result<i64, BridgeError> {
        let request = Request::PackageUid { package: package.to_string(), user_id };
        self.request(request, Reply::into_int).await
    }

    pub async fn package_uid(&self, package: &str, user_id: u32) -> i64 {
        self.settle("package_uid", self.try_package_uid(package, user_id).await, -1)
    }

    pub async fn try_query_installed(&self, package: &str, user_id: u32) -> Result<bool, BridgeError> {
        let request = Request::QueryInstalled { package: package.to_string(), user_id };
        self.request(request, Reply::into_bool).await
    }

    pub async fn query_installed(&self, package: &str, user_id: u32) -> bool {
        self.settle("query_installed", self.try_query_installed(package, user_id).await, false)
    }

    pub async fn try_query_storage_stats(
        &self,
        package: &str,
        user_id: u32,
    ) -> Result<Option<StorageStats>, BridgeError> {
        let request = Request::QueryStorageStats { package: package.to_string(), user_id };
        self.request(request, Reply::into_stats).await
    }

    pub async fn query_storage_stats(&self, package: &str, user_id: u32) -> Option<StorageStats> {
        self.settle("query_storage_stats", self.try_query_storage_stats(package, user_id).await, None)
    }

    pub async fn try_grant_permission(
        &self,
        package: &str,
        permission: &str,
        user_id: u32,
    ) -> Result<bool, BridgeError> {
        let request = Request::GrantPermission {
            package: package.to_string(),
            permission: permission.to_string(),
            user_id,
        };
        self.request(request, Reply::into_bool).await
    }

    pub async fn grant_permission(&self, package: &str, permission: &str, user_id: u32) -> bool {
        self.settle("grant_permission", self.try_grant_permission(package, permission, user_id).await, false)
    }

    pub async fn try_revoke_permission(
        &self,
        package: &str,
        permission: &str,
        user_id: u32,
    ) -> Result<bool, BridgeError> {
        let request = Request::RevokePermission {
            package: package.to_string(),
            permission: permission.to_string(),
            user_id,
        };
        self.request(request, Reply::into_bool).await
    }

    pub async fn revoke_permission(&self, package: &str, permission: &str, user_id: u32) -> bool {
        self.settle("revoke_permission", self.try_revoke_permission(package, permission, user_id).await, false)
    }

    pub async fn try_list_runtime_permissions(
        &self,
        package: &str,
        user_id: u32,
    ) -> Result<Vec<RuntimePermission>, BridgeError> {
        let request = Request::ListRuntimePermissions { package: package.to_string(), user_id };
        self.request(request, Reply::into_permissions).await
    }

    pub async fn list_runtime_permissions(&self, package: &str, user_id: u32) -> Vec<RuntimePermission> {
        let result = self.try_list_runtime_permissions(package, user_id).await;
        self.settle("list_runtime_permissions", result, Vec::new())
    }

    pub async fn try_device_scoped_id(
        &self,
        package: &str,
        user_id: u32,
    ) -> Result<Option<String>, BridgeError> {
        let request = Request::GetDeviceScopedId { package: package.to_string(), user_id };
        self.request(request, Reply::into_optional_text).await
    }

    pub async fn device_scoped_id(&self, package: &str, user_id: u32) -> Option<String> {
        self.settle("get_device_scoped_id", self.try_device_scoped_id(package, user_id).await, None)
    }

    pub async fn try_set_device_scoped_id(
        &self,
        package: &str,
        user_id: u32,
        value: &str,
    ) -> Result<bool, BridgeError> {
        let request = Request::SetDeviceScopedId {
            package: package.to_string(),
            user_id,
            value: value.to_string(),
        };
        self.request(request, Reply::into_bool).await
    }

    pub async fn set_device_scoped_id(&self, package: &str, user_id: u32, value: &str) -> bool {
        let result = self.try_set_device_scoped_id(package, user_id, value).await;
        self.settle("set_device_scoped_id", result, false)
    }

    /// Installs one apk directly or a set of split apks through a staged session.
    pub async fn try_install_packages(&self, apks: &[String], user_id: u32) -> Result<ShellResult, BridgeError> {
        let request = Request::InstallPackages { apks: apks.to_vec(), user_id };
        self.request(request, Reply::into_shell).await
    }

    pub async fn install_packages(&self, apks: &[String], user_id: u32) -> ShellResult {
        match self.try_install_packages(apks, user_id).await {
            Ok(result) => result,
            Err(e) => {
                let message = format!("Privileged install failed: {e}");
                self.settle("install_packages", Err(e), ShellResult::failure(message))
            }
        }
    }

    pub async fn try_sdk_int(&self) -> Result<i64, BridgeError> {
        self.request(Request::SdkInt, Reply::into_int).await
    }

    pub async fn sdk_int(&self) -> i64 {
        self.settle("sdk_int", self.try_sdk_int().await, 0)
    }
}
