//! On-disk layouts: the archive tree under the backup root, and the origin
//! directories of each data category on the device.

use std::path::{Path, PathBuf};

use const_format::concatcp;

use crate::models::{CompressionKind, DataCategory};

pub const ARCHIVES_DIR: &str = "archives";
pub const PACKAGES_DIR: &str = concatcp!(ARCHIVES_DIR, "/packages");
pub const MEDIUM_DIR: &str = concatcp!(ARCHIVES_DIR, "/medium");
pub const CONFIGS_DIR: &str = "configs";
pub const LOG_DIR: &str = "log";
pub const PACKAGE_CONFIG_FILE: &str = "config.json";

/// Layout of the archive tree, relative to a backup root (local) or a remote root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupLayout {
    root: PathBuf,
}

impl BackupLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn package_dir(&self, package: &str, timestamp: i64) -> PathBuf {
        self.root.join(PACKAGES_DIR).join(package).join(timestamp.to_string())
    }

    /// File name of a category inside a package backup directory.
    pub fn category_file_name(category: DataCategory, compression: CompressionKind) -> String {
        match category {
            DataCategory::Config => PACKAGE_CONFIG_FILE.to_string(),
            _ => format!("{}.{}", category.archive_name(), compression.suffix()),
        }
    }

    pub fn category_path(
        &self,
        package: &str,
        timestamp: i64,
        category: DataCategory,
        compression: CompressionKind,
    ) -> PathBuf {
        self.package_dir(package, timestamp).join(Self::category_file_name(category, compression))
    }

    pub fn media_dir(&self, name: &str, timestamp: i64) -> PathBuf {
        self.root.join(MEDIUM_DIR).join(sanitize_filename::sanitize(name)).join(timestamp.to_string())
    }

    pub fn media_path(&self, name: &str, timestamp: i64, compression: CompressionKind) -> PathBuf {
        self.media_dir(name, timestamp)
            .join(Self::category_file_name(DataCategory::MediaData, compression))
    }

    pub fn configs_dir(&self) -> PathBuf {
        self.root.join(CONFIGS_DIR)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join(LOG_DIR)
    }

    pub fn log_file_name(timestamp: i64) -> String {
        format!("log_{timestamp}")
    }

    /// `path` relative to the root, as a forward-slash string for remote storage.
    pub fn relative(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        Some(relative.to_string_lossy().replace('\\', "/"))
    }
}

/// Origin directories of the data categories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceLayout {
    root: PathBuf,
}

impl DeviceLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves an absolute device path below the layout root.
    pub fn resolve(&self, device_path: &str) -> PathBuf {
        self.root.join(device_path.trim_start_matches('/'))
    }

    /// Directory that holds one sub-directory per package for `category`.
    ///
    /// The executable and config categories have no fixed origin.
    pub fn origin_dir(&self, category: DataCategory, user_id: u32) -> Option<PathBuf> {
        let relative = match category {
            DataCategory::UserData => format!("data/user/{user_id}"),
            DataCategory::UserDeData => format!("data/user_de/{user_id}"),
            DataCategory::DeviceData => format!("data/media/{user_id}/Android/data"),
            DataCategory::ObbData => format!("data/media/{user_id}/Android/obb"),
            DataCategory::MediaData => format!("data/media/{user_id}/Android/media"),
            DataCategory::Executable | DataCategory::Config => return None,
        };
        Some(self.root.join(relative))
    }

    pub fn origin_path(&self, category: DataCategory, user_id: u32, package: &str) -> Option<PathBuf> {
        self.origin_dir(category, user_id).map(|dir| dir.join(package))
    }

    /// Settings provider file storing per-app device-scoped ids.
    pub fn ssaid_file(&self, user_id: u32) -> PathBuf {
        self.root.join(format!("data/system/users/{user_id}/settings_ssaid.xml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_archive_tree() {
        let layout = BackupLayout::new("/sdcard/DataBackup");
        assert_eq!(
            layout.category_path("com.example.app", 42, DataCategory::Executable, CompressionKind::Zstd),
            PathBuf::from("/sdcard/DataBackup/archives/packages/com.example.app/42/apk.tar.zst")
        );
        assert_eq!(
            layout.category_path("com.example.app", 42, DataCategory::Config, CompressionKind::Zstd),
            PathBuf::from("/sdcard/DataBackup/archives/packages/com.example.app/42/config.json")
        );
        assert_eq!(
            layout.media_path("Pictures", 7, CompressionKind::None),
            PathBuf::from("/sdcard/DataBackup/archives/medium/Pictures/7/media.tar")
        );
        assert_eq!(layout.configs_dir(), PathBuf::from("/sdcard/DataBackup/configs"));
        assert_eq!(layout.log_dir().join(BackupLayout::log_file_name(7)), PathBuf::from("/sdcard/DataBackup/log/log_7"));
        assert_eq!(
            layout.relative(&layout.package_dir("com.example.app", 42)).as_deref(),
            Some("archives/packages/com.example.app/42")
        );
    }

    #[test]
    fn media_names_cannot_escape_the_tree() {
        let layout = BackupLayout::new("/backup");
        let dir = layout.media_dir("../../etc", 1);
        assert!(dir.starts_with("/backup/archives/medium"));
    }

    #[test]
    fn renders_origin_templates() {
        let device = DeviceLayout::new("/");
        assert_eq!(device.origin_dir(DataCategory::UserData, 0), Some(PathBuf::from("/data/user/0")));
        assert_eq!(device.origin_dir(DataCategory::UserDeData, 10), Some(PathBuf::from("/data/user_de/10")));
        assert_eq!(
            device.origin_path(DataCategory::ObbData, 0, "com.example.app"),
            Some(PathBuf::from("/data/media/0/Android/obb/com.example.app"))
        );
        assert_eq!(device.origin_dir(DataCategory::Executable, 0), None);

        let sandbox = DeviceLayout::new("/tmp/device");
        assert_eq!(sandbox.resolve("/sdcard/Pictures"), PathBuf::from("/tmp/device/sdcard/Pictures"));
    }
}
