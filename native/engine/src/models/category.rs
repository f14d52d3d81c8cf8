use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of content captured per package.
///
/// The declaration order is the processing order of both pipelines: the
/// executable is installed before any data is restored, and the package config
/// (permissions, device-scoped id) is applied last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataCategory {
    Executable,
    UserData,
    UserDeData,
    DeviceData,
    ObbData,
    MediaData,
    Config,
}

/// Cache-like folders never worth capturing.
const PACKAGE_EXCLUDED_FOLDERS: [&str; 5] = [".ota", "cache", "lib", "code_cache", "no_backup"];

impl DataCategory {
    pub const ALL: [DataCategory; 7] = [
        DataCategory::Executable,
        DataCategory::UserData,
        DataCategory::UserDeData,
        DataCategory::DeviceData,
        DataCategory::ObbData,
        DataCategory::MediaData,
        DataCategory::Config,
    ];

    /// File stem of the category's archive inside a backup directory.
    pub fn archive_name(&self) -> &'static str {
        match self {
            DataCategory::Executable => "apk",
            DataCategory::UserData => "user",
            DataCategory::UserDeData => "user_de",
            DataCategory::DeviceData => "data",
            DataCategory::ObbData => "obb",
            DataCategory::MediaData => "media",
            DataCategory::Config => "config",
        }
    }

    /// Whether the category is a tar-archived data directory of the package.
    pub fn is_data(&self) -> bool {
        matches!(
            self,
            DataCategory::UserData
                | DataCategory::UserDeData
                | DataCategory::DeviceData
                | DataCategory::ObbData
                | DataCategory::MediaData
        )
    }

    /// Whether a missing source is a failure rather than a skip.
    ///
    /// NOTE: only the executable and the credential-encrypted user data are
    /// treated as mandatory. Every other category reports absence through
    /// the "not present" sentinel and ends up skipped.
    pub fn is_required(&self) -> bool {
        matches!(self, DataCategory::Executable | DataCategory::UserData)
    }

    /// Data stored on shared external storage, owned by a shared group rather than
    /// the package uid.
    pub fn is_external(&self) -> bool {
        matches!(self, DataCategory::DeviceData | DataCategory::ObbData | DataCategory::MediaData)
    }

    /// Tar `--exclude` patterns for the category, relative to its origin directory.
    pub fn exclusions(&self, package: &str) -> Vec<String> {
        if !self.is_data() {
            return Vec::new();
        }
        let mut patterns: Vec<String> =
            PACKAGE_EXCLUDED_FOLDERS.iter().map(|folder| format!("{package}/{folder}")).collect();
        if self.is_external() {
            patterns.push("Backup_*".to_string());
        }
        patterns
    }
}

impl fmt::Display for DataCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.archive_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_names_are_unique() {
        let mut names: Vec<_> = DataCategory::ALL.iter().map(|c| c.archive_name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), DataCategory::ALL.len());
    }

    #[test]
    fn external_categories_also_exclude_backup_folders() {
        let user = DataCategory::UserData.exclusions("com.example.app");
        assert_eq!(user.len(), 5);
        assert!(user.contains(&"com.example.app/cache".to_string()));
        assert!(!user.contains(&"Backup_*".to_string()));

        let obb = DataCategory::ObbData.exclusions("com.example.app");
        assert_eq!(obb.len(), 6);
        assert_eq!(obb.last().map(String::as_str), Some("Backup_*"));

        assert!(DataCategory::Executable.exclusions("com.example.app").is_empty());
        assert!(DataCategory::Config.exclusions("com.example.app").is_empty());
    }

    #[test]
    fn serializes_in_screaming_snake_case() {
        let json = serde_json::to_string(&DataCategory::UserDeData).unwrap();
        assert_eq!(json, "\"USER_DE_DATA\"");
    }
}
