use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::CompressionKind;

/// rclone-backed remote mirror of the archive tree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteSettings {
    pub rclone_path: String,
    #[serde(default)]
    pub rclone_config_path: Option<String>,
    pub remote_name: String,
    pub root_dir: String,
    #[serde(default)]
    pub bandwidth_limit: String,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            rclone_path: "rclone".to_string(),
            rclone_config_path: None,
            remote_name: "remote".to_string(),
            root_dir: "DataBackup".to_string(),
            bandwidth_limit: "".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Settings {
    /// Root of the archive tree (`archives/`, `configs/`, `log/`).
    pub backup_root: String,
    /// Private engine directory holding operation records and scratch space.
    pub data_dir: String,
    pub user_id: u32,
    pub compression: CompressionKind,
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,
    #[serde(default)]
    pub follow_symlinks: bool,
    #[serde(default = "default_true")]
    pub compression_test: bool,
    #[serde(default)]
    pub clean_restoring: bool,
    #[serde(default = "default_true")]
    pub kill_app_before_backup: bool,
    #[serde(default)]
    pub skip_unchanged: bool,
    #[serde(default)]
    pub reset_selection_after_restore: bool,
    /// Argument vector that runs a shell script as root; the script is appended.
    pub shell_launcher: Vec<String>,
    /// Argument vector that starts the privileged helper speaking on stdin/stdout.
    pub helper_launcher: Vec<String>,
    /// Extra directories searched for `tar`, `zstd` and friends.
    #[serde(default)]
    pub tool_dirs: Vec<String>,
    /// Prefix for device origin paths such as `/data/user/0`.
    #[serde(default = "default_device_root")]
    pub device_root: String,
    #[serde(default)]
    pub remote: Option<RemoteSettings>,
}

fn default_compression_level() -> i32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_device_root() -> String {
    "/".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("/data/local/tmp"))
            .join("databackup");
        Self {
            backup_root: "/storage/emulated/0/DataBackup".to_string(),
            data_dir: data_dir.to_string_lossy().to_string(),
            user_id: 0,
            compression: CompressionKind::Zstd,
            compression_level: default_compression_level(),
            follow_symlinks: false,
            compression_test: true,
            clean_restoring: false,
            kill_app_before_backup: true,
            skip_unchanged: false,
            reset_selection_after_restore: false,
            shell_launcher: vec!["su".to_string(), "-c".to_string()],
            helper_launcher: vec!["su".to_string(), "-c".to_string(), "rootd".to_string()],
            tool_dirs: Vec::new(),
            device_root: default_device_root(),
            remote: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_optional_fields_use_defaults() {
        let json = r#"{
            "backup_root": "/sdcard/DataBackup",
            "data_dir": "/data/local/tmp/engine",
            "user_id": 10,
            "compression": "lzma",
            "shell_launcher": ["sh", "-c"],
            "helper_launcher": ["rootd"]
        }"#;
        let settings: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.user_id, 10);
        assert_eq!(settings.compression, CompressionKind::Zstd);
        assert_eq!(settings.compression_level, 1);
        assert!(settings.compression_test);
        assert!(!settings.clean_restoring);
        assert_eq!(settings.device_root, "/");
        assert!(settings.remote.is_none());
    }
}
