//! JSON-lines protocol spoken between the engine and the privileged helper.
//!
//! Every request line is a [`RequestEnvelope`]; the helper answers each with
//! exactly one [`ResponseEnvelope`] carrying the same id.

use serde::{Deserialize, Serialize};

use crate::{models::RuntimePermission, shell::ShellResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Ping,
    Mkdirs { path: String },
    Copy { src: String, dst: String, overwrite: bool },
    Rename { src: String, dst: String },
    Delete { path: String },
    Exists { path: String },
    ReadBytes { path: String },
    ReadText { path: String },
    WriteBytes {
        path: String,
        #[serde(with = "hex")]
        data: Vec<u8>,
    },
    Stat { path: String },
    Walk { path: String },
    ListPaths { path: String },
    CalculateSize { path: String },
    Chmod { path: String, mode: u32 },
    ListInstalledPackages { user_id: u32 },
    PackageSourceDir { package: String, user_id: u32 },
    PackageUid { package: String, user_id: u32 },
    QueryInstalled { package: String, user_id: u32 },
    QueryStorageStats { package: String, user_id: u32 },
    GrantPermission { package: String, permission: String, user_id: u32 },
    RevokePermission { package: String, permission: String, user_id: u32 },
    ListRuntimePermissions { package: String, user_id: u32 },
    GetDeviceScopedId { package: String, user_id: u32 },
    SetDeviceScopedId { package: String, user_id: u32, value: String },
    InstallPackages { apks: Vec<String>, user_id: u32 },
    SdkInt,
    Shutdown,
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::Ping => "ping",
            Request::Mkdirs { .. } => "mkdirs",
            Request::Copy { .. } => "copy",
            Request::Rename { .. } => "rename",
            Request::Delete { .. } => "delete",
            Request::Exists { .. } => "exists",
            Request::ReadBytes { .. } => "read_bytes",
            Request::ReadText { .. } => "read_text",
            Request::WriteBytes { .. } => "write_bytes",
            Request::Stat { .. } => "stat",
            Request::Walk { .. } => "walk",
            Request::ListPaths { .. } => "list_paths",
            Request::CalculateSize { .. } => "calculate_size",
            Request::Chmod { .. } => "chmod",
            Request::ListInstalledPackages { .. } => "list_installed_packages",
            Request::PackageSourceDir { .. } => "package_source_dir",
            Request::PackageUid { .. } => "package_uid",
            Request::QueryInstalled { .. } => "query_installed",
            Request::QueryStorageStats { .. } => "query_storage_stats",
            Request::GrantPermission { .. } => "grant_permission",
            Request::RevokePermission { .. } => "revoke_permission",
            Request::ListRuntimePermissions { .. } => "list_runtime_permissions",
            Request::GetDeviceScopedId { .. } => "get_device_scoped_id",
            Request::SetDeviceScopedId { .. } => "set_device_scoped_id",
            Request::InstallPackages { .. } => "install_packages",
            Request::SdkInt => "sdk_int",
            Request::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    pub size: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    /// Modification time, unix milliseconds.
    pub modified: i64,
    pub is_dir: bool,
    pub is_symlink: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathEntry {
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledPackage {
    pub package: String,
    pub uid: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageStats {
    pub app_bytes: u64,
    pub data_bytes: u64,
    pub cache_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Reply {
    Unit,
    Bool(bool),
    Int(i64),
    Size(u64),
    Text(String),
    Bytes(#[serde(with = "hex")] Vec<u8>),
    Stat(Option<FileStat>),
    Paths(Vec<String>),
    Entries(Vec<PathEntry>),
    Packages(Vec<InstalledPackage>),
    Stats(Option<StorageStats>),
    Permissions(Vec<RuntimePermission>),
    OptionalText(Option<String>),
    Shell(ShellResult),
}

impl Reply {
    pub fn into_unit(self) -> Option<()> {
        matches!(self, Reply::Unit).then_some(())
    }

    pub fn into_bool(self) -> Option<bool> {
        match self {
            Reply::Bool(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_int(self) -> Option<i64> {
        match self {
            Reply::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_size(self) -> Option<u64> {
        match self {
            Reply::Size(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_text(self) -> Option<String> {
        match self {
            Reply::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_optional_text(self) -> Option<Option<String>> {
        match self {
            Reply::OptionalText(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_bytes(self) -> Option<Vec<u8>> {
        match self {
            Reply::Bytes(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_stat(self) -> Option<Option<FileStat>> {
        match self {
            Reply::Stat(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_paths(self) -> Option<Vec<String>> {
        match self {
            Reply::Paths(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_entries(self) -> Option<Vec<PathEntry>> {
        match self {
            Reply::Entries(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_packages(self) -> Option<Vec<InstalledPackage>> {
        match self {
            Reply::Packages(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_stats(self) -> Option<Option<StorageStats>> {
        match self {
            Reply::Stats(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_permissions(self) -> Option<Vec<RuntimePermission>> {
        match self {
            Reply::Permissions(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_shell(self) -> Option<ShellResult> {
        match self {
            Reply::Shell(v) => Some(v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: u64,
    pub request: Request,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub id: u64,
    pub result: Result<Reply, String>,
}
