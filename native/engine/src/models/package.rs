use std::{collections::BTreeSet, fmt};

use anyhow::{Result, ensure};
use lazy_regex::{Lazy, Regex, lazy_regex};
use serde::{Deserialize, Serialize};

use super::{CompressionKind, DataCategory};

pub(crate) static PACKAGE_NAME_REGEX: Lazy<Regex> =
    lazy_regex!(r"^(?:[A-Za-z]{1}[\w]*\.)+[A-Za-z][\w]*$");

/// Validated Android package name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PackageName(String);

impl PackageName {
    /// Validates and constructs a `PackageName` from the provided string-like value.
    pub fn parse(value: impl AsRef<str>) -> Result<Self> {
        let value_ref = value.as_ref();
        ensure!(PACKAGE_NAME_REGEX.is_match(value_ref), "Invalid package name: '{}'", value_ref);
        Ok(Self(value_ref.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PackageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for PackageName {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(value)
    }
}

impl From<PackageName> for String {
    fn from(value: PackageName) -> Self {
        value.0
    }
}

/// A package selected for backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageEntry {
    pub package: PackageName,
    pub label: String,
    pub user_id: u32,
    /// Categories to capture; everything else is recorded as skipped.
    pub categories: BTreeSet<DataCategory>,
}

/// An arbitrary directory selected for backup as a media item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaEntry {
    pub name: String,
    /// Absolute device path of the directory.
    pub path: String,
}

/// A backup set of a package selected for restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRestoreEntry {
    pub package: PackageName,
    pub label: String,
    pub user_id: u32,
    /// Run timestamp of the backup set to restore.
    pub backup_timestamp: i64,
    pub compression: CompressionKind,
    pub categories: BTreeSet<DataCategory>,
    pub selected: bool,
}

/// A backup set of a media item selected for restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRestoreEntry {
    pub name: String,
    pub path: String,
    pub backup_timestamp: i64,
    pub compression: CompressionKind,
    pub selected: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimePermission {
    pub name: String,
    pub granted: bool,
}

/// Package metadata written as the `config` member of a backup set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageConfig {
    pub package: PackageName,
    pub label: String,
    pub user_id: u32,
    pub uid: i32,
    pub sdk_int: i64,
    pub compression: CompressionKind,
    pub timestamp: i64,
    pub categories: BTreeSet<DataCategory>,
    #[serde(default)]
    pub permissions: Vec<RuntimePermission>,
    #[serde(default)]
    pub ssaid: Option<String>,
}
