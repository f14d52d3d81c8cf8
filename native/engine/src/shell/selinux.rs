//! Ownership and SELinux label commands used after extracting data.

use std::path::Path;

use super::{quote, quote_path};

/// Prints the label of `path` (first column of `ls -Zd`).
pub fn context_tokens(path: &Path) -> Vec<String> {
    vec![
        "ls".into(),
        "-Zd".into(),
        quote_path(path),
        "|".into(),
        "awk".into(),
        quote("{print $1}"),
    ]
}

pub fn chown_tokens(uid: i32, gid: u32, path: &Path) -> Vec<String> {
    vec!["chown".into(), "-hR".into(), format!("{uid}:{gid}"), quote_path(path)]
}

pub fn chcon_tokens(context: &str, path: &Path) -> Vec<String> {
    vec!["chcon".into(), "-hR".into(), quote(context), quote_path(path)]
}

/// Extracts a usable label from `ls -Zd` output.
pub fn parse_context(lines: &[String]) -> Option<String> {
    lines
        .iter()
        .map(|l| l.trim())
        .find(|l| l.starts_with("u:") && l.matches(':').count() >= 3)
        .map(str::to_string)
}

/// Derives a package data label from the label of its parent directory.
pub fn app_context_from_parent(parent_context: &str) -> String {
    parent_context.replace("system_data_file", "app_data_file")
}
