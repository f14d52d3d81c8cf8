//! Package manager and activity manager command lines.

use lazy_regex::regex_captures;

use super::quote;
use crate::models::RuntimePermission;

/// Installer recorded for restored packages on Android 11+.
pub const DEFAULT_INSTALLER: &str = "com.android.vending";
const SDK_R: i64 = 30;
const SDK_U: i64 = 34;

fn s(value: &str) -> String {
    value.to_string()
}

fn install_flags(user_id: u32, sdk_int: i64) -> Vec<String> {
    let mut flags = Vec::new();
    if sdk_int >= SDK_U {
        flags.push(s("--bypass-low-target-sdk-block"));
    }
    if sdk_int >= SDK_R {
        flags.extend([s("-i"), s(DEFAULT_INSTALLER)]);
    }
    flags.extend([s("--user"), user_id.to_string(), s("-r"), s("-t")]);
    flags
}

/// `pm install` for a single apk.
pub fn install_tokens(apk: &str, user_id: u32, sdk_int: i64) -> Vec<String> {
    let mut tokens = vec![s("pm"), s("install")];
    tokens.extend(install_flags(user_id, sdk_int));
    tokens.push(quote(apk));
    tokens
}

/// Opens a staged install session; the output is just the session id.
pub fn install_create_tokens(user_id: u32, sdk_int: i64) -> Vec<String> {
    let mut tokens = vec![s("pm"), s("install-create")];
    tokens.extend(install_flags(user_id, sdk_int));
    tokens.extend([s("|"), s("grep"), s("-E"), s("-o"), quote("[0-9]+")]);
    tokens
}

pub fn install_write_tokens(session: &str, split_name: &str, apk: &str) -> Vec<String> {
    vec![s("pm"), s("install-write"), session.to_string(), quote(split_name), quote(apk)]
}

pub fn install_commit_tokens(session: &str) -> Vec<String> {
    vec![s("pm"), s("install-commit"), session.to_string()]
}

pub fn install_abandon_tokens(session: &str) -> Vec<String> {
    vec![s("pm"), s("install-abandon"), session.to_string()]
}

pub fn force_stop_tokens(package: &str, user_id: u32) -> Vec<String> {
    vec![s("am"), s("force-stop"), s("--user"), user_id.to_string(), package.to_string()]
}

pub fn list_packages_tokens(user_id: u32) -> Vec<String> {
    vec![s("pm"), s("list"), s("packages"), s("-U"), s("--user"), user_id.to_string()]
}

pub fn path_tokens(package: &str, user_id: u32) -> Vec<String> {
    vec![s("pm"), s("path"), s("--user"), user_id.to_string(), package.to_string()]
}

pub fn grant_tokens(package: &str, permission: &str, user_id: u32) -> Vec<String> {
    vec![s("pm"), s("grant"), s("--user"), user_id.to_string(), package.to_string(), permission.to_string()]
}

pub fn revoke_tokens(package: &str, permission: &str, user_id: u32) -> Vec<String> {
    vec![s("pm"), s("revoke"), s("--user"), user_id.to_string(), package.to_string(), permission.to_string()]
}

pub fn dump_package_tokens(package: &str) -> Vec<String> {
    vec![s("dumpsys"), s("package"), package.to_string()]
}

pub fn sdk_int_tokens() -> Vec<String> {
    vec![s("getprop"), s("ro.build.version.sdk")]
}

/// First number printed by `install-create`.
pub fn parse_session_id(lines: &[String]) -> Option<String> {
    lines.iter().find_map(|line| {
        let trimmed = line.trim();
        (!trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_digit()))
            .then(|| trimmed.to_string())
    })
}

/// Parses `pm list packages -U` lines (`package:com.example uid:10123`).
pub fn parse_package_list(lines: &[String]) -> Vec<(String, i32)> {
    lines
        .iter()
        .filter_map(|line| {
            let (_, name, uid) = regex_captures!(r"^package:(\S+)\s+uid:(\d+)", line.trim())?;
            Some((name.to_string(), uid.parse().ok()?))
        })
        .collect()
}

/// Parses `pm path` lines (`package:/data/app/.../base.apk`).
pub fn parse_package_paths(lines: &[String]) -> Vec<String> {
    lines
        .iter()
        .filter_map(|line| line.trim().strip_prefix("package:").map(str::to_string))
        .filter(|path| !path.is_empty())
        .collect()
}

/// Runtime permission grants of `user_id` from `dumpsys package` output.
pub fn parse_runtime_permissions(lines: &[String], user_id: u32) -> Vec<RuntimePermission> {
    let user_header = format!("User {user_id}:");
    let mut in_user = false;
    let mut in_runtime = false;
    let mut permissions = Vec::new();
    for line in lines {
        let trimmed = line.trim();
        if trimmed.starts_with("User ") && trimmed.contains(':') {
            in_user = trimmed.starts_with(&user_header);
            in_runtime = false;
            continue;
        }
        if !in_user {
            continue;
        }
        if trimmed.ends_with("permissions:") {
            in_runtime = trimmed == "runtime permissions:";
            continue;
        }
        if in_runtime
            && let Some((_, name, granted)) =
                regex_captures!(r"^([\w.]+): granted=(true|false)", trimmed)
        {
            permissions.push(RuntimePermission { name: name.to_string(), granted: granted == "true" });
        }
    }
    permissions
}
