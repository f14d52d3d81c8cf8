use std::{
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::{Context, Result};
use humansize::{DECIMAL, format_size};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tracing::{debug, instrument};

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_millis() as i64)
}

pub fn human_size(bytes: u64) -> String {
    format_size(bytes, DECIMAL)
}

/// Renders a millisecond timestamp for logs and record text.
pub fn format_timestamp(millis: i64) -> String {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
        .ok()
        .and_then(|t| t.format(&Rfc3339).ok())
        .unwrap_or_else(|| millis.to_string())
}

/// Resolves `name` from `search_dirs` first, then from `PATH`.
#[instrument(level = "debug", ret, err)]
pub fn resolve_binary_path(search_dirs: &[PathBuf], name: &str) -> Result<PathBuf> {
    let candidate = Path::new(name);
    if candidate.is_absolute() {
        return Ok(candidate.to_path_buf());
    }
    for dir in search_dirs {
        let path = dir.join(name);
        if path.is_file() {
            debug!(path = %path.display(), "Found binary in tool directory");
            return Ok(path);
        }
    }
    which::which(name).with_context(|| format!("{name} not found"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_sizes_and_timestamps() {
        assert_eq!(human_size(1_500_000), "1.50 MB");
        assert_eq!(format_timestamp(0), "1970-01-01T00:00:00Z");
        assert!(now_millis() > 1_600_000_000_000);
    }

    #[test]
    fn prefers_tool_dirs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("zstd"), b"").unwrap();
        let resolved = resolve_binary_path(&[dir.path().to_path_buf()], "zstd").unwrap();
        assert_eq!(resolved, dir.path().join("zstd"));
        assert_eq!(resolve_binary_path(&[], "/bin/sh").unwrap(), PathBuf::from("/bin/sh"));
        assert!(resolve_binary_path(&[], "definitely-not-a-real-binary").is_err());
    }
}
