use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::warn;

/// Compression backend piped after the archiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompressionKind {
    /// Plain tar, no pipe stage at all.
    None,
    #[default]
    Zstd,
    Lz4,
}

impl CompressionKind {
    pub const ALL: [CompressionKind; 3] =
        [CompressionKind::None, CompressionKind::Zstd, CompressionKind::Lz4];

    /// Name used when persisting the kind in settings and package configs.
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionKind::None => "tar",
            CompressionKind::Zstd => "zstd",
            CompressionKind::Lz4 => "lz4",
        }
    }

    /// Archive file suffix, without the leading dot.
    pub fn suffix(&self) -> &'static str {
        match self {
            CompressionKind::None => "tar",
            CompressionKind::Zstd => "tar.zst",
            CompressionKind::Lz4 => "tar.lz4",
        }
    }

    /// Compressor command reading the tar stream from stdin, if any.
    pub fn compress_fragment(&self, level: i32) -> Option<String> {
        let level = level.clamp(1, 22);
        match self {
            CompressionKind::None => None,
            CompressionKind::Zstd => Some(format!("zstd -r -T0 --ultra -{level} -q --priority=rt")),
            CompressionKind::Lz4 => {
                Some(format!("zstd -r -T0 --ultra -{level} -q --priority=rt --format=lz4"))
            }
        }
    }

    /// Decompressor command writing the tar stream to stdout; the source path follows it.
    pub fn decompress_fragment(&self) -> Option<&'static str> {
        match self {
            CompressionKind::None => None,
            CompressionKind::Zstd | CompressionKind::Lz4 => Some("zstd -d -c"),
        }
    }

    /// Resolves a persisted name, falling back to [`CompressionKind::Zstd`] for anything
    /// unrecognized.
    pub fn from_persisted(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "tar" | "none" => CompressionKind::None,
            "zstd" | "zst" => CompressionKind::Zstd,
            "lz4" => CompressionKind::Lz4,
            other => {
                warn!(value = other, "Unknown compression kind, falling back to zstd");
                CompressionKind::Zstd
            }
        }
    }

    /// Detects the kind from an archive file name such as `data.tar.zst`.
    pub fn from_file_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().rev().find(|kind| name.ends_with(&format!(".{}", kind.suffix())))
    }
}

impl fmt::Display for CompressionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for CompressionKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for CompressionKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(CompressionKind::from_persisted(&value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_names_fall_back_to_zstd() {
        assert_eq!(CompressionKind::from_persisted("TAR"), CompressionKind::None);
        assert_eq!(CompressionKind::from_persisted("lz4"), CompressionKind::Lz4);
        assert_eq!(CompressionKind::from_persisted("brotli"), CompressionKind::Zstd);
        assert_eq!(CompressionKind::from_persisted(""), CompressionKind::Zstd);

        let kind: CompressionKind = serde_json::from_str("\"xz\"").unwrap();
        assert_eq!(kind, CompressionKind::Zstd);
    }

    #[test]
    fn plain_tar_has_no_pipe_stage() {
        assert_eq!(CompressionKind::None.compress_fragment(1), None);
        assert_eq!(CompressionKind::None.decompress_fragment(), None);
    }

    #[test]
    fn lz4_reuses_zstd_with_format_flag() {
        assert_eq!(
            CompressionKind::Lz4.compress_fragment(1).as_deref(),
            Some("zstd -r -T0 --ultra -1 -q --priority=rt --format=lz4")
        );
        assert_eq!(
            CompressionKind::Zstd.compress_fragment(99).as_deref(),
            Some("zstd -r -T0 --ultra -22 -q --priority=rt")
        );
    }

    #[test]
    fn detects_kind_from_file_name() {
        assert_eq!(CompressionKind::from_file_name("data.tar.zst"), Some(CompressionKind::Zstd));
        assert_eq!(CompressionKind::from_file_name("apk.tar.lz4"), Some(CompressionKind::Lz4));
        assert_eq!(CompressionKind::from_file_name("user.tar"), Some(CompressionKind::None));
        assert_eq!(CompressionKind::from_file_name("config.json"), None);
    }
}
