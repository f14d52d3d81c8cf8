//! Builds and runs the tar/compressor pipelines for one data category at a time.
//!
//! Archiving and compression are two pipe stages; a [`CompressionKind::None`]
//! archive has no pipe stage at all.

use std::{error::Error, path::Path, sync::Arc};

use fs_err::tokio as fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub use crate::models::CompressionKind;
use crate::shell::{CommandRunner, ShellResult, quote, quote_path};

/// Input of [`ArchiveEngine::compress`].
#[derive(Debug, Clone)]
pub struct CompressSpec<'a> {
    /// Directory tar changes into (`-C`).
    pub src_dir: &'a Path,
    /// Path relative to `src_dir` that is archived.
    pub src: &'a str,
    pub dst: &'a Path,
    pub exclusions: &'a [String],
    pub follow_symlinks: bool,
    pub kind: CompressionKind,
    pub level: i32,
}

/// Input of [`ArchiveEngine::decompress`].
#[derive(Debug, Clone)]
pub struct ExtractSpec<'a> {
    pub src: &'a Path,
    pub dst_dir: &'a Path,
    pub exclusions: &'a [String],
    /// Unlink existing entries before extracting over them.
    pub clean: bool,
    /// `-m`: do not restore modification times.
    pub touch: bool,
    pub kind: CompressionKind,
}

fn s(value: &str) -> String {
    value.to_string()
}

fn exclude_flags(exclusions: &[String]) -> Vec<String> {
    exclusions
        .iter()
        .filter(|e| !e.is_empty())
        .map(|e| format!("--exclude={}", quote(e)))
        .collect()
}

fn compressor_stage(kind: CompressionKind, level: i32) -> Vec<String> {
    match kind.compress_fragment(level) {
        Some(fragment) => vec![s("|"), fragment],
        None => Vec::new(),
    }
}

/// `tar <excludes> [-h] -cpf - -C <srcDir> -- <src> [| <compressor>] > <dst>`
pub fn compress_tokens(spec: &CompressSpec<'_>) -> Vec<String> {
    let mut tokens = vec![s("tar")];
    tokens.extend(exclude_flags(spec.exclusions));
    if spec.follow_symlinks {
        tokens.push(s("-h"));
    }
    tokens.extend([s("-cpf"), s("-"), s("-C"), quote_path(spec.src_dir), s("--"), quote(spec.src)]);
    tokens.extend(compressor_stage(spec.kind, spec.level));
    tokens.extend([s(">"), quote_path(spec.dst)]);
    tokens
}

/// Archives a glob such as `./*.apk` relative to `cwd`; the glob is left unquoted.
pub fn compress_in_dir_tokens(
    cwd: &Path,
    pattern: &str,
    dst: &Path,
    kind: CompressionKind,
    level: i32,
) -> Vec<String> {
    let mut tokens = vec![s("cd"), quote_path(cwd), s("&&"), s("tar"), s("-cpf"), s("-"), s(pattern)];
    tokens.extend(compressor_stage(kind, level));
    tokens.extend([s(">"), quote_path(dst)]);
    tokens
}

/// `tar -tf <src>` or `<decompressor> <src> | tar -tf -`, listing discarded.
pub fn test_tokens(src: &Path, kind: CompressionKind) -> Vec<String> {
    match kind.decompress_fragment() {
        None => vec![s("tar"), s("-tf"), quote_path(src), s(">"), s("/dev/null")],
        Some(fragment) => vec![
            s(fragment),
            quote_path(src),
            s("|"),
            s("tar"),
            s("-tf"),
            s("-"),
            s(">"),
            s("/dev/null"),
        ],
    }
}

/// `tar [excludes] [--recursive-unlink] -x[m]pf <src>|- -C <dst>`
pub fn decompress_tokens(spec: &ExtractSpec<'_>) -> Vec<String> {
    let mut tokens = Vec::new();
    let archive_arg = match spec.kind.decompress_fragment() {
        Some(fragment) => {
            tokens.extend([s(fragment), quote_path(spec.src), s("|")]);
            s("-")
        }
        None => quote_path(spec.src),
    };
    tokens.push(s("tar"));
    tokens.extend(exclude_flags(spec.exclusions));
    if spec.clean {
        tokens.push(s("--recursive-unlink"));
    }
    tokens.push(s(if spec.touch { "-xmpf" } else { "-xpf" }));
    tokens.extend([archive_arg, s("-C"), quote_path(spec.dst_dir)]);
    tokens
}

/// Executes archive pipelines through a [`CommandRunner`].
#[derive(Debug, Clone)]
pub struct ArchiveEngine {
    runner: Arc<dyn CommandRunner>,
}

impl ArchiveEngine {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    #[instrument(level = "debug", skip(self, spec, cancel), fields(dst = %spec.dst.display(), kind = %spec.kind))]
    pub async fn compress(&self, spec: &CompressSpec<'_>, cancel: Option<&CancellationToken>) -> ShellResult {
        self.runner.run(&compress_tokens(spec), cancel).await
    }

    #[instrument(level = "debug", skip(self, cancel), fields(kind = %kind))]
    pub async fn compress_in_dir(
        &self,
        cwd: &Path,
        pattern: &str,
        dst: &Path,
        kind: CompressionKind,
        level: i32,
        cancel: Option<&CancellationToken>,
    ) -> ShellResult {
        self.runner.run(&compress_in_dir_tokens(cwd, pattern, dst, kind, level), cancel).await
    }

    #[instrument(level = "debug", skip(self, cancel), fields(kind = %kind))]
    pub async fn test(&self, src: &Path, kind: CompressionKind, cancel: Option<&CancellationToken>) -> ShellResult {
        self.runner.run(&test_tokens(src, kind), cancel).await
    }

    #[instrument(level = "debug", skip(self, spec, cancel), fields(src = %spec.src.display(), kind = %spec.kind))]
    pub async fn decompress(&self, spec: &ExtractSpec<'_>, cancel: Option<&CancellationToken>) -> ShellResult {
        self.runner.run(&decompress_tokens(spec), cancel).await
    }

    /// Tests a freshly written archive and deletes it when broken, so a corrupt
    /// file is never mistaken for a restorable one.
    pub async fn verify_or_discard(
        &self,
        archive: &Path,
        kind: CompressionKind,
        cancel: Option<&CancellationToken>,
    ) -> ShellResult {
        let result = self.test(archive, kind, cancel).await;
        if result.is_success() {
            debug!(archive = %archive.display(), "Archive passed integrity test");
            return result;
        }
        warn!(archive = %archive.display(), exit_code = result.exit_code, "Archive failed integrity test, removing it");
        let mut result = result;
        match fs::remove_file(archive).await {
            Ok(()) => result.output_lines.push(format!("Removed broken archive {}", archive.display())),
            Err(e) => {
                warn!(error = &e as &dyn Error, "Failed to remove broken archive");
                result.output_lines.push(format!("Failed to remove broken archive: {e}"));
            }
        }
        info!(archive = %archive.display(), "Broken archive discarded");
        result
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use tempfile::tempdir;

    use super::*;
    use crate::shell::ShellExecutor;

    fn engine() -> ArchiveEngine {
        ArchiveEngine::new(Arc::new(ShellExecutor::system()))
    }

    fn zstd_available() -> bool {
        which::which("zstd").is_ok()
    }

    #[test]
    fn compress_tokens_keep_argument_order() {
        let exclusions = vec!["com.example.app/cache".to_string(), String::new(), "Backup_*".to_string()];
        let spec = CompressSpec {
            src_dir: Path::new("/data/user/0"),
            src: "com.example.app",
            dst: Path::new("/backup/user.tar.zst"),
            exclusions: &exclusions,
            follow_symlinks: true,
            kind: CompressionKind::Zstd,
            level: 1,
        };
        assert_eq!(
            compress_tokens(&spec).join(" "),
            "tar --exclude='com.example.app/cache' --exclude='Backup_*' -h -cpf - -C '/data/user/0' -- 'com.example.app' \
             | zstd -r -T0 --ultra -1 -q --priority=rt > '/backup/user.tar.zst'"
        );
    }

    #[test]
    fn plain_tar_has_no_pipe() {
        let spec = CompressSpec {
            src_dir: Path::new("/src"),
            src: "pkg",
            dst: Path::new("/dst/user.tar"),
            exclusions: &[],
            follow_symlinks: false,
            kind: CompressionKind::None,
            level: 1,
        };
        let tokens = compress_tokens(&spec);
        assert!(!tokens.contains(&"|".to_string()));
        assert_eq!(tokens.join(" "), "tar -cpf - -C '/src' -- 'pkg' > '/dst/user.tar'");

        let extract = ExtractSpec {
            src: Path::new("/dst/user.tar"),
            dst_dir: Path::new("/src"),
            exclusions: &[],
            clean: false,
            touch: false,
            kind: CompressionKind::None,
        };
        assert_eq!(decompress_tokens(&extract).join(" "), "tar -xpf '/dst/user.tar' -C '/src'");
        assert_eq!(test_tokens(Path::new("/a.tar"), CompressionKind::None).join(" "), "tar -tf '/a.tar' > /dev/null");
    }

    #[test]
    fn decompress_tokens_pipe_through_decompressor() {
        let exclusions = vec!["pkg/cache".to_string()];
        let spec = ExtractSpec {
            src: Path::new("/b/data.tar.lz4"),
            dst_dir: Path::new("/data/media/0/Android/data"),
            exclusions: &exclusions,
            clean: true,
            touch: true,
            kind: CompressionKind::Lz4,
        };
        assert_eq!(
            decompress_tokens(&spec).join(" "),
            "zstd -d -c '/b/data.tar.lz4' | tar --exclude='pkg/cache' --recursive-unlink -xmpf - -C '/data/media/0/Android/data'"
        );
        assert_eq!(
            test_tokens(Path::new("/b/data.tar.lz4"), CompressionKind::Lz4).join(" "),
            "zstd -d -c '/b/data.tar.lz4' | tar -tf - > /dev/null"
        );
    }

    async fn round_trip(kind: CompressionKind) {
        let dir = tempdir().unwrap();
        let origin = dir.path().join("origin");
        let package = origin.join("com.example.app");
        std::fs::create_dir_all(package.join("files")).unwrap();
        std::fs::create_dir_all(package.join("cache")).unwrap();
        std::fs::write(package.join("files/note.txt"), b"hello archive").unwrap();
        std::fs::write(package.join("cache/tmp.bin"), b"throwaway").unwrap();

        let dst: PathBuf = dir.path().join(format!("user.{}", kind.suffix()));
        let exclusions = vec!["com.example.app/cache".to_string()];
        let engine = engine();
        let result = engine
            .compress(
                &CompressSpec {
                    src_dir: &origin,
                    src: "com.example.app",
                    dst: &dst,
                    exclusions: &exclusions,
                    follow_symlinks: false,
                    kind,
                    level: 3,
                },
                None,
            )
            .await;
        assert!(result.is_success(), "compress failed: {result:?}");
        assert!(engine.verify_or_discard(&dst, kind, None).await.is_success());

        let restored = dir.path().join("restored");
        std::fs::create_dir_all(&restored).unwrap();
        let result = engine
            .decompress(
                &ExtractSpec { src: &dst, dst_dir: &restored, exclusions: &[], clean: false, touch: true, kind },
                None,
            )
            .await;
        assert!(result.is_success(), "decompress failed: {result:?}");
        let content = std::fs::read(restored.join("com.example.app/files/note.txt")).unwrap();
        assert_eq!(content, b"hello archive");
        assert!(!restored.join("com.example.app/cache").exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn plain_tar_round_trip() {
        round_trip(CompressionKind::None).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn zstd_and_lz4_round_trip() {
        if !zstd_available() {
            eprintln!("zstd not installed, skipping");
            return;
        }
        round_trip(CompressionKind::Zstd).await;
        // zstd builds without lz4 support reject --format=lz4
        let probe = ShellExecutor::system()
            .run(&["zstd".into(), "-H".into(), "|".into(), "grep".into(), "-q".into(), "lz4".into()], None)
            .await;
        if probe.is_success() {
            round_trip(CompressionKind::Lz4).await;
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn broken_archive_is_discarded() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("data.tar");
        std::fs::write(&archive, b"definitely not a tar archive, just some bytes").unwrap();
        let result = engine().verify_or_discard(&archive, CompressionKind::None, None).await;
        assert!(!result.is_success());
        assert!(!archive.exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn archives_globs_relative_to_working_directory() {
        let dir = tempdir().unwrap();
        let apk_dir = dir.path().join("com.example.app-1");
        std::fs::create_dir_all(apk_dir.join("lib")).unwrap();
        std::fs::write(apk_dir.join("base.apk"), b"apk").unwrap();
        std::fs::write(apk_dir.join("split_config.en.apk"), b"split").unwrap();
        std::fs::write(apk_dir.join("lib/libfoo.so"), b"lib").unwrap();

        let dst = dir.path().join("apk.tar");
        let engine = engine();
        let result = engine.compress_in_dir(&apk_dir, "./*.apk", &dst, CompressionKind::None, 1, None).await;
        assert!(result.is_success(), "{result:?}");

        let listing = ShellExecutor::system().run(&["tar".into(), "-tf".into(), quote_path(&dst)], None).await;
        let mut entries = listing.output_lines.clone();
        entries.sort();
        assert_eq!(entries, vec!["./base.apk".to_string(), "./split_config.en.apk".to_string()]);
    }
}
