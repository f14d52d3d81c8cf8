//! Runs external command lines and captures their result.
//!
//! Commands are expressed as token lists. Pipe and redirection operators are
//! plain tokens too, so every token that is a path must already be quoted with
//! [`quote`] or [`quote_path`].

use std::{
    fmt,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    time::Instant,
};

use async_trait::async_trait;
use nix::{sys::signal::Signal, unistd::Pid};
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Command,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

pub mod pm;
pub mod selinux;

/// Generic failure produced without running a process.
pub const EXIT_GENERIC_FAILURE: i32 = -1;
/// The requested data does not exist; callers map this to a skip.
pub const EXIT_NOT_PRESENT: i32 = -2;
/// The command was killed because its run was cancelled.
pub const EXIT_CANCELLED: i32 = -3;

const PIPEFAIL_PRELUDE: &str = "(set -o pipefail) 2>/dev/null && set -o pipefail;";

/// Outcome of one external command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellResult {
    pub exit_code: i32,
    pub input_tokens: Vec<String>,
    pub output_lines: Vec<String>,
}

impl ShellResult {
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn output(&self) -> String {
        self.output_lines.join("\n")
    }

    /// Result of a step performed in-process rather than by a command.
    pub fn synthetic(exit_code: i32, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            exit_code,
            input_tokens: Vec::new(),
            output_lines: if message.is_empty() { Vec::new() } else { vec![message] },
        }
    }

    pub fn ok(message: impl Into<String>) -> Self {
        Self::synthetic(0, message)
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self::synthetic(EXIT_GENERIC_FAILURE, message)
    }

    pub fn not_present(message: impl Into<String>) -> Self {
        Self::synthetic(EXIT_NOT_PRESENT, message)
    }

    pub fn cancelled(input_tokens: Vec<String>) -> Self {
        Self { exit_code: EXIT_CANCELLED, input_tokens, output_lines: vec!["Cancelled".into()] }
    }

    /// Folds another result into this one: output is appended and the first failure wins.
    pub fn merge(&mut self, other: ShellResult) {
        if self.is_success() && !other.is_success() {
            self.exit_code = other.exit_code;
        }
        if !other.input_tokens.is_empty() {
            self.output_lines.push(format!("$ {}", other.input_tokens.join(" ")));
        }
        self.output_lines.extend(other.output_lines);
    }
}

/// Single-quotes a shell word.
pub fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

pub fn quote_path(path: &Path) -> String {
    quote(&path.to_string_lossy())
}

/// Something that can execute a token list.
#[async_trait]
pub trait CommandRunner: Send + Sync + fmt::Debug {
    /// Runs the command, killing it when `cancel` fires. Never fails: spawn errors and
    /// cancellation are reported through the exit code.
    async fn run(&self, tokens: &[String], cancel: Option<&CancellationToken>) -> ShellResult;
}

/// Runs command lines through a launcher such as `su -c` or `sh -c`.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    launcher: Vec<String>,
    tool_dirs: Vec<PathBuf>,
}

impl ShellExecutor {
    pub fn new(launcher: Vec<String>) -> Self {
        Self { launcher, tool_dirs: Vec::new() }
    }

    /// Executor running scripts with the unprivileged system shell.
    pub fn system() -> Self {
        Self::new(vec!["sh".to_string(), "-c".to_string()])
    }

    pub fn with_tool_dirs(mut self, dirs: impl IntoIterator<Item = PathBuf>) -> Self {
        self.tool_dirs.extend(dirs);
        self
    }

    /// Drops empty tokens and joins the rest into one command line.
    pub fn command_line(tokens: &[String]) -> (Vec<String>, String) {
        let tokens: Vec<String> = tokens.iter().filter(|t| !t.is_empty()).cloned().collect();
        let line = tokens.join(" ");
        (tokens, line)
    }

    fn script(line: &str) -> String {
        format!("{PIPEFAIL_PRELUDE} {{ {line} ; }} 2>&1")
    }

    fn command(&self, script: String) -> Option<Command> {
        let (program, args) = self.launcher.split_first()?;
        let mut command = Command::new(program);
        command.args(args).arg(script);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        if !self.tool_dirs.is_empty() {
            let mut paths: Vec<PathBuf> = self.tool_dirs.clone();
            if let Some(current) = std::env::var_os("PATH") {
                paths.extend(std::env::split_paths(&current));
            }
            match std::env::join_paths(paths) {
                Ok(joined) => {
                    command.env("PATH", joined);
                }
                Err(e) => warn!(error = &e as &dyn std::error::Error, "Invalid tool directory"),
            }
        }
        Some(command)
    }
}

async fn read_lines<R: AsyncRead + Unpin>(reader: Option<R>) -> Vec<String> {
    let mut collected = Vec::new();
    let Some(reader) = reader else { return collected };
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => collected.push(line),
            Ok(None) => break,
            Err(e) => {
                debug!(error = &e as &dyn std::error::Error, "Stopped reading command output");
                break;
            }
        }
    }
    collected
}

fn kill_process_group(pid: Option<u32>) {
    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else { return };
    if let Err(e) = nix::sys::signal::killpg(Pid::from_raw(pid), Signal::SIGKILL) {
        debug!(pid, error = &e as &dyn std::error::Error, "Failed to kill process group");
    }
}

#[async_trait]
impl CommandRunner for ShellExecutor {
    #[instrument(level = "debug", skip(self, tokens, cancel))]
    async fn run(&self, tokens: &[String], cancel: Option<&CancellationToken>) -> ShellResult {
        let (tokens, line) = Self::command_line(tokens);
        if tokens.is_empty() {
            return ShellResult::failure("Empty command");
        }
        if cancel.is_some_and(|c| c.is_cancelled()) {
            return ShellResult::cancelled(tokens);
        }

        let Some(mut command) = self.command(Self::script(&line)) else {
            return ShellResult {
                exit_code: EXIT_GENERIC_FAILURE,
                input_tokens: tokens,
                output_lines: vec!["Shell launcher is not configured".into()],
            };
        };
        debug!(command = %line, "Running shell command");
        let started = Instant::now();

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(error = &e as &dyn std::error::Error, launcher = ?self.launcher, "Failed to spawn shell");
                return ShellResult {
                    exit_code: EXIT_GENERIC_FAILURE,
                    input_tokens: tokens,
                    output_lines: vec![format!("Failed to spawn {:?}: {e}", self.launcher)],
                };
            }
        };
        let pid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let finished = async {
            let (stdout, stderr, status) =
                tokio::join!(read_lines(stdout), read_lines(stderr), child.wait());
            (stdout, stderr, status)
        };

        let (stdout, stderr, status): (Vec<String>, Vec<String>, std::io::Result<ExitStatus>) =
            match cancel {
                Some(token) => tokio::select! {
                    out = finished => out,
                    _ = token.cancelled() => {
                        warn!(command = %line, "Shell command cancelled, killing it");
                        kill_process_group(pid);
                        let _ = child.kill().await;
                        return ShellResult::cancelled(tokens);
                    }
                },
                None => finished.await,
            };

        let exit_code = match status {
            Ok(status) => status.code().unwrap_or(EXIT_GENERIC_FAILURE),
            Err(e) => {
                warn!(error = &e as &dyn std::error::Error, "Failed to wait for shell");
                EXIT_GENERIC_FAILURE
            }
        };
        let mut output_lines = stdout;
        output_lines.extend(stderr);

        debug!(
            command = %line,
            exit_code,
            duration_ms = started.elapsed().as_millis(),
            "Shell command finished"
        );
        trace!(output = ?output_lines, "Shell command output");
        ShellResult { exit_code, input_tokens: tokens, output_lines }
    }
}

/// Converts a path list into the `PATH`-style directories of an executor.
pub fn tool_dirs(dirs: &[String]) -> Vec<PathBuf> {
    dirs.iter().filter(|d| !d.is_empty()).map(PathBuf::from).collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn tokens(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn filters_empty_tokens_and_captures_output() {
        let shell = ShellExecutor::system();
        let result = shell.run(&tokens(&["echo", "", "hello", "", "world"]), None).await;
        assert!(result.is_success());
        assert_eq!(result.input_tokens, tokens(&["echo", "hello", "world"]));
        assert_eq!(result.output_lines, vec!["hello world".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn returns_output_on_failure_too() {
        let shell = ShellExecutor::system();
        let result = shell.run(&tokens(&["echo", "oops", ";", "exit", "3"]), None).await;
        assert_eq!(result.exit_code, 3);
        assert!(!result.is_success());
        assert_eq!(result.output(), "oops");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn merges_stderr_into_output() {
        let shell = ShellExecutor::system();
        let result = shell.run(&tokens(&["echo", "err", ">&2"]), None).await;
        assert!(result.is_success());
        assert_eq!(result.output_lines, vec!["err".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pipes_and_quotes_are_literal_tokens() {
        let shell = ShellExecutor::system();
        let quoted = quote("it's here");
        let command = [String::from("printf"), quoted, "|".into(), "wc".into(), "-c".into()];
        let result = shell.run(&command, None).await;
        assert!(result.is_success());
        assert_eq!(result.output().trim(), "9");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancellation_kills_the_command() {
        let shell = ShellExecutor::system();
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            canceller.cancel();
        });
        let started = Instant::now();
        let result = shell.run(&tokens(&["sleep", "30", "|", "cat"]), Some(&token)).await;
        assert_eq!(result.exit_code, EXIT_CANCELLED);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn missing_launcher_is_a_failure_result() {
        let shell = ShellExecutor::new(vec!["/nonexistent/launcher".into()]);
        let result = shell.run(&tokens(&["true"]), None).await;
        assert_eq!(result.exit_code, EXIT_GENERIC_FAILURE);
        assert!(result.output().contains("Failed to spawn"));
    }

    #[test]
    fn quote_escapes_single_quotes() {
        assert_eq!(quote("a'b"), r"'a'\''b'");
        assert_eq!(quote_path(Path::new("/data/user/0")), "'/data/user/0'");
    }

    #[test]
    fn merge_keeps_first_failure() {
        let mut result = ShellResult::ok("one");
        result.merge(ShellResult::failure("two"));
        result.merge(ShellResult {
            exit_code: 5,
            input_tokens: vec!["x".into()],
            output_lines: vec![],
        });
        assert_eq!(result.exit_code, EXIT_GENERIC_FAILURE);
        assert_eq!(result.output_lines, vec!["one", "two", "$ x"]);
    }
}
