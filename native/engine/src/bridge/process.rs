//! Channel to a helper process speaking the JSON-lines protocol on stdin/stdout.

use std::{
    error::Error,
    process::Stdio,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    process::{Child, ChildStdin, ChildStdout, Command},
    sync::Mutex,
    time::timeout,
};
use tracing::{debug, info, instrument, warn};

use super::{
    BridgeError,
    channel::{Connector, RootChannel},
    protocol::{Reply, Request, RequestEnvelope, ResponseEnvelope},
};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug)]
struct ChannelIo {
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

#[derive(Debug)]
pub struct ProcessChannel {
    child: Mutex<Child>,
    io: Mutex<ChannelIo>,
    next_id: AtomicU64,
    alive: AtomicBool,
    pid: Option<u32>,
}

impl ProcessChannel {
    /// Starts the helper and waits for it to answer a ping.
    #[instrument(level = "debug", err)]
    pub async fn spawn(launcher: &[String]) -> Result<Self, BridgeError> {
        let (program, args) =
            launcher.split_first().ok_or_else(|| BridgeError::Spawn("empty launcher".into()))?;
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BridgeError::Spawn(format!("{program}: {e}")))?;

        let stdin = child.stdin.take().ok_or_else(|| BridgeError::Spawn("no stdin".into()))?;
        let stdout = child.stdout.take().ok_or_else(|| BridgeError::Spawn("no stdout".into()))?;
        let pid = child.id();
        let channel = Self {
            child: Mutex::new(child),
            io: Mutex::new(ChannelIo { stdin, stdout: BufReader::new(stdout).lines() }),
            next_id: AtomicU64::new(1),
            alive: AtomicBool::new(true),
            pid,
        };

        match channel.call(Request::Ping).await {
            Ok(Reply::Unit) => {
                info!(pid, "Privileged helper connected");
                Ok(channel)
            }
            Ok(_) => Err(BridgeError::UnexpectedReply { op: "ping" }),
            Err(e) => Err(BridgeError::Spawn(format!("helper did not answer: {e}"))),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn mark_dead(&self, reason: &str) -> BridgeError {
        if self.alive.swap(false, Ordering::SeqCst) {
            warn!(pid = self.pid, reason, "Privileged channel died");
        }
        BridgeError::ChannelClosed(reason.to_string())
    }
}

#[async_trait]
impl RootChannel for ProcessChannel {
    async fn call(&self, request: Request) -> Result<Reply, BridgeError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(BridgeError::ChannelClosed("helper exited".into()));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let op = request.name();
        let mut line = serde_json::to_string(&RequestEnvelope { id, request })
            .map_err(|e| BridgeError::Protocol(e.to_string()))?;
        line.push('\n');

        let mut io = self.io.lock().await;
        if let Err(e) = io.stdin.write_all(line.as_bytes()).await {
            return Err(self.mark_dead(&format!("write failed: {e}")));
        }
        if let Err(e) = io.stdin.flush().await {
            return Err(self.mark_dead(&format!("flush failed: {e}")));
        }

        loop {
            let line = match io.stdout.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return Err(self.mark_dead("end of stream")),
                Err(e) => return Err(self.mark_dead(&format!("read failed: {e}"))),
            };
            let response: ResponseEnvelope = match serde_json::from_str(&line) {
                Ok(response) => response,
                Err(e) => {
                    warn!(line, error = &e as &dyn Error, "Ignoring malformed helper output");
                    continue;
                }
            };
            if response.id != id {
                debug!(expected = id, got = response.id, "Ignoring stale helper response");
                continue;
            }
            return response.result.map_err(BridgeError::Remote).inspect_err(|e| {
                debug!(op, error = e as &dyn Error, "Privileged request failed");
            });
        }
    }

    fn is_alive(&self) -> bool {
        if !self.alive.load(Ordering::SeqCst) {
            return false;
        }
        // A busy child lock means a call or shutdown is in flight; treat it as alive.
        let Ok(mut child) = self.child.try_lock() else { return true };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                drop(child);
                self.mark_dead(&format!("helper exited with {status}"));
                false
            }
            Err(e) => {
                drop(child);
                self.mark_dead(&format!("failed to poll helper: {e}"));
                false
            }
        }
    }

    async fn shutdown(&self, kill_daemon: bool) {
        if kill_daemon && self.alive.load(Ordering::SeqCst) {
            match timeout(SHUTDOWN_TIMEOUT, self.call(Request::Shutdown)).await {
                Ok(Ok(_)) => debug!(pid = self.pid, "Helper acknowledged shutdown"),
                Ok(Err(e)) => debug!(error = &e as &dyn Error, "Helper shutdown request failed"),
                Err(_) => debug!("Helper shutdown request timed out"),
            }
        }
        self.alive.store(false, Ordering::SeqCst);
        let mut child = self.child.lock().await;
        if kill_daemon {
            if let Err(e) = child.kill().await {
                debug!(error = &e as &dyn Error, "Failed to kill helper");
            }
        } else {
            // Closing stdin lets the helper finish on its own.
            let mut io = self.io.lock().await;
            let _ = io.stdin.shutdown().await;
        }
        info!(pid = self.pid, kill_daemon, "Privileged channel released");
    }
}

/// Launches the helper through an argument vector such as `su -c rootd`.
#[derive(Debug, Clone)]
pub struct ProcessConnector {
    launcher: Vec<String>,
}

impl ProcessConnector {
    pub fn new(launcher: Vec<String>) -> Self {
        Self { launcher }
    }
}

#[async_trait]
impl Connector for ProcessConnector {
    async fn connect(&self) -> Result<Arc<dyn RootChannel>, BridgeError> {
        let channel = ProcessChannel::spawn(&self.launcher).await?;
        Ok(Arc::new(channel))
    }
}
