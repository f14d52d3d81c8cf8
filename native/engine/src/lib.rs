//! Backup and restore engine for app data.
//!
//! [`Engine::start`] wires the settings, the operation record store, the
//! privileged session and the run scheduler together; everything else is
//! reachable from there.

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use derive_more::Debug;
use tokio_stream::wrappers::WatchStream;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;

use bridge::{BridgeFailure, RootSession, process::ProcessConnector};
use paths::BackupLayout;
use pipeline::OperationManager;
use records::RecordStore;
use settings::SettingsHandler;
use shell::{CommandRunner, ShellExecutor};

pub mod archive;
pub mod bridge;
pub mod logging;
pub mod models;
pub mod paths;
pub mod pipeline;
pub mod records;
pub mod remote;
pub mod settings;
pub mod shell;
pub mod utils;

#[cfg(test)]
mod testing;

const REQUIRED_TOOLS: [&str; 2] = ["tar", "zstd"];

#[derive(Debug)]
pub struct Engine {
    settings: Arc<SettingsHandler>,
    bridge: Arc<RootSession>,
    store: Arc<RecordStore>,
    manager: Arc<OperationManager>,
    #[debug(skip)]
    _log_guard: Option<WorkerGuard>,
}

impl Engine {
    /// Loads settings from `app_dir` and starts every component.
    pub async fn start(app_dir: PathBuf) -> Result<Self> {
        install_panic_hook();

        let settings = SettingsHandler::new(app_dir);
        let current = settings.current();

        let log_dir = BackupLayout::new(&current.backup_root).log_dir();
        let log_guard = match logging::setup_logging(&log_dir, utils::now_millis()) {
            Ok(guard) => Some(guard),
            Err(e) => {
                eprintln!("Failed to setup logging: {e:#}");
                None
            }
        };
        info!(version = env!("CARGO_PKG_VERSION"), "Starting backup engine");

        let tool_dirs: Vec<PathBuf> = current.tool_dirs.iter().map(PathBuf::from).collect();
        for tool in REQUIRED_TOOLS {
            if let Err(e) = utils::resolve_binary_path(&tool_dirs, tool) {
                warn!(tool, error = %e, "Tool not found locally, relying on the root shell PATH");
            }
        }
        let runner: Arc<dyn CommandRunner> =
            Arc::new(ShellExecutor::new(current.shell_launcher.clone()).with_tool_dirs(tool_dirs));

        let bridge =
            Arc::new(RootSession::new(Arc::new(ProcessConnector::new(current.helper_launcher.clone()))));
        bridge.set_failure_callback(Arc::new(|failure: &BridgeFailure| {
            error!(operation = failure.operation, error = %failure.error, "Privileged call failed");
        }));

        let store =
            Arc::new(RecordStore::open(&current.data_dir).await.context("Failed to open record store")?);
        for (timestamp, record) in store.unfinished() {
            warn!(timestamp, name = %record.name, "Found record left unfinished by an earlier process");
        }

        let manager = OperationManager::new(bridge.clone(), runner, store.clone(), current);
        manager.watch_settings(WatchStream::new(settings.subscribe()));

        Ok(Self { settings, bridge, store, manager, _log_guard: log_guard })
    }

    pub fn settings(&self) -> &Arc<SettingsHandler> {
        &self.settings
    }

    pub fn bridge(&self) -> &Arc<RootSession> {
        &self.bridge
    }

    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    pub fn manager(&self) -> &Arc<OperationManager> {
        &self.manager
    }

    /// Stops the privileged helper.
    pub async fn shutdown(&self) {
        info!("Shutting down backup engine");
        self.bridge.destroy(true).await;
    }
}

fn install_panic_hook() {
    let original_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::force_capture();
        let message = format!("{panic_info}\n{backtrace}");
        error!(message, "Rust panic");
        original_hook(panic_info);
    }));
}
