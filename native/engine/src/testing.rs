//! Test doubles for the privileged channel and the root shell.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{
    bridge::{BridgeError, Connector, Reply, Request, RootChannel, local::LocalChannel},
    models::RuntimePermission,
    paths::DeviceLayout,
    shell::{CommandRunner, ShellExecutor, ShellResult},
};

#[derive(Debug, Clone)]
pub(crate) struct FakePackage {
    pub uid: i64,
    pub source_dir: PathBuf,
    pub permissions: Vec<RuntimePermission>,
}

/// Serves filesystem requests from the real filesystem and package manager
/// requests from an in-memory package table.
#[derive(Debug)]
pub(crate) struct TestChannel {
    local: LocalChannel,
    pub packages: Mutex<HashMap<String, FakePackage>>,
    /// Package that shows up once `install_packages` is called.
    pub install_target: Mutex<Option<(String, FakePackage)>>,
    pub installs: Mutex<Vec<Vec<String>>>,
    pub permission_changes: Mutex<Vec<(String, bool)>>,
    pub ssaids: Mutex<HashMap<String, String>>,
}

impl TestChannel {
    pub fn new(device_root: &Path) -> Arc<Self> {
        Arc::new(Self {
            local: LocalChannel::new(ShellExecutor::system(), DeviceLayout::new(device_root)),
            packages: Mutex::new(HashMap::new()),
            install_target: Mutex::new(None),
            installs: Mutex::new(Vec::new()),
            permission_changes: Mutex::new(Vec::new()),
            ssaids: Mutex::new(HashMap::new()),
        })
    }

    fn package(&self, name: &str) -> Option<FakePackage> {
        self.packages.lock().unwrap().get(name).cloned()
    }
}

#[async_trait]
impl RootChannel for TestChannel {
    async fn call(&self, request: Request) -> Result<Reply, BridgeError> {
        Ok(match request {
            Request::PackageUid { package, .. } => Reply::Int(self.package(&package).map_or(-1, |p| p.uid)),
            Request::PackageSourceDir { package, .. } => Reply::Text(
                self.package(&package).map(|p| p.source_dir.to_string_lossy().to_string()).unwrap_or_default(),
            ),
            Request::QueryInstalled { package, .. } => Reply::Bool(self.package(&package).is_some()),
            Request::ListRuntimePermissions { package, .. } => {
                Reply::Permissions(self.package(&package).map(|p| p.permissions).unwrap_or_default())
            }
            Request::GrantPermission { permission, .. } => {
                self.permission_changes.lock().unwrap().push((permission, true));
                Reply::Bool(true)
            }
            Request::RevokePermission { permission, .. } => {
                self.permission_changes.lock().unwrap().push((permission, false));
                Reply::Bool(true)
            }
            Request::GetDeviceScopedId { package, .. } => {
                Reply::OptionalText(self.ssaids.lock().unwrap().get(&package).cloned())
            }
            Request::SetDeviceScopedId { package, value, .. } => {
                self.ssaids.lock().unwrap().insert(package, value);
                Reply::Bool(true)
            }
            Request::InstallPackages { apks, .. } => {
                self.installs.lock().unwrap().push(apks);
                if let Some((name, package)) = self.install_target.lock().unwrap().take() {
                    self.packages.lock().unwrap().insert(name, package);
                }
                Reply::Shell(ShellResult::ok("Success"))
            }
            Request::SdkInt => Reply::Int(34),
            other => return self.local.call(other).await,
        })
    }

    fn is_alive(&self) -> bool {
        true
    }

    async fn shutdown(&self, _kill_daemon: bool) {}
}

#[derive(Debug)]
pub(crate) struct TestConnector(pub Arc<TestChannel>);

#[async_trait]
impl Connector for TestConnector {
    async fn connect(&self) -> Result<Arc<dyn RootChannel>, BridgeError> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Clone)]
enum Rule {
    Reply(i32, Vec<String>),
    /// Runs another command instead, through the real shell.
    Substitute(Vec<String>),
}

/// Runs commands through `sh`, except those matching a registered needle.
#[derive(Debug)]
pub(crate) struct ScriptedRunner {
    inner: ShellExecutor,
    rules: Mutex<Vec<(String, Rule)>>,
    pub commands: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    /// Ownership and label commands succeed without touching anything.
    pub fn new() -> Arc<Self> {
        let runner = Arc::new(Self {
            inner: ShellExecutor::system(),
            rules: Mutex::new(Vec::new()),
            commands: Mutex::new(Vec::new()),
        });
        runner.reply("am force-stop", 0, &[]);
        runner.reply("chown -hR", 0, &[]);
        runner.reply("chcon -hR", 0, &[]);
        runner.reply("ls -Zd", 0, &["u:object_r:app_data_file:s0:c512,c768"]);
        runner
    }

    /// Answers commands containing `needle`; later rules win.
    pub fn reply(&self, needle: &str, exit_code: i32, output: &[&str]) {
        let output = output.iter().map(|l| l.to_string()).collect();
        self.rules.lock().unwrap().insert(0, (needle.to_string(), Rule::Reply(exit_code, output)));
    }

    pub fn substitute(&self, needle: &str, command: &str) {
        let tokens = command.split_whitespace().map(str::to_string).collect();
        self.rules.lock().unwrap().insert(0, (needle.to_string(), Rule::Substitute(tokens)));
    }

    pub fn ran(&self, needle: &str) -> bool {
        self.commands.lock().unwrap().iter().any(|c| c.contains(needle))
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, tokens: &[String], cancel: Option<&CancellationToken>) -> ShellResult {
        let line = tokens.join(" ");
        self.commands.lock().unwrap().push(line.clone());
        let rule = self.rules.lock().unwrap().iter().find(|(needle, _)| line.contains(needle)).map(|(_, r)| r.clone());
        match rule {
            Some(Rule::Reply(exit_code, output_lines)) => {
                ShellResult { exit_code, input_tokens: tokens.to_vec(), output_lines }
            }
            Some(Rule::Substitute(command)) => self.inner.run(&command, cancel).await,
            None => self.inner.run(tokens, cancel).await,
        }
    }
}
