//! Privileged helper. Started as root by the engine, it answers bridge
//! requests on stdin/stdout; logs go to stderr.
//!
//! Usage: `rootd [device-root]`, where the device root defaults to `/`.

use anyhow::Result;
use backup_engine::{
    bridge::{local::LocalChannel, server::serve},
    logging::setup_stderr_logging,
    paths::DeviceLayout,
    shell::ShellExecutor,
};
use mimalloc::MiMalloc;
use tokio::io::BufReader;
use tracing::info;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    if let Err(e) = setup_stderr_logging() {
        eprintln!("Failed to setup logging: {e:#}");
    }
    let device_root = std::env::args().nth(1).unwrap_or_else(|| "/".to_string());
    info!(pid = std::process::id(), device_root, "Privileged helper started");

    let channel = LocalChannel::new(ShellExecutor::system(), DeviceLayout::new(device_root));
    serve(BufReader::new(tokio::io::stdin()), tokio::io::stdout(), &channel).await?;
    info!("Privileged helper exiting");
    Ok(())
}
