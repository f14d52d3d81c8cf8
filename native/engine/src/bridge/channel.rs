use std::{fmt, sync::Arc};

use async_trait::async_trait;

use super::{
    BridgeError,
    protocol::{Reply, Request},
};

/// An established connection to something that executes privileged requests.
#[async_trait]
pub trait RootChannel: Send + Sync + fmt::Debug {
    async fn call(&self, request: Request) -> Result<Reply, BridgeError>;

    /// `false` once the peer is known to be gone.
    fn is_alive(&self) -> bool;

    /// Releases the channel. With `kill_daemon` the helper process is terminated too.
    async fn shutdown(&self, kill_daemon: bool);
}

/// Creates new channels for [`super::RootSession`].
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    async fn connect(&self) -> Result<Arc<dyn RootChannel>, BridgeError>;
}
