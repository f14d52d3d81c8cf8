use thiserror::Error;

/// Failure of a privileged call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    #[error("privileged helper is not connected")]
    Disconnected,
    #[error("privileged channel closed: {0}")]
    ChannelClosed(String),
    #[error("failed to launch privileged helper: {0}")]
    Spawn(String),
    #[error("malformed message on privileged channel: {0}")]
    Protocol(String),
    #[error("privileged operation failed: {0}")]
    Remote(String),
    #[error("unexpected reply to {op}")]
    UnexpectedReply { op: &'static str },
}

impl BridgeError {
    /// Whether the channel that produced this error must be replaced.
    pub fn is_channel_failure(&self) -> bool {
        matches!(self, BridgeError::Disconnected | BridgeError::ChannelClosed(_))
    }
}
