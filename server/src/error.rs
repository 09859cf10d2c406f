//! Error types surfaced to callers of the bridge server.

use shared::ProtocolError;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to build network runtime: {0}")]
    Runtime(#[source] std::io::Error),

    #[error("failed to spawn network thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("no client connected")]
    NotConnected,

    #[error("write failed: {0}")]
    Write(#[source] std::io::Error),

    #[error("write timed out")]
    WriteTimeout,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
