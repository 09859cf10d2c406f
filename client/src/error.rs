use shared::ProtocolError;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("not connected to the bridge server")]
    NotConnected,

    #[error("timed out waiting for the bridge server")]
    Timeout,

    #[error("connection closed by the bridge server")]
    Closed,
}
