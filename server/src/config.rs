use shared::DEFAULT_PORT;
use std::time::Duration;

/// Runtime settings for [`BridgeServer`](crate::network::BridgeServer).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP port bound on all interfaces. `0` picks an ephemeral port.
    pub port: u16,
    /// Upper bound on writing one frame to the client.
    pub write_timeout: Duration,
    /// Size of each socket read on the network thread.
    pub read_chunk_size: usize,
    /// Pause after a failed accept before trying again.
    pub accept_retry_delay: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            write_timeout: Duration::from_secs(5),
            read_chunk_size: 4096,
            accept_retry_delay: Duration::from_millis(100),
        }
    }
}

impl ServerConfig {
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }
}
