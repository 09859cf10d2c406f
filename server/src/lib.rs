//! # Gaze Bridge Server Library
//!
//! This library provides the host side of the gaze bridge: a small TCP server
//! that lets a game host exchange typed messages with one external controller
//! application. The controller sends start signals, subtitles and selection
//! confirmations; the host answers with acknowledgements, game commands and
//! gaze coordinates.
//!
//! ## Core Responsibilities
//!
//! ### Framing
//! Every message travels as a length-prefixed JSON envelope (see
//! [`shared::codec`]). Frames are reassembled from arbitrary TCP segmentation
//! and malformed prefixes are skipped without dropping the connection.
//!
//! ### Background Receive
//! A dedicated network thread accepts the controller, reads frames as they
//! arrive and hands complete messages to an inbound queue. It never runs host
//! code.
//!
//! ### Host-Driven Dispatch
//! The host calls [`BridgeServer::drain`] from its own loop, typically once
//! per frame. Queued messages are routed by type to the callbacks registered
//! with [`BridgeServer::subscribe`], on the calling thread.
//!
//! ### Outbound Messages
//! [`BridgeServer::send`] and its typed helpers may be called from any
//! thread. Each frame is written whole, so concurrent senders never produce
//! interleaved bytes on the wire.
//!
//! ## Architecture Design
//!
//! ### One Client at a Time
//! The server serves a single controller. While it is connected, further
//! connection attempts wait in the listen backlog until it leaves.
//!
//! ### Restartable Lifecycle
//! [`BridgeServer::start`] and [`BridgeServer::stop`] are both idempotent.
//! Stopping joins the network thread and closes every socket, after which the
//! server can be started again on the same port.
//!
//! ## Module Organization
//!
//! ### Config Module (`config`)
//! Port, write timeout and read tuning.
//!
//! ### Connection Module (`connection`)
//! The active connection slot, the receive loop and the writer task.
//!
//! ### Dispatcher Module (`dispatcher`)
//! Type-keyed subscriber registry and the drain operation.
//!
//! ### Network Module (`network`)
//! [`BridgeServer`] itself: listener lifecycle, accept loop and send path.
//!
//! ### Queue Module (`queue`)
//! Single-producer, single-consumer hand-off between the network thread and
//! the dispatcher.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::{BridgeServer, ServerConfig};
//! use shared::{InboundKind, START_SIGNAL_ACK};
//! use std::sync::Arc;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Arc::new(BridgeServer::new(ServerConfig::default()));
//!     server.start()?;
//!
//!     let _subtitles = server.subscribe(InboundKind::Subtitle, |text| {
//!         println!("Subtitle: {}", text);
//!     });
//!
//!     // Call from the host's frame loop.
//!     server.drain();
//!     server.send_ack(START_SIGNAL_ACK)?;
//!
//!     server.stop();
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod network;
pub mod queue;

pub use config::ServerConfig;
pub use connection::ConnectionState;
pub use dispatcher::{Dispatcher, DrainReport, Subscription};
pub use error::BridgeError;
pub use network::BridgeServer;
