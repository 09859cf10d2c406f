//! # Gaze Bridge Controller Library
//!
//! This library provides the controller side of the gaze bridge: the
//! application that connects to a game host's bridge server, drives the
//! session with start signals, subtitles and selection confirmations, and
//! receives acknowledgements, game commands and gaze coordinates in return.
//!
//! ## Module Organization
//!
//! ### Network Module (`network`)
//! [`ControllerClient`] and the decoded [`ControllerEvent`] stream:
//! - Connection establishment with optional retry
//! - Whole-frame sends that are safe to issue from several tasks
//! - Background frame decoding with malformed input skipped
//! - The start-signal handshake
//! - A supervised `run` loop that redials after the server goes away
//!
//! ### Error Module (`error`)
//! [`ClientError`], returned by every fallible operation.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::{ControllerClient, ControllerEvent};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut controller = ControllerClient::connect_with_retry(
//!         "127.0.0.1:9998",
//!         Duration::from_secs(5),
//!         None,
//!     )
//!     .await?;
//!
//!     controller.handshake(Duration::from_secs(5)).await?;
//!     controller.send_subtitle("Please pick a target with your eyes.").await?;
//!
//!     while let Some(event) = controller.next_event().await {
//!         if let ControllerEvent::Gaze(point) = event {
//!             println!("Gaze at ({}, {})", point.x, point.y);
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Connection Behaviour
//!
//! The bridge server serves one controller at a time. A second controller
//! connecting while the first is active is accepted by the operating system
//! but not served until the first disconnects, so its handshake will time
//! out in the meantime.
//!
//! [`ControllerClient::is_connected`] turns false as soon as the server
//! closes the stream or a send fails. [`ControllerClient::reconnect`] dials
//! the remembered address again; no handshake is repeated.

pub mod error;
pub mod network;

pub use error::ClientError;
pub use network::{ControllerClient, ControllerEvent};
