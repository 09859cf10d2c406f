use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod codec;

pub use codec::{encode_frame, Decoded, FrameCodec};

pub const DEFAULT_PORT: u16 = 9998;
pub const GAZE_FRAME_WIDTH: i32 = 640;
pub const GAZE_FRAME_HEIGHT: i32 = 480;
pub const FRAME_HEADER_LEN: usize = 4;

/// Acknowledgement id sent back when the start signal has been handled.
pub const START_SIGNAL_ACK: &str = "start_signal_received";

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("payload of {0} bytes does not fit a frame")]
    FrameTooLarge(usize),

    #[error("invalid envelope: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown message type '{0}'")]
    UnknownKind(String),

    #[error("stream ended inside a frame, {buffered} bytes discarded")]
    Truncated { buffered: usize },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// The `{type, payload}` wrapper carried by every frame.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: String,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            payload: payload.into(),
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Serialized envelope, ready to hand to a [`FrameCodec`] sink.
    pub fn to_bytes(&self) -> Result<Bytes, ProtocolError> {
        Ok(Bytes::from(self.to_json()?))
    }

    /// Serializes the envelope and wraps it in a length-prefixed frame.
    pub fn to_frame(&self) -> Result<Vec<u8>, ProtocolError> {
        let json = self.to_json()?;
        encode_frame(json.as_bytes())
    }
}

/// Message types the controller sends to the bridge server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InboundKind {
    StartSignal,
    Subtitle,
    SelectionConfirmed,
}

impl InboundKind {
    pub const ALL: [InboundKind; 3] = [
        InboundKind::StartSignal,
        InboundKind::Subtitle,
        InboundKind::SelectionConfirmed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InboundKind::StartSignal => "start_signal",
            InboundKind::Subtitle => "subtitle",
            InboundKind::SelectionConfirmed => "selection_confirmed",
        }
    }
}

impl FromStr for InboundKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        InboundKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownKind(s.to_string()))
    }
}

impl fmt::Display for InboundKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message types the bridge server sends back to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutboundKind {
    Ack,
    Command,
    Gaze,
}

impl OutboundKind {
    pub const ALL: [OutboundKind; 3] = [OutboundKind::Ack, OutboundKind::Command, OutboundKind::Gaze];

    pub fn as_str(&self) -> &'static str {
        match self {
            OutboundKind::Ack => "ack",
            OutboundKind::Command => "command",
            OutboundKind::Gaze => "gaze",
        }
    }
}

impl FromStr for OutboundKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OutboundKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownKind(s.to_string()))
    }
}

impl fmt::Display for OutboundKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Commands a user can pick on the client side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Eat,
    Grub,
    Door,
    Plate,
}

impl Command {
    pub const ALL: [Command; 4] = [Command::Eat, Command::Grub, Command::Door, Command::Plate];

    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Eat => "eat",
            Command::Grub => "grub",
            Command::Door => "door",
            Command::Plate => "plate",
        }
    }
}

impl FromStr for Command {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Command::ALL
            .into_iter()
            .find(|command| command.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownKind(s.to_string()))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Gaze position in pixels of the 640x480 video reference frame.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct GazePoint {
    pub x: i32,
    pub y: i32,
}

impl GazePoint {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Maps a normalized point on the video surface to reference-frame pixels.
    ///
    /// The surface origin is bottom-left while pixel rows grow downwards, so
    /// the vertical axis is flipped.
    pub fn from_normalized(nx: f32, ny: f32) -> Self {
        Self {
            x: (nx * GAZE_FRAME_WIDTH as f32).round() as i32,
            y: ((1.0 - ny) * GAZE_FRAME_HEIGHT as f32).round() as i32,
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}
