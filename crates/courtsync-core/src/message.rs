//! Transport message protocol
//!
//! Messages exchanged between nearby devices over the peer transport.
//! The wire form is an envelope of `{kind, payload: map<string,string>}`
//! serialized with postcard behind a versioned wrapper; known payload keys
//! are `gameId` and `isRunning` (string-encoded boolean). Unknown payload
//! keys are carried through untouched so older builds can interoperate.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{CoordError, CoordResult};
use crate::types::SessionId;

/// Payload key carrying the session/game identifier
pub const KEY_GAME_ID: &str = "gameId";
/// Payload key carrying a string-encoded boolean clock state
pub const KEY_IS_RUNNING: &str = "isRunning";

/// Discriminator for transport messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// Controller announces a game is starting
    GameStarting,
    /// Controller tells a late joiner the game is already running
    GameAlreadyStarted,
    /// Controller asks the recorder for its recording state
    RequestRecordingState,
    /// Periodic game state broadcast (clock running flag)
    GameStateUpdate,
    /// Ask the recorder to start capturing
    StartRecording,
    /// Ask the recorder to stop capturing
    StopRecording,
    /// The game has ended
    GameEnded,
    /// Keep-alive probe
    Ping,
    /// Keep-alive response
    Pong,
}

impl MessageKind {
    /// Wire name for this kind (matches the payload key casing convention)
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::GameStarting => "gameStarting",
            MessageKind::GameAlreadyStarted => "gameAlreadyStarted",
            MessageKind::RequestRecordingState => "requestRecordingState",
            MessageKind::GameStateUpdate => "gameStateUpdate",
            MessageKind::StartRecording => "startRecording",
            MessageKind::StopRecording => "stopRecording",
            MessageKind::GameEnded => "gameEnded",
            MessageKind::Ping => "ping",
            MessageKind::Pong => "pong",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Wire envelope for a transport message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message discriminator
    pub kind: MessageKind,
    /// String key-value payload; unknown keys are preserved
    #[serde(default)]
    pub payload: BTreeMap<String, String>,
}

/// Typed view of a transport message
#[derive(Debug, Clone, PartialEq)]
pub enum TransportMessage {
    /// A game is starting; recorders should transition to in-progress
    GameStarting { game_id: SessionId },
    /// A game was already running when this device connected
    GameAlreadyStarted { game_id: SessionId },
    /// Request for the recorder's current recording state
    RequestRecordingState,
    /// Clock state broadcast for a game
    GameStateUpdate { game_id: SessionId, is_running: bool },
    /// Start capturing video
    StartRecording,
    /// Stop capturing video
    StopRecording,
    /// The game has ended
    GameEnded,
    /// Keep-alive probe
    Ping,
    /// Keep-alive response
    Pong,
}

impl TransportMessage {
    /// The discriminator for this message
    pub fn kind(&self) -> MessageKind {
        match self {
            TransportMessage::GameStarting { .. } => MessageKind::GameStarting,
            TransportMessage::GameAlreadyStarted { .. } => MessageKind::GameAlreadyStarted,
            TransportMessage::RequestRecordingState => MessageKind::RequestRecordingState,
            TransportMessage::GameStateUpdate { .. } => MessageKind::GameStateUpdate,
            TransportMessage::StartRecording => MessageKind::StartRecording,
            TransportMessage::StopRecording => MessageKind::StopRecording,
            TransportMessage::GameEnded => MessageKind::GameEnded,
            TransportMessage::Ping => MessageKind::Ping,
            TransportMessage::Pong => MessageKind::Pong,
        }
    }

    /// Build the wire envelope for this message
    pub fn to_envelope(&self) -> Envelope {
        let mut payload = BTreeMap::new();
        match self {
            TransportMessage::GameStarting { game_id }
            | TransportMessage::GameAlreadyStarted { game_id } => {
                payload.insert(KEY_GAME_ID.to_string(), game_id.as_str().to_string());
            }
            TransportMessage::GameStateUpdate {
                game_id,
                is_running,
            } => {
                payload.insert(KEY_GAME_ID.to_string(), game_id.as_str().to_string());
                payload.insert(KEY_IS_RUNNING.to_string(), is_running.to_string());
            }
            _ => {}
        }
        Envelope {
            kind: self.kind(),
            payload,
        }
    }

    /// Interpret a wire envelope as a typed message
    ///
    /// Fails if a required payload key (`gameId`) is missing; unknown extra
    /// keys are ignored.
    pub fn from_envelope(envelope: &Envelope) -> CoordResult<Self> {
        let game_id = |kind: MessageKind| -> CoordResult<SessionId> {
            envelope
                .payload
                .get(KEY_GAME_ID)
                .map(SessionId::from_string)
                .ok_or_else(|| {
                    CoordError::Serialization(format!("{} message missing {}", kind, KEY_GAME_ID))
                })
        };

        Ok(match envelope.kind {
            MessageKind::GameStarting => TransportMessage::GameStarting {
                game_id: game_id(MessageKind::GameStarting)?,
            },
            MessageKind::GameAlreadyStarted => TransportMessage::GameAlreadyStarted {
                game_id: game_id(MessageKind::GameAlreadyStarted)?,
            },
            MessageKind::RequestRecordingState => TransportMessage::RequestRecordingState,
            MessageKind::GameStateUpdate => TransportMessage::GameStateUpdate {
                game_id: game_id(MessageKind::GameStateUpdate)?,
                is_running: envelope
                    .payload
                    .get(KEY_IS_RUNNING)
                    .map(|v| v == "true")
                    .unwrap_or(false),
            },
            MessageKind::StartRecording => TransportMessage::StartRecording,
            MessageKind::StopRecording => TransportMessage::StopRecording,
            MessageKind::GameEnded => TransportMessage::GameEnded,
            MessageKind::Ping => TransportMessage::Ping,
            MessageKind::Pong => TransportMessage::Pong,
        })
    }

    /// Encode to wire bytes (versioned envelope, postcard)
    pub fn encode(&self) -> CoordResult<Vec<u8>> {
        WireMessage::new(self.to_envelope()).encode()
    }

    /// Decode from wire bytes
    pub fn decode(data: &[u8]) -> CoordResult<Self> {
        let wire = WireMessage::decode(data)?;
        Self::from_envelope(wire.as_inner())
    }
}

/// Versioned wrapper for wire envelopes (future-proofing)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireMessage {
    /// Protocol version 1
    V1(Envelope),
}

impl WireMessage {
    /// Wrap an envelope at the current protocol version
    pub fn new(envelope: Envelope) -> Self {
        WireMessage::V1(envelope)
    }

    /// Encode to bytes using postcard
    pub fn encode(&self) -> CoordResult<Vec<u8>> {
        postcard::to_allocvec(self).map_err(|e| CoordError::Serialization(e.to_string()))
    }

    /// Decode from bytes using postcard
    pub fn decode(data: &[u8]) -> CoordResult<Self> {
        postcard::from_bytes(data).map_err(|e| CoordError::Serialization(e.to_string()))
    }

    /// Get a reference to the inner envelope
    pub fn as_inner(&self) -> &Envelope {
        match self {
            WireMessage::V1(env) => env,
        }
    }

    /// Protocol version of this message
    pub fn version(&self) -> u8 {
        match self {
            WireMessage::V1(_) => 1,
        }
    }
}
