//! Session WebSocket message types
//!
//! Text frames carry the JSON messages below. Binary frames carry raw PCM16
//! mono audio at 24 kHz: input audio from the client, output audio of the
//! active response from the server.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::session::SessionState;
use crate::core::turn_detect::TurnDetectionPolicy;

/// Maximum allowed size for instructions (100 KB)
pub const MAX_INSTRUCTIONS_SIZE: usize = 100 * 1024;

/// Maximum allowed size for text messages (50 KB)
pub const MAX_TEXT_SIZE: usize = 50 * 1024;

/// Maximum allowed size for item ids in playback reports
pub const MAX_ITEM_ID_SIZE: usize = 256;

// =============================================================================
// Incoming Messages (Client -> Server)
// =============================================================================

/// Incoming WebSocket messages from the client
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Session configuration. The first one opens the session; later ones
    /// may only change turn detection.
    Config(SessionSetup),

    /// Playback progress of an output item, in milliseconds from its start
    AudioPlayed { item_id: String, ms_played: u64 },

    /// Push-to-talk press
    BeginTurn,

    /// Push-to-talk release
    SubmitTurn,

    /// Ask for a response while idle
    RequestResponse {
        #[serde(default)]
        instructions: Option<String>,
    },

    /// Typed user message
    Text { text: String },

    /// End the session
    Close,
}

/// Per-connection overrides of the server defaults
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct SessionSetup {
    #[serde(default)]
    pub voice: Option<String>,

    #[serde(default)]
    pub instructions: Option<String>,

    #[serde(default)]
    pub turn_detection: Option<TurnDetectionPolicy>,
}

// =============================================================================
// Outgoing Messages (Server -> Client)
// =============================================================================

/// Outgoing WebSocket messages to the client
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    SessionCreated {
        session_id: String,
        model: String,
        voice: String,
        turn_detection: String,
        /// Number of stored messages replayed into the provider conversation
        resumed_items: usize,
    },

    StateChanged {
        old: SessionState,
        new: SessionState,
    },

    Transcript {
        item_id: String,
        role: String,
        text: String,
        is_final: bool,
    },

    /// Output audio of `item_id` follows as binary frames
    AudioStarted { response_id: String, item_id: String },

    ToolStarted { call_id: String, name: String },

    ToolFinished {
        call_id: String,
        name: String,
        success: bool,
        payload: Value,
    },

    /// An output item was cut at the played position, or dropped entirely
    /// when `audio_end_ms` is 0 and `discarded` is set.
    Truncated {
        item_id: String,
        audio_end_ms: u64,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        discarded: bool,
    },

    Error {
        code: String,
        message: String,
    },

    /// Connection closing
    Closing { reason: String },
}

impl ServerMessage {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code: code.into(),
            message: message.into(),
        }
    }
}

// =============================================================================
// Message Routing
// =============================================================================

/// Frames queued for the client writer task
#[derive(Debug)]
pub enum ClientRoute {
    Outgoing(ServerMessage),
    Audio(Bytes),
    Close,
}

// =============================================================================
// Validation
// =============================================================================

/// Error type for message validation failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageValidationError {
    #[error("Instructions too large: {size} bytes (max: {max} bytes)")]
    InstructionsTooLarge { size: usize, max: usize },

    #[error("Text too large: {size} bytes (max: {max} bytes)")]
    TextTooLarge { size: usize, max: usize },

    #[error("Item id too large: {size} bytes (max: {max} bytes)")]
    ItemIdTooLarge { size: usize, max: usize },
}

fn check(size: usize, max: usize, err: fn(usize, usize) -> MessageValidationError) -> Result<(), MessageValidationError> {
    if size > max { Err(err(size, max)) } else { Ok(()) }
}

impl ClientMessage {
    /// Validates field sizes to bound per-message memory.
    pub fn validate_size(&self) -> Result<(), MessageValidationError> {
        match self {
            ClientMessage::Config(setup) => match &setup.instructions {
                Some(instructions) => check(instructions.len(), MAX_INSTRUCTIONS_SIZE, |size, max| {
                    MessageValidationError::InstructionsTooLarge { size, max }
                }),
                None => Ok(()),
            },
            ClientMessage::RequestResponse {
                instructions: Some(instructions),
            } => check(instructions.len(), MAX_INSTRUCTIONS_SIZE, |size, max| {
                MessageValidationError::InstructionsTooLarge { size, max }
            }),
            ClientMessage::Text { text } => check(text.len(), MAX_TEXT_SIZE, |size, max| {
                MessageValidationError::TextTooLarge { size, max }
            }),
            ClientMessage::AudioPlayed { item_id, .. } => check(item_id.len(), MAX_ITEM_ID_SIZE, |size, max| {
                MessageValidationError::ItemIdTooLarge { size, max }
            }),
            ClientMessage::RequestResponse { instructions: None }
            | ClientMessage::BeginTurn
            | ClientMessage::SubmitTurn
            | ClientMessage::Close => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::turn_detect::Eagerness;

    #[test]
    fn test_config_message_deserialization() {
        let json = r#"{
            "type": "config",
            "voice": "cedar",
            "instructions": "You are a helpful assistant.",
            "turn_detection": {"type": "semantic_vad", "eagerness": "low"}
        }"#;

        let msg: ClientMessage = serde_json::from_str(json).expect("Should deserialize");
        match msg {
            ClientMessage::Config(setup) => {
                assert_eq!(setup.voice.as_deref(), Some("cedar"));
                assert_eq!(
                    setup.turn_detection,
                    Some(TurnDetectionPolicy::Semantic {
                        eagerness: Eagerness::Low
                    })
                );
            }
            other => panic!("Expected config, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"config"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Config(SessionSetup::default()));
    }

    #[test]
    fn test_control_messages() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"audio_played","item_id":"item_1","ms_played":1200}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::AudioPlayed {
                item_id: "item_1".into(),
                ms_played: 1200
            }
        );

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"request_response"}"#).unwrap();
        assert_eq!(msg, ClientMessage::RequestResponse { instructions: None });

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"submit_turn"}"#).unwrap();
        assert_eq!(msg, ClientMessage::SubmitTurn);

        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"dance"}"#).is_err());
    }

    #[test]
    fn test_outgoing_serialization() {
        let json = serde_json::to_value(ServerMessage::StateChanged {
            old: SessionState::Idle,
            new: SessionState::UserSpeaking,
        })
        .unwrap();
        assert_eq!(json["type"], "state_changed");
        assert_eq!(json["old"], "idle");
        assert_eq!(json["new"], "user_speaking");

        let json = serde_json::to_value(ServerMessage::error("invalid_state", "nope")).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["code"], "invalid_state");

        let json = serde_json::to_value(ServerMessage::Truncated {
            item_id: "item_1".into(),
            audio_end_ms: 1500,
            discarded: false,
        })
        .unwrap();
        assert!(json.get("discarded").is_none());
    }

    #[test]
    fn test_validate_size() {
        let ok = ClientMessage::Text { text: "hi".into() };
        assert!(ok.validate_size().is_ok());

        let big = ClientMessage::Text {
            text: "x".repeat(MAX_TEXT_SIZE + 1),
        };
        assert!(matches!(
            big.validate_size(),
            Err(MessageValidationError::TextTooLarge { .. })
        ));

        let big = ClientMessage::Config(SessionSetup {
            instructions: Some("x".repeat(MAX_INSTRUCTIONS_SIZE + 1)),
            ..Default::default()
        });
        assert!(big.validate_size().is_err());
    }
}
