//! Closed event model between the session core, the transport and the
//! application.

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use super::state::SessionState;
use crate::core::history::{ConversationItem, ItemRole};

// =============================================================================
// Transport -> session
// =============================================================================

/// Final status of a provider response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Completed,
    Cancelled,
    Incomplete,
    Failed { message: String },
}

/// Events delivered by the speech-to-speech transport, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// Provider VAD detected speech onset. `item_id` names the input item
    /// the provider is buffering, when it reports one.
    SpeechStarted {
        audio_start_ms: u64,
        item_id: Option<String>,
    },
    SpeechStopped {
        audio_end_ms: u64,
        item_id: Option<String>,
    },
    /// One frame of local speech energy (0.0 - 1.0).
    InputAudioLevel { level: f32 },
    /// Verdict of a semantic end-of-turn classifier.
    SemanticTurnVerdict { complete: bool },
    /// Transcription of a committed user input item.
    InputTranscript {
        item_id: Option<String>,
        transcript: String,
    },
    ToolCallArgumentDelta {
        response_id: String,
        call_id: String,
        name: Option<String>,
        delta: String,
    },
    ToolCallDone {
        response_id: String,
        call_id: String,
        name: Option<String>,
        arguments: String,
    },
    ResponseStarted { response_id: String },
    ResponseAudioDelta {
        response_id: String,
        item_id: String,
        audio: Bytes,
        sample_rate: u32,
    },
    ResponseTranscriptDelta {
        response_id: String,
        item_id: String,
        delta: String,
    },
    ResponseDone {
        response_id: String,
        status: ResponseStatus,
    },
    /// Error reported by the provider.
    Error {
        code: Option<String>,
        message: String,
    },
    /// An event that could not be decoded.
    Malformed { detail: String },
    DetectionLost,
    DetectionRestored,
}

impl InboundEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            InboundEvent::SpeechStarted { .. } => "speech_started",
            InboundEvent::SpeechStopped { .. } => "speech_stopped",
            InboundEvent::InputAudioLevel { .. } => "input_audio_level",
            InboundEvent::SemanticTurnVerdict { .. } => "semantic_turn_verdict",
            InboundEvent::InputTranscript { .. } => "input_transcript",
            InboundEvent::ToolCallArgumentDelta { .. } => "tool_call_argument_delta",
            InboundEvent::ToolCallDone { .. } => "tool_call_done",
            InboundEvent::ResponseStarted { .. } => "response_started",
            InboundEvent::ResponseAudioDelta { .. } => "response_audio_delta",
            InboundEvent::ResponseTranscriptDelta { .. } => "response_transcript_delta",
            InboundEvent::ResponseDone { .. } => "response_done",
            InboundEvent::Error { .. } => "error",
            InboundEvent::Malformed { .. } => "malformed",
            InboundEvent::DetectionLost => "detection_lost",
            InboundEvent::DetectionRestored => "detection_restored",
        }
    }
}

// =============================================================================
// Session -> transport
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseReason {
    /// A user turn completed.
    Turn,
    /// The application asked for it.
    Explicit,
    /// Tool outputs are ready.
    ToolContinuation,
}

/// Intents the transport must carry out, in emission order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundCommand {
    /// Commit buffered input audio as a user item.
    CommitTurn { item_id: String },
    /// Add a typed user message.
    CreateUserMessage { item_id: String, text: String },
    /// Cancel the in-flight response (the current one when `None`).
    CancelResponse { response_id: Option<String> },
    /// Cut an assistant item's audio at `audio_end_ms`.
    TruncateItem {
        item_id: String,
        content_index: u32,
        audio_end_ms: u64,
    },
    DeleteItem { item_id: String },
    CreateToolOutput { call_id: String, output: String },
    RequestResponse {
        instructions: Option<String>,
        reason: ResponseReason,
    },
}

// =============================================================================
// Session -> application
// =============================================================================

/// Failures surfaced to the application as events.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionFault {
    #[error("Generation failed: {message}")]
    GenerationFailed {
        response_id: Option<String>,
        code: Option<String>,
        message: String,
    },

    #[error("Turn detection lost")]
    DetectionLost,

    #[error("Cancellation of response {response_id} was not acknowledged")]
    CancellationTimeout { response_id: String },

    #[error("Protocol error: {message}")]
    Protocol { message: String },
}

impl SessionFault {
    pub fn code(&self) -> &'static str {
        match self {
            SessionFault::GenerationFailed { .. } => "generation_failed",
            SessionFault::DetectionLost => "detection_lost",
            SessionFault::CancellationTimeout { .. } => "cancellation_timeout",
            SessionFault::Protocol { .. } => "protocol_error",
        }
    }
}

/// Notifications for the application layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionNotification {
    StateChanged {
        old: SessionState,
        new: SessionState,
    },
    /// Output audio of the active response, for the playback sink.
    Audio {
        response_id: String,
        item_id: String,
        data: Bytes,
    },
    Transcript {
        item_id: String,
        role: ItemRole,
        text: String,
        is_final: bool,
    },
    /// An item reached its final form (finished, truncated or resolved).
    ItemFinalized { item: ConversationItem },
    ItemTruncated {
        item_id: String,
        audio_end_ms: u64,
    },
    ItemDiscarded { item_id: String },
    ItemsEvicted { item_ids: Vec<String> },
    ToolStarted { call_id: String, name: String },
    ToolFinished {
        call_id: String,
        name: String,
        success: bool,
        payload: Value,
    },
    Error(SessionFault),
    Closed,
}
