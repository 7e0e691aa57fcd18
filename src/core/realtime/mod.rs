//! Speech-to-speech provider transport.
//!
//! The session core never touches the wire. A [`RealtimeTransport`] turns
//! provider traffic into [`InboundEvent`]s and carries out the
//! [`OutboundCommand`]s the session emits.
//!
//! # Audio Format
//!
//! - OpenAI: PCM 16-bit signed little-endian at 24kHz, mono

pub mod openai;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::core::history::ConversationItem;
use crate::core::session::{InboundEvent, OutboundCommand};
use crate::core::turn_detect::TurnDetectionPolicy;

pub use openai::{OpenAIRealtimeConfig, OpenAIRealtimeTransport};

/// Transport failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Connection to the provider failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Operation timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Not connected
    #[error("Not connected")]
    NotConnected,
}

pub type TransportResult<T> = Result<T, TransportError>;

/// A bidirectional provider connection.
///
/// `send` and `append_input_audio` take `&self` so they can be called while
/// another branch of a `select!` is waiting on [`next_event`](Self::next_event).
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    /// Carry out one session command.
    async fn send(&self, command: OutboundCommand) -> TransportResult<()>;

    /// Stream user audio (PCM16) to the provider's input buffer.
    async fn append_input_audio(&self, audio: Bytes) -> TransportResult<()>;

    /// Next provider event, or `None` once the connection is gone.
    async fn next_event(&mut self) -> Option<InboundEvent>;

    /// Reconfigure provider-side turn detection mid-session.
    async fn set_turn_detection(&self, policy: &TurnDetectionPolicy) -> TransportResult<()>;

    /// Seed the provider conversation with earlier items, e.g. when a
    /// session is resumed from a stored transcript.
    async fn replay_history(&self, items: &[ConversationItem]) -> TransportResult<()>;

    async fn close(&self) -> TransportResult<()>;

    fn is_connected(&self) -> bool;
}

pub type BoxedTransport = Box<dyn RealtimeTransport>;
