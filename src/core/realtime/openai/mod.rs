//! OpenAI Realtime API transport.
//!
//! # Audio Format
//!
//! Input and output audio is PCM 16-bit signed little-endian at 24kHz.

mod client;
mod config;
mod convert;
mod messages;

pub use client::OpenAIRealtimeTransport;
pub use config::{
    DEFAULT_REALTIME_MODEL, OPENAI_REALTIME_SAMPLE_RATE, OPENAI_REALTIME_URL,
    OpenAIRealtimeConfig, OpenAIRealtimeVoice,
};
pub use convert::{EventTranslator, history_item, turn_detection_for};
pub use messages::{ClientEvent, ServerEvent, TurnDetection};
