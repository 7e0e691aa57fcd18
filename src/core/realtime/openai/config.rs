//! OpenAI Realtime connection settings.

use serde::{Deserialize, Serialize};

use crate::core::tools::ToolDefinition;
use crate::core::turn_detect::TurnDetectionPolicy;

/// OpenAI Realtime API WebSocket endpoint.
pub const OPENAI_REALTIME_URL: &str = "wss://api.openai.com/v1/realtime";

/// Audio sample rate of `pcm16` input and output.
pub const OPENAI_REALTIME_SAMPLE_RATE: u32 = 24000;

pub const DEFAULT_REALTIME_MODEL: &str = "gpt-realtime";

// =============================================================================
// Voices
// =============================================================================

/// Voices accepted by the Realtime API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpenAIRealtimeVoice {
    Alloy,
    Ash,
    Ballad,
    Cedar,
    Coral,
    Echo,
    #[default]
    Marin,
    Sage,
    Shimmer,
    Verse,
}

impl OpenAIRealtimeVoice {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Alloy => "alloy",
            Self::Ash => "ash",
            Self::Ballad => "ballad",
            Self::Cedar => "cedar",
            Self::Coral => "coral",
            Self::Echo => "echo",
            Self::Marin => "marin",
            Self::Sage => "sage",
            Self::Shimmer => "shimmer",
            Self::Verse => "verse",
        }
    }

    /// Parse from string, with fallback to default.
    pub fn from_str_or_default(s: &str) -> Self {
        Self::all()
            .iter()
            .copied()
            .find(|v| v.as_str().eq_ignore_ascii_case(s.trim()))
            .unwrap_or_default()
    }

    pub fn all() -> &'static [OpenAIRealtimeVoice] {
        &[
            Self::Alloy,
            Self::Ash,
            Self::Ballad,
            Self::Cedar,
            Self::Coral,
            Self::Echo,
            Self::Marin,
            Self::Sage,
            Self::Shimmer,
            Self::Verse,
        ]
    }
}

impl std::fmt::Display for OpenAIRealtimeVoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Connection config
// =============================================================================

/// Everything needed to open one provider session.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenAIRealtimeConfig {
    pub api_key: String,
    pub model: String,
    pub voice: OpenAIRealtimeVoice,
    pub instructions: Option<String>,
    /// Model used to transcribe user audio. `None` disables input transcripts.
    pub transcription_model: Option<String>,
    pub turn_detection: TurnDetectionPolicy,
    pub tools: Vec<ToolDefinition>,
    /// Override of the endpoint, used by tests.
    pub url: String,
}

impl Default for OpenAIRealtimeConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: DEFAULT_REALTIME_MODEL.to_string(),
            voice: OpenAIRealtimeVoice::default(),
            instructions: None,
            transcription_model: Some("whisper-1".to_string()),
            turn_detection: TurnDetectionPolicy::default(),
            tools: Vec::new(),
            url: OPENAI_REALTIME_URL.to_string(),
        }
    }
}

impl OpenAIRealtimeConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            ..Default::default()
        }
    }

    /// WebSocket URL with the model parameter.
    pub fn ws_url(&self) -> String {
        format!("{}?model={}", self.url, self.model)
    }
}
