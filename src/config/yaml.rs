use serde::Deserialize;
use std::path::PathBuf;

use crate::core::tools::{ApprovalPolicy, HttpToolConfig};
use crate::core::turn_detect::TurnDetectionPolicy;

/// Complete YAML configuration structure
///
/// All fields are optional to allow partial configuration. Values present
/// here override environment variables.
///
/// # Example YAML structure
/// ```yaml
/// server:
///   host: "0.0.0.0"
///   port: 3001
///
/// providers:
///   openai_api_key: "sk-..."
///
/// realtime:
///   model: "gpt-realtime"
///   voice: "marin"
///   instructions: "You are a helpful travel agent."
///   transcription_model: "whisper-1"
///
/// session:
///   turn_detection:
///     type: server_vad
///     threshold: 0.5
///     prefix_padding_ms: 300
///     silence_duration_ms: 500
///   tool_timeout_seconds: 30
///   cancel_ack_timeout_ms: 2000
///   history_max_tokens: 32000
///   history_retain_ratio: 0.75
///   approval_policy: auto_approve
///   auto_response: true
///
/// transcript:
///   dir: "/var/lib/waav-session/transcripts"
///
/// security:
///   cors_allowed_origins: "https://app.example.com"
///
/// tools:
///   - name: "lookup_flight"
///     description: "Look up a flight by number"
///     url: "https://tools.example.com/flights"
///     timeout_seconds: 10
///     parameters:
///       type: object
///       properties:
///         flight: { type: string }
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub server: Option<ServerYaml>,
    pub providers: Option<ProvidersYaml>,
    pub realtime: Option<RealtimeYaml>,
    pub session: Option<SessionYaml>,
    pub transcript: Option<TranscriptYaml>,
    pub security: Option<SecurityYaml>,
    pub tools: Vec<HttpToolConfig>,
}

/// Server configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ServerYaml {
    pub host: Option<String>,
    pub port: Option<u16>,
}

/// Provider API keys from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ProvidersYaml {
    /// OpenAI API key for the Realtime API
    pub openai_api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RealtimeYaml {
    pub model: Option<String>,
    pub voice: Option<String>,
    pub instructions: Option<String>,
    /// Empty string disables input transcription
    pub transcription_model: Option<String>,
}

/// Per-session tunables from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SessionYaml {
    pub turn_detection: Option<TurnDetectionPolicy>,
    pub tool_timeout_seconds: Option<u64>,
    pub cancel_ack_timeout_ms: Option<u64>,
    pub history_max_tokens: Option<usize>,
    pub history_retain_ratio: Option<f32>,
    pub approval_policy: Option<ApprovalPolicy>,
    pub auto_response: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TranscriptYaml {
    pub dir: Option<String>,
}

/// Security configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SecurityYaml {
    /// Comma-separated list, or "*"
    pub cors_allowed_origins: Option<String>,
}

impl YamlConfig {
    /// Load configuration from a YAML file
    ///
    /// # Errors
    /// Returns an error if:
    /// - The file cannot be read
    /// - The YAML is malformed
    /// - Required fields have invalid types
    pub fn from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {e}", path.display()))?;

        let config: YamlConfig = serde_yaml::from_str(&contents)
            .map_err(|e| format!("Failed to parse YAML config: {e}"))?;

        Ok(config)
    }
}
