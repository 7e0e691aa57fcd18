//! Merging YAML and environment configurations.

use std::path::PathBuf;

use super::ServerConfig;
use super::env::EnvConfig;
use super::yaml::YamlConfig;
use crate::core::realtime::openai::DEFAULT_REALTIME_MODEL;
use crate::core::turn_detect::TurnDetectionPolicy;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 3001;
const DEFAULT_VOICE: &str = "marin";
const DEFAULT_TRANSCRIPTION_MODEL: &str = "whisper-1";

/// Build the final configuration: YAML values win over environment values,
/// which win over defaults.
pub(super) fn merge_config(
    yaml: Option<YamlConfig>,
) -> Result<ServerConfig, Box<dyn std::error::Error>> {
    let env = EnvConfig::load()?;
    let yaml = yaml.unwrap_or_default();

    let server = yaml.server.unwrap_or_default();
    let providers = yaml.providers.unwrap_or_default();
    let realtime = yaml.realtime.unwrap_or_default();
    let session = yaml.session.unwrap_or_default();
    let transcript = yaml.transcript.unwrap_or_default();
    let security = yaml.security.unwrap_or_default();

    let turn_detection = match session.turn_detection {
        Some(policy) => policy,
        None => match env.turn_detection.as_deref() {
            Some(raw) => raw
                .parse::<TurnDetectionPolicy>()
                .map_err(|e| format!("Invalid value for TURN_DETECTION: {e}"))?,
            None => TurnDetectionPolicy::default(),
        },
    };

    let approval_policy = match session.approval_policy {
        Some(policy) => policy,
        None => match env.approval_policy.as_deref() {
            Some(raw) => raw
                .parse()
                .map_err(|e| format!("Invalid value for APPROVAL_POLICY: {e}"))?,
            None => Default::default(),
        },
    };

    // an explicit empty string disables transcription
    let transcription_model = realtime
        .transcription_model
        .or(env.transcription_model)
        .unwrap_or_else(|| DEFAULT_TRANSCRIPTION_MODEL.to_string());

    Ok(ServerConfig {
        host: server
            .host
            .or(env.host)
            .unwrap_or_else(|| DEFAULT_HOST.to_string()),
        port: server.port.or(env.port).unwrap_or(DEFAULT_PORT),
        openai_api_key: providers.openai_api_key.or(env.openai_api_key),
        realtime_model: realtime
            .model
            .or(env.realtime_model)
            .unwrap_or_else(|| DEFAULT_REALTIME_MODEL.to_string()),
        realtime_voice: realtime
            .voice
            .or(env.realtime_voice)
            .unwrap_or_else(|| DEFAULT_VOICE.to_string()),
        realtime_instructions: realtime.instructions.or(env.realtime_instructions),
        transcription_model: (!transcription_model.trim().is_empty()).then_some(transcription_model),
        turn_detection,
        tool_timeout_seconds: session
            .tool_timeout_seconds
            .or(env.tool_timeout_seconds)
            .unwrap_or(30),
        cancel_ack_timeout_ms: session
            .cancel_ack_timeout_ms
            .or(env.cancel_ack_timeout_ms)
            .unwrap_or(2000),
        history_max_tokens: session
            .history_max_tokens
            .or(env.history_max_tokens)
            .unwrap_or(32_000),
        history_retain_ratio: session
            .history_retain_ratio
            .or(env.history_retain_ratio)
            .unwrap_or(0.75),
        approval_policy,
        auto_response: session.auto_response.or(env.auto_response).unwrap_or(true),
        transcript_dir: transcript.dir.or(env.transcript_dir).map(PathBuf::from),
        cors_allowed_origins: security.cors_allowed_origins.or(env.cors_allowed_origins),
        tools: yaml.tools,
    })
}
