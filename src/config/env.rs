//! Environment variable loading.

use std::env;
use std::str::FromStr;

/// Values read from the environment. `None` means the variable is unset or
/// empty.
#[derive(Debug, Clone, Default)]
pub(super) struct EnvConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub openai_api_key: Option<String>,
    pub realtime_model: Option<String>,
    pub realtime_voice: Option<String>,
    pub realtime_instructions: Option<String>,
    pub transcription_model: Option<String>,
    pub turn_detection: Option<String>,
    pub tool_timeout_seconds: Option<u64>,
    pub cancel_ack_timeout_ms: Option<u64>,
    pub history_max_tokens: Option<usize>,
    pub history_retain_ratio: Option<f32>,
    pub approval_policy: Option<String>,
    pub auto_response: Option<bool>,
    pub transcript_dir: Option<String>,
    pub cors_allowed_origins: Option<String>,
}

impl EnvConfig {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        Ok(Self {
            host: var("HOST"),
            port: parse("PORT")?,
            openai_api_key: var("OPENAI_API_KEY"),
            realtime_model: var("REALTIME_MODEL"),
            realtime_voice: var("REALTIME_VOICE"),
            realtime_instructions: var("REALTIME_INSTRUCTIONS"),
            transcription_model: env::var("TRANSCRIPTION_MODEL").ok(),
            turn_detection: var("TURN_DETECTION"),
            tool_timeout_seconds: parse("TOOL_TIMEOUT_SECONDS")?,
            cancel_ack_timeout_ms: parse("CANCEL_ACK_TIMEOUT_MS")?,
            history_max_tokens: parse("HISTORY_MAX_TOKENS")?,
            history_retain_ratio: parse("HISTORY_RETAIN_RATIO")?,
            approval_policy: var("APPROVAL_POLICY"),
            auto_response: parse_bool("AUTO_RESPONSE")?,
            transcript_dir: var("TRANSCRIPT_DIR"),
            cors_allowed_origins: var("CORS_ALLOWED_ORIGINS"),
        })
    }
}

fn var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse<T>(key: &str) -> Result<Option<T>, Box<dyn std::error::Error>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match var(key) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| format!("Invalid value for {key}: '{value}' ({e})").into()),
        None => Ok(None),
    }
}

fn parse_bool(key: &str) -> Result<Option<bool>, Box<dyn std::error::Error>> {
    match var(key).map(|v| v.trim().to_lowercase()) {
        Some(v) if matches!(v.as_str(), "true" | "1" | "yes" | "on") => Ok(Some(true)),
        Some(v) if matches!(v.as_str(), "false" | "0" | "no" | "off") => Ok(Some(false)),
        Some(v) => Err(format!("Invalid boolean for {key}: '{v}'").into()),
        None => Ok(None),
    }
}
