//! Configuration module for the session server
//!
//! Server configuration comes from .env files, environment variables and an
//! optional YAML file. Priority: YAML > ENV vars > .env values > defaults.
//!
//! # Modules
//! - `yaml`: YAML configuration file loading
//! - `env`: Environment variable loading
//! - `merge`: Merging YAML and environment configurations
//! - `validation`: Configuration validation logic
//!
//! # Example
//! ```rust,no_run
//! use waav_session::config::ServerConfig;
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Load from environment variables only
//! let config = ServerConfig::from_env()?;
//!
//! // Load from YAML file with environment variable overrides
//! let config_path = PathBuf::from("config.yaml");
//! let config = ServerConfig::from_file(&config_path)?;
//!
//! println!("Server listening on {}", config.address());
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Serialize, Serializer};

mod env;
mod merge;
mod validation;
mod yaml;

pub use yaml::YamlConfig;

use crate::core::realtime::openai::{OpenAIRealtimeConfig, OpenAIRealtimeVoice};
use crate::core::session::SessionConfig;
use crate::core::tools::{ApprovalPolicy, HttpToolConfig};
use crate::core::turn_detect::{TurnDetectionPolicy, VadSource};

/// Server configuration
///
/// Contains all configuration needed to run the session server:
/// - Server settings (host, port)
/// - Provider credentials and realtime model settings
/// - Per-session tunables (turn detection, timeouts, history budget)
/// - Transcript persistence and webhook tools
#[derive(Debug, Clone, Serialize)]
pub struct ServerConfig {
    // Server settings
    pub host: String,
    pub port: u16,

    /// OpenAI API key for the Realtime API
    #[serde(serialize_with = "redact")]
    pub openai_api_key: Option<String>,
    pub realtime_model: String,
    pub realtime_voice: String,
    pub realtime_instructions: Option<String>,
    /// `None` disables transcription of user audio
    pub transcription_model: Option<String>,

    // Session settings
    pub turn_detection: TurnDetectionPolicy,
    pub tool_timeout_seconds: u64,
    pub cancel_ack_timeout_ms: u64,
    pub history_max_tokens: usize,
    pub history_retain_ratio: f32,
    pub approval_policy: ApprovalPolicy,
    pub auto_response: bool,

    /// Transcript storage directory; persistence is off when unset
    pub transcript_dir: Option<PathBuf>,

    /// Comma-separated origins, or "*"
    pub cors_allowed_origins: Option<String>,

    /// Webhook tools registered on every session
    pub tools: Vec<HttpToolConfig>,
}

fn redact<S: Serializer>(value: &Option<String>, serializer: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(_) => serializer.serialize_some("***"),
        None => serializer.serialize_none(),
    }
}

impl ServerConfig {
    /// Load configuration from environment variables (and defaults)
    ///
    /// The .env file is loaded in main.rs at startup, so its values are
    /// already visible as environment variables here.
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let config = merge::merge_config(None)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file with environment variable base
    ///
    /// Priority order (highest to lowest):
    /// 1. YAML file values
    /// 2. Environment variables (actual ENV vars override .env values)
    /// 3. .env file values
    /// 4. Default values
    ///
    /// # Errors
    /// Returns an error if:
    /// - The YAML file cannot be read or is malformed
    /// - Environment variables have invalid formats
    /// - Configuration validation fails
    pub fn from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        let yaml_config = yaml::YamlConfig::from_file(path)?;
        let config = merge::merge_config(Some(yaml_config))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        self.turn_detection
            .validate()
            .map_err(|e| format!("Invalid turn detection: {e}"))?;
        validation::validate_session(
            self.tool_timeout_seconds,
            self.cancel_ack_timeout_ms,
            self.history_max_tokens,
            self.history_retain_ratio,
        )?;
        validation::validate_tools(&self.tools)?;
        Ok(())
    }

    /// Get the server address as a string
    ///
    /// Returns the address in the format "host:port"
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Tunables for a new session.
    ///
    /// Sessions served by this process use the provider's VAD, so provider
    /// `speech_stopped` events complete turns directly.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            turn_detection: self.turn_detection.clone(),
            vad_source: VadSource::Provider,
            auto_response: self.auto_response,
            tool_timeout: Duration::from_secs(self.tool_timeout_seconds),
            cancel_ack_timeout: Duration::from_millis(self.cancel_ack_timeout_ms),
            approval_policy: self.approval_policy,
            history_max_tokens: self.history_max_tokens,
            history_retain_ratio: self.history_retain_ratio,
        }
    }

    /// Provider connection settings.
    ///
    /// # Errors
    /// Returns an error message when no OpenAI API key is configured.
    pub fn realtime_config(&self) -> Result<OpenAIRealtimeConfig, String> {
        let api_key = self
            .openai_api_key
            .clone()
            .ok_or_else(|| "OpenAI API key not configured (set OPENAI_API_KEY)".to_string())?;
        Ok(OpenAIRealtimeConfig {
            api_key,
            model: self.realtime_model.clone(),
            voice: OpenAIRealtimeVoice::from_str_or_default(&self.realtime_voice),
            instructions: self.realtime_instructions.clone(),
            transcription_model: self.transcription_model.clone(),
            turn_detection: self.turn_detection.clone(),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use std::fs;
    use tempfile::TempDir;

    const ENV_VARS: &[&str] = &[
        "HOST",
        "PORT",
        "OPENAI_API_KEY",
        "REALTIME_MODEL",
        "REALTIME_VOICE",
        "REALTIME_INSTRUCTIONS",
        "TRANSCRIPTION_MODEL",
        "TURN_DETECTION",
        "TOOL_TIMEOUT_SECONDS",
        "CANCEL_ACK_TIMEOUT_MS",
        "HISTORY_MAX_TOKENS",
        "HISTORY_RETAIN_RATIO",
        "APPROVAL_POLICY",
        "AUTO_RESPONSE",
        "TRANSCRIPT_DIR",
        "CORS_ALLOWED_ORIGINS",
    ];

    fn cleanup_env_vars() {
        unsafe {
            for var in ENV_VARS {
                env::remove_var(var);
            }
        }
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        cleanup_env_vars();

        let config = ServerConfig::from_env().unwrap();

        assert_eq!(config.address(), "0.0.0.0:3001");
        assert_eq!(config.realtime_model, "gpt-realtime");
        assert_eq!(config.realtime_voice, "marin");
        assert_eq!(config.turn_detection, TurnDetectionPolicy::default());
        assert_eq!(config.tool_timeout_seconds, 30);
        assert_eq!(config.cancel_ack_timeout_ms, 2000);
        assert_eq!(config.history_max_tokens, 32_000);
        assert!(config.transcript_dir.is_none());
        assert!(config.auto_response);
        assert!(config.realtime_config().is_err());
    }

    #[test]
    #[serial]
    fn test_from_env_values() {
        cleanup_env_vars();
        unsafe {
            env::set_var("PORT", "8080");
            env::set_var("OPENAI_API_KEY", "sk-env");
            env::set_var("TURN_DETECTION", "semantic_vad:low");
            env::set_var("TOOL_TIMEOUT_SECONDS", "5");
            env::set_var("AUTO_RESPONSE", "false");
        }

        let config = ServerConfig::from_env().unwrap();
        cleanup_env_vars();

        assert_eq!(config.port, 8080);
        assert_eq!(config.turn_detection.name(), "semantic_vad");
        let session = config.session_config();
        assert_eq!(session.tool_timeout, Duration::from_secs(5));
        assert!(!session.auto_response);
        assert_eq!(session.vad_source, VadSource::Provider);
        assert_eq!(config.realtime_config().unwrap().api_key, "sk-env");
    }

    #[test]
    #[serial]
    fn test_from_env_invalid_port() {
        cleanup_env_vars();
        unsafe {
            env::set_var("PORT", "not-a-port");
        }

        let result = ServerConfig::from_env();
        cleanup_env_vars();

        assert!(result.unwrap_err().to_string().contains("PORT"));
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_retain_ratio() {
        cleanup_env_vars();
        unsafe {
            env::set_var("HISTORY_RETAIN_RATIO", "1.5");
        }

        let result = ServerConfig::from_env();
        cleanup_env_vars();

        assert!(result.is_err());
    }

    #[test]
    #[serial]
    fn test_from_file_yaml_overrides_env() {
        cleanup_env_vars();

        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yaml");
        let yaml_content = r#"
server:
  host: "127.0.0.1"
  port: 8080

providers:
  openai_api_key: "sk-yaml"

session:
  turn_detection:
    type: manual
"#;
        fs::write(&config_path, yaml_content).unwrap();

        unsafe {
            env::set_var("HOST", "10.0.0.1");
            env::set_var("OPENAI_API_KEY", "sk-env");
            env::set_var("REALTIME_VOICE", "cedar");
        }

        let config = ServerConfig::from_file(&config_path).unwrap();
        cleanup_env_vars();

        // YAML overrides ENV
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.openai_api_key.as_deref(), Some("sk-yaml"));
        // ENV fills what YAML leaves out
        assert_eq!(config.realtime_voice, "cedar");
        assert!(config.turn_detection.is_manual());
    }

    #[test]
    #[serial]
    fn test_from_file_rejects_duplicate_tools() {
        cleanup_env_vars();

        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yaml");
        let yaml_content = r#"
tools:
  - name: "lookup"
    url: "https://tools.example.com/a"
  - name: "lookup"
    url: "https://tools.example.com/b"
"#;
        fs::write(&config_path, yaml_content).unwrap();

        let result = ServerConfig::from_file(&config_path);
        assert!(result.unwrap_err().to_string().contains("duplicate tool name"));
    }

    #[test]
    #[serial]
    fn test_empty_transcription_model_disables_transcription() {
        cleanup_env_vars();
        unsafe {
            env::set_var("TRANSCRIPTION_MODEL", "");
        }

        let config = ServerConfig::from_env().unwrap();
        cleanup_env_vars();

        assert!(config.transcription_model.is_none());
    }

    #[test]
    #[serial]
    fn test_serialized_config_redacts_api_key() {
        cleanup_env_vars();
        unsafe {
            env::set_var("OPENAI_API_KEY", "sk-secret");
        }

        let config = ServerConfig::from_env().unwrap();
        cleanup_env_vars();

        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("sk-secret"));
        assert!(json.contains("***"));
    }
}
