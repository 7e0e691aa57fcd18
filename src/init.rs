//! Startup helpers shared by the `waav-session` binary.
//!
//! This module hosts the logic behind `waav-session check-config`: resolve
//! the configuration the server would run with, check that everything it
//! refers to is usable, and render it with secrets redacted.
//!
//! ```text
//! $ waav-session --config config.yaml check-config
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};

use crate::config::ServerConfig;
use crate::state::AppState;

/// Load configuration from a YAML file (with environment fallbacks) or from
/// the environment alone.
pub fn load_config(path: Option<&PathBuf>) -> Result<ServerConfig> {
    match path {
        Some(path) => ServerConfig::from_file(path).map_err(|e| anyhow!(e.to_string())),
        None => ServerConfig::from_env().map_err(|e| anyhow!(e.to_string())),
    }
}

/// Validate the resolved configuration beyond parsing and return it as
/// YAML. API keys are redacted.
pub fn check_config(path: Option<&PathBuf>) -> Result<String> {
    let config = load_config(path)?;

    config
        .realtime_config()
        .map_err(|e| anyhow!(e))
        .context("Realtime provider is not usable")?;

    let state = AppState::new(config).context("Failed to initialise server state")?;
    let registry = state.build_tool_registry();
    if registry.len() != state.config.tools.len() {
        return Err(anyhow!(
            "Only {} of {} webhook tools could be registered",
            registry.len(),
            state.config.tools.len()
        ));
    }

    serde_yaml::to_string(&state.config).context("Failed to render configuration")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;
    use tempfile::TempDir;

    fn clear_env() {
        unsafe {
            for var in ["OPENAI_API_KEY", "TRANSCRIPT_DIR", "PORT", "HOST"] {
                std::env::remove_var(var);
            }
        }
    }

    #[test]
    #[serial]
    fn test_check_config_requires_api_key() {
        clear_env();
        let err = check_config(None).unwrap_err();
        assert!(err.to_string().contains("Realtime provider"));
    }

    #[test]
    #[serial]
    fn test_check_config_renders_redacted_yaml() {
        clear_env();
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yaml");
        let transcripts = temp_dir.path().join("transcripts");
        fs::write(
            &config_path,
            format!(
                r#"
providers:
  openai_api_key: "sk-check"
transcript:
  dir: "{}"
tools:
  - name: "lookup"
    url: "https://tools.example.com/lookup"
"#,
                transcripts.display()
            ),
        )
        .unwrap();

        let rendered = check_config(Some(&config_path)).unwrap();
        assert!(!rendered.contains("sk-check"));
        assert!(rendered.contains("lookup"));
        assert!(transcripts.join("sessions.json").exists());
    }
}
