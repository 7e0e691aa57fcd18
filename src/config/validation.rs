//! Configuration validation logic.

use std::collections::HashSet;

use crate::core::tools::HttpToolConfig;

pub(super) fn validate_session(
    tool_timeout_seconds: u64,
    cancel_ack_timeout_ms: u64,
    history_max_tokens: usize,
    history_retain_ratio: f32,
) -> Result<(), Box<dyn std::error::Error>> {
    if tool_timeout_seconds == 0 {
        return Err("tool_timeout_seconds must be greater than 0".into());
    }
    if cancel_ack_timeout_ms == 0 {
        return Err("cancel_ack_timeout_ms must be greater than 0".into());
    }
    if history_max_tokens == 0 {
        return Err("history_max_tokens must be greater than 0".into());
    }
    if !(history_retain_ratio > 0.0 && history_retain_ratio <= 1.0) {
        return Err(format!(
            "history_retain_ratio must be in (0, 1], got {history_retain_ratio}"
        )
        .into());
    }
    Ok(())
}

/// Webhook tools need unique names and parseable URLs.
pub(super) fn validate_tools(tools: &[HttpToolConfig]) -> Result<(), Box<dyn std::error::Error>> {
    let mut seen = HashSet::new();
    for tool in tools {
        if tool.name.trim().is_empty() {
            return Err("tool name must not be empty".into());
        }
        if !seen.insert(tool.name.as_str()) {
            return Err(format!("duplicate tool name '{}'", tool.name).into());
        }
        let url = url::Url::parse(&tool.url)
            .map_err(|e| format!("tool '{}' has an invalid url '{}': {e}", tool.name, tool.url))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(format!("tool '{}' url must be http or https", tool.name).into());
        }
        if tool.timeout_seconds == Some(0) {
            return Err(format!("tool '{}' timeout_seconds must be greater than 0", tool.name).into());
        }
    }
    Ok(())
}
