//! Webhook tools: arguments are POSTed as JSON to a configured URL.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{ToolDefinition, ToolError, ToolHandler, ToolResult};

/// Configuration of a webhook tool, as found under `tools:` in YAML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpToolConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON schema of the arguments object
    #[serde(default)]
    pub parameters: Option<Value>,
    pub url: String,
    /// Per-request timeout; the session's tool timeout still applies.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    /// Refused under the safe-only approval policy.
    #[serde(default)]
    pub dangerous: bool,
    /// Extra request headers; values are redacted when serialized.
    #[serde(default, serialize_with = "redact_values")]
    pub headers: HashMap<String, String>,
}

fn redact_values<S: serde::Serializer>(
    headers: &HashMap<String, String>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    use serde::ser::SerializeMap;
    let mut map = serializer.serialize_map(Some(headers.len()))?;
    for key in headers.keys() {
        map.serialize_entry(key, "***")?;
    }
    map.end()
}

impl HttpToolConfig {
    pub fn definition(&self) -> ToolDefinition {
        let parameters = self
            .parameters
            .clone()
            .unwrap_or_else(|| serde_json::json!({ "type": "object", "properties": {} }));
        ToolDefinition::new(self.name.clone(), self.description.clone(), parameters)
    }
}

pub struct HttpTool {
    client: reqwest::Client,
    url: url::Url,
    timeout: Option<Duration>,
    headers: HashMap<String, String>,
}

impl HttpTool {
    pub fn from_config(client: reqwest::Client, config: &HttpToolConfig) -> Result<Self, url::ParseError> {
        Ok(Self {
            client,
            url: url::Url::parse(&config.url)?,
            timeout: config.timeout_seconds.map(Duration::from_secs),
            headers: config.headers.clone(),
        })
    }

    async fn post(&self, arguments: Value) -> ToolResult<Value> {
        let mut request = self
            .client
            .post(self.url.clone())
            .header("Content-Type", "application/json");
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }

        let response = request
            .json(&arguments)
            .send()
            .await
            .map_err(|e| ToolError::Execution(format!("request to {} failed: {e}", self.url)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ToolError::Execution(format!("failed to read response body: {e}")))?;

        if !status.is_success() {
            return Err(ToolError::Execution(format!("HTTP {status}: {body}")));
        }

        debug!(url = %self.url, status = %status, "Webhook tool responded");
        Ok(serde_json::from_str(&body).unwrap_or(Value::String(body)))
    }
}

#[async_trait]
impl ToolHandler for HttpTool {
    async fn call(&self, arguments: Value, cancel: CancellationToken) -> ToolResult<Value> {
        tokio::select! {
            _ = cancel.cancelled() => Err(ToolError::Cancelled),
            result = self.post(arguments) => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_yaml() {
        let yaml = r#"
name: lookup_order
description: Look up an order
url: https://example.com/orders
timeout_seconds: 5
dangerous: true
parameters:
  type: object
  properties:
    order_id:
      type: string
"#;
        let config: HttpToolConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.name, "lookup_order");
        assert!(config.dangerous);
        let definition = config.definition();
        assert_eq!(definition.parameters["properties"]["order_id"]["type"], "string");
    }

    #[test]
    fn test_definition_defaults_parameters() {
        let config: HttpToolConfig =
            serde_yaml::from_str("name: ping\nurl: http://localhost/ping\n").unwrap();
        assert_eq!(config.definition().parameters["type"], "object");
    }

    #[test]
    fn test_invalid_url_rejected() {
        let config: HttpToolConfig =
            serde_yaml::from_str("name: ping\nurl: not a url\n").unwrap();
        assert!(HttpTool::from_config(reqwest::Client::new(), &config).is_err());
    }
}
