//! Tool calling.
//!
//! Applications register [`ToolHandler`]s with a JSON-schema
//! [`ToolDefinition`]. The [`ToolCallDispatcher`] buffers streamed call
//! arguments, runs each call id at most once with a timeout, and turns every
//! outcome (including failures) into a structured output payload.

mod dispatcher;
mod http;
mod registry;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use dispatcher::{
    CallStatus, DispatchAction, PendingToolCall, ToolCallDispatcher, ToolExecution, ToolOutcome,
    ToolResolution,
};
pub use http::{HttpTool, HttpToolConfig};
pub use registry::{DuplicateToolError, RegisteredTool, ToolRegistry};

/// Default tool execution timeout.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors produced while running a tool call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolError {
    /// The accumulated argument string is not valid JSON
    #[error("Invalid arguments: {reason}")]
    InvalidArguments { received: String, reason: String },

    /// The handler reported a failure
    #[error("Tool execution failed: {0}")]
    Execution(String),

    /// The handler did not finish within the configured timeout
    #[error("Tool timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// A second execution was requested for a call id
    #[error("Duplicate call id: {0}")]
    DuplicateCallId(String),

    /// No tool is registered under the requested name
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    /// The approval policy refused the call
    #[error("Tool call denied: {0}")]
    Denied(String),

    /// The response that issued the call was cancelled
    #[error("Tool call cancelled")]
    Cancelled,
}

pub type ToolResult<T> = Result<T, ToolError>;

impl ToolError {
    /// Structured payload recorded as the call's output.
    pub fn to_payload(&self) -> Value {
        match self {
            ToolError::InvalidArguments { received, reason } => json!({
                "error": "invalid_arguments",
                "received": received,
                "message": reason,
            }),
            ToolError::Execution(message) => json!({
                "error": "execution_failed",
                "message": message,
            }),
            ToolError::Timeout { timeout_ms } => json!({
                "error": "timeout",
                "timeout_ms": timeout_ms,
            }),
            ToolError::DuplicateCallId(call_id) => json!({
                "error": "duplicate_call_id",
                "call_id": call_id,
            }),
            ToolError::UnknownTool(name) => json!({
                "error": "unknown_tool",
                "name": name,
            }),
            ToolError::Denied(name) => json!({
                "error": "denied",
                "name": name,
            }),
            ToolError::Cancelled => json!({ "error": "cancelled" }),
        }
    }
}

/// Payload recorded for a successful call.
pub fn success_payload(output: Value) -> Value {
    json!({ "success": true, "output": output })
}

/// Schema a tool is advertised to the provider with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON schema of the arguments object
    #[serde(default = "empty_parameters")]
    pub parameters: Value,
}

fn empty_parameters() -> Value {
    json!({ "type": "object", "properties": {} })
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// Which tool calls may run without confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalPolicy {
    /// Every registered tool runs.
    #[default]
    AutoApprove,
    /// Tools registered as dangerous are refused.
    SafeOnly,
}

impl ApprovalPolicy {
    pub fn allows(&self, dangerous: bool) -> bool {
        match self {
            ApprovalPolicy::AutoApprove => true,
            ApprovalPolicy::SafeOnly => !dangerous,
        }
    }
}

impl std::str::FromStr for ApprovalPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto_approve" | "auto" => Ok(ApprovalPolicy::AutoApprove),
            "safe_only" | "safe" => Ok(ApprovalPolicy::SafeOnly),
            other => Err(format!("unknown approval policy '{other}'")),
        }
    }
}

/// An application-supplied tool implementation.
///
/// Handlers are invoked at most once per call id. `cancel` fires when the
/// response that issued the call is cancelled; handlers that can stop early
/// should watch it, the rest may run to completion and their output is
/// discarded.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, arguments: Value, cancel: CancellationToken) -> ToolResult<Value>;
}

/// Adapter turning an async closure into a [`ToolHandler`].
pub struct FnTool<F> {
    f: F,
}

impl<F, Fut> FnTool<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = ToolResult<Value>> + Send,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> ToolHandler for FnTool<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = ToolResult<Value>> + Send,
{
    async fn call(&self, arguments: Value, _cancel: CancellationToken) -> ToolResult<Value> {
        (self.f)(arguments).await
    }
}
