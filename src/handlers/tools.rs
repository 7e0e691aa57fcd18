//! Webhook tools outside a voice session.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::tools::{ToolDefinition, ToolError, success_payload};
use crate::errors::{AppError, AppResult};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct ToolListResponse {
    pub tools: Vec<ToolDefinition>,
    pub count: usize,
}

/// `GET /tools`
pub async fn list_tools(State(state): State<Arc<AppState>>) -> Json<ToolListResponse> {
    let tools = state.build_tool_registry().definitions();
    Json(ToolListResponse {
        count: tools.len(),
        tools,
    })
}

/// `POST /execute/{tool_name}`
///
/// Runs one configured tool with the request body as its arguments, under
/// the same timeout and approval policy a session applies.
pub async fn execute_tool(
    State(state): State<Arc<AppState>>,
    Path(tool_name): Path<String>,
    Json(arguments): Json<Value>,
) -> AppResult<Response> {
    let registry = state.build_tool_registry();
    let tool = registry
        .get(&tool_name)
        .ok_or_else(|| AppError::NotFound(format!("tool {tool_name}")))?;

    if !state.config.approval_policy.allows(tool.dangerous) {
        warn!(tool = %tool_name, "Refusing dangerous tool under safe-only policy");
        let payload = ToolError::Denied(tool_name).to_payload();
        return Ok((StatusCode::FORBIDDEN, Json(payload)).into_response());
    }

    let timeout = Duration::from_secs(state.config.tool_timeout_seconds);
    let started = Instant::now();
    let result = match tokio::time::timeout(
        timeout,
        tool.handler.call(arguments, CancellationToken::new()),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(ToolError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        }),
    };
    info!(
        tool = %tool_name,
        success = result.is_ok(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Tool executed over HTTP"
    );

    let response = match result {
        Ok(output) => (StatusCode::OK, Json(success_payload(output))),
        Err(err @ ToolError::Timeout { .. }) => (StatusCode::GATEWAY_TIMEOUT, Json(err.to_payload())),
        Err(err) => (StatusCode::BAD_GATEWAY, Json(err.to_payload())),
    };
    Ok(response.into_response())
}
