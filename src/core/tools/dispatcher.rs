//! Tool call dispatcher.
//!
//! Calls are grouped per response. When the response is done and every call
//! it issued has resolved, the dispatcher reports a single continuation so
//! the session requests exactly one follow-up response per batch.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{
    ApprovalPolicy, ToolError, ToolHandler, ToolRegistry, ToolResult, success_payload,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Streaming,
    Complete,
    Executing,
    Done,
    Failed,
}

/// An in-flight tool invocation.
#[derive(Debug, Clone)]
pub struct PendingToolCall {
    pub call_id: String,
    pub response_id: String,
    pub name: Option<String>,
    pub raw_arguments: String,
    pub status: CallStatus,
    pub started_at: Instant,
    cancel: CancellationToken,
}

impl PendingToolCall {
    fn new(call_id: &str, response_id: &str, name: Option<&str>) -> Self {
        Self {
            call_id: call_id.to_string(),
            response_id: response_id.to_string(),
            name: name.map(str::to_string),
            raw_arguments: String::new(),
            status: CallStatus::Streaming,
            started_at: Instant::now(),
            cancel: CancellationToken::new(),
        }
    }
}

/// A tool call ready to run off the session's event loop.
pub struct ToolExecution {
    pub call_id: String,
    pub name: String,
    pub arguments: Value,
    handler: Arc<dyn ToolHandler>,
    cancel: CancellationToken,
    timeout: Duration,
}

impl std::fmt::Debug for ToolExecution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolExecution")
            .field("call_id", &self.call_id)
            .field("name", &self.name)
            .field("arguments", &self.arguments)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ToolExecution {
    /// Run the handler, bounded by the timeout and the call's cancellation
    /// token. Always yields an outcome.
    pub async fn run(self) -> ToolOutcome {
        let ToolExecution {
            call_id,
            name,
            arguments,
            handler,
            cancel,
            timeout,
        } = self;
        let started = Instant::now();

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ToolError::Cancelled),
            outcome = tokio::time::timeout(timeout, handler.call(arguments, cancel.clone())) => {
                match outcome {
                    Ok(result) => result,
                    Err(_) => Err(ToolError::Timeout {
                        timeout_ms: timeout.as_millis() as u64,
                    }),
                }
            }
        };

        ToolOutcome {
            call_id,
            name,
            result,
            elapsed: started.elapsed(),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Result of one tool call.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub call_id: String,
    pub name: String,
    pub result: ToolResult<Value>,
    pub elapsed: Duration,
}

impl ToolOutcome {
    pub fn failed(call_id: &str, name: &str, error: ToolError) -> Self {
        Self {
            call_id: call_id.to_string(),
            name: name.to_string(),
            result: Err(error),
            elapsed: Duration::ZERO,
        }
    }

    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn payload(&self) -> Value {
        match &self.result {
            Ok(output) => success_payload(output.clone()),
            Err(err) => err.to_payload(),
        }
    }
}

/// What the caller must do with a completed argument stream.
#[derive(Debug)]
pub enum DispatchAction {
    /// Spawn the execution and feed its outcome back through
    /// [`ToolCallDispatcher::complete`].
    Execute(ToolExecution),
    /// The call failed before execution; feed the outcome back right away.
    Resolved(ToolOutcome),
}

/// A tool outcome accepted into the conversation.
#[derive(Debug, Clone)]
pub struct ToolResolution {
    pub call_id: String,
    pub name: String,
    pub response_id: String,
    pub payload: Value,
    pub success: bool,
    /// Set on the resolution that closes its response's batch.
    pub continue_response: bool,
}

#[derive(Debug, Default)]
struct Batch {
    outstanding: HashSet<String>,
    resolved: usize,
    sealed: bool,
}

#[derive(Debug)]
pub struct ToolCallDispatcher {
    pending: HashMap<String, PendingToolCall>,
    /// Call ids whose arguments completed; never dispatched again.
    dispatched: HashSet<String>,
    batches: HashMap<String, Batch>,
    timeout: Duration,
    approval: ApprovalPolicy,
}

impl ToolCallDispatcher {
    pub fn new(timeout: Duration, approval: ApprovalPolicy) -> Self {
        Self {
            pending: HashMap::new(),
            dispatched: HashSet::new(),
            batches: HashMap::new(),
            timeout,
            approval,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn pending(&self, call_id: &str) -> Option<&PendingToolCall> {
        self.pending.get(call_id)
    }

    /// Number of calls currently executing.
    pub fn executing(&self) -> usize {
        self.pending
            .values()
            .filter(|call| call.status == CallStatus::Executing)
            .count()
    }

    /// Buffer a streamed argument fragment.
    pub fn on_argument_delta(
        &mut self,
        response_id: &str,
        call_id: &str,
        name: Option<&str>,
        delta: &str,
    ) {
        if self.dispatched.contains(call_id) {
            tracing::debug!(call_id, "Ignoring argument delta for dispatched call");
            return;
        }
        let call = self
            .pending
            .entry(call_id.to_string())
            .or_insert_with(|| PendingToolCall::new(call_id, response_id, name));
        if call.name.is_none() {
            call.name = name.map(str::to_string);
        }
        call.raw_arguments.push_str(delta);
    }

    /// Arguments for `call_id` are complete.
    ///
    /// `arguments`, when given, replaces whatever was streamed. A second
    /// completion for the same call id fails with
    /// [`ToolError::DuplicateCallId`] and nothing runs.
    pub fn on_arguments_done(
        &mut self,
        response_id: &str,
        call_id: &str,
        name: Option<&str>,
        arguments: Option<&str>,
        registry: &ToolRegistry,
    ) -> ToolResult<DispatchAction> {
        if !self.dispatched.insert(call_id.to_string()) {
            tracing::warn!(call_id, "Duplicate tool call completion rejected");
            return Err(ToolError::DuplicateCallId(call_id.to_string()));
        }

        let mut call = self
            .pending
            .remove(call_id)
            .unwrap_or_else(|| PendingToolCall::new(call_id, response_id, name));
        if let Some(name) = name {
            call.name = Some(name.to_string());
        }
        if let Some(arguments) = arguments {
            call.raw_arguments = arguments.to_string();
        }
        call.status = CallStatus::Complete;
        let name = call.name.clone().unwrap_or_default();

        self.batches
            .entry(call.response_id.clone())
            .or_default()
            .outstanding
            .insert(call_id.to_string());

        let tool = match registry.get(&name) {
            Some(tool) => tool,
            None => return Ok(self.fail_early(call, &name, ToolError::UnknownTool(name.clone()))),
        };
        if !self.approval.allows(tool.dangerous) {
            return Ok(self.fail_early(call, &name, ToolError::Denied(name.clone())));
        }

        let raw = call.raw_arguments.trim();
        let parsed = if raw.is_empty() {
            Ok(Value::Object(Default::default()))
        } else {
            serde_json::from_str::<Value>(raw)
        };
        let arguments = match parsed {
            Ok(value) => value,
            Err(e) => {
                let error = ToolError::InvalidArguments {
                    received: call.raw_arguments.clone(),
                    reason: e.to_string(),
                };
                return Ok(self.fail_early(call, &name, error));
            }
        };

        let handler = tool.handler.clone();
        call.status = CallStatus::Executing;
        call.started_at = Instant::now();
        let cancel = call.cancel.clone();
        self.pending.insert(call_id.to_string(), call);

        tracing::info!(call_id, tool = %name, "Dispatching tool call");
        Ok(DispatchAction::Execute(ToolExecution {
            call_id: call_id.to_string(),
            name,
            arguments,
            handler,
            cancel,
            timeout: self.timeout,
        }))
    }

    fn fail_early(&mut self, mut call: PendingToolCall, name: &str, error: ToolError) -> DispatchAction {
        tracing::warn!(call_id = %call.call_id, tool = name, error = %error, "Tool call failed before execution");
        call.status = CallStatus::Failed;
        let outcome = ToolOutcome::failed(&call.call_id, name, error);
        self.pending.insert(call.call_id.clone(), call);
        DispatchAction::Resolved(outcome)
    }

    /// Accept an outcome. Returns `None` when the call is no longer pending
    /// (its response was cancelled); the outcome must then be discarded.
    pub fn complete(&mut self, outcome: ToolOutcome) -> Option<ToolResolution> {
        let mut call = self.pending.remove(&outcome.call_id)?;
        call.status = if outcome.is_success() {
            CallStatus::Done
        } else {
            CallStatus::Failed
        };
        tracing::debug!(
            call_id = %call.call_id,
            status = ?call.status,
            elapsed_ms = outcome.elapsed.as_millis() as u64,
            "Tool call resolved"
        );

        let mut continue_response = false;
        if let Some(batch) = self.batches.get_mut(&call.response_id) {
            batch.outstanding.remove(&call.call_id);
            batch.resolved += 1;
            if batch.sealed && batch.outstanding.is_empty() {
                continue_response = true;
                self.batches.remove(&call.response_id);
            }
        }

        Some(ToolResolution {
            payload: outcome.payload(),
            success: outcome.is_success(),
            call_id: call.call_id,
            name: outcome.name,
            response_id: call.response_id,
            continue_response,
        })
    }

    /// The response issued all its calls. Returns `true` when its batch is
    /// already fully resolved and generation should continue now.
    pub fn seal_response(&mut self, response_id: &str) -> bool {
        let stale: Vec<String> = self
            .pending
            .values()
            .filter(|c| c.response_id == response_id && c.status == CallStatus::Streaming)
            .map(|c| c.call_id.clone())
            .collect();
        for call_id in stale {
            tracing::warn!(call_id, response_id, "Dropping tool call whose arguments never completed");
            self.pending.remove(&call_id);
        }

        let Some(batch) = self.batches.get_mut(response_id) else {
            return false;
        };
        batch.sealed = true;
        if batch.outstanding.is_empty() {
            let resolved = batch.resolved;
            self.batches.remove(response_id);
            return resolved > 0;
        }
        false
    }

    /// Cancel every call issued by a response. Executions are signalled
    /// through their cancellation token; their outcomes will be discarded.
    pub fn cancel_response(&mut self, response_id: &str) -> Vec<String> {
        let ids: Vec<String> = self
            .pending
            .values()
            .filter(|c| c.response_id == response_id)
            .map(|c| c.call_id.clone())
            .collect();
        for call_id in &ids {
            if let Some(call) = self.pending.remove(call_id) {
                call.cancel.cancel();
            }
        }
        self.batches.remove(response_id);
        if !ids.is_empty() {
            tracing::info!(response_id, cancelled = ids.len(), "Cancelled tool calls");
        }
        ids
    }

    pub fn cancel_all(&mut self) -> Vec<String> {
        let ids: Vec<String> = self.pending.keys().cloned().collect();
        for (_, call) in self.pending.drain() {
            call.cancel.cancel();
        }
        self.batches.clear();
        ids
    }
}
