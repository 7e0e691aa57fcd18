use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::interruption::DEFAULT_CANCEL_ACK_TIMEOUT;
use crate::core::tools::{ApprovalPolicy, DEFAULT_TOOL_TIMEOUT};
use crate::core::turn_detect::{TurnDetectionPolicy, VadSource};

/// Per-session tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub turn_detection: TurnDetectionPolicy,
    pub vad_source: VadSource,
    /// Request a response as soon as a user turn completes.
    pub auto_response: bool,
    pub tool_timeout: Duration,
    pub cancel_ack_timeout: Duration,
    pub approval_policy: ApprovalPolicy,
    /// Token budget of the conversation history.
    pub history_max_tokens: usize,
    /// Share of the budget kept when the history is evicted.
    pub history_retain_ratio: f32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            turn_detection: TurnDetectionPolicy::default(),
            vad_source: VadSource::Local,
            auto_response: true,
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
            cancel_ack_timeout: DEFAULT_CANCEL_ACK_TIMEOUT,
            approval_policy: ApprovalPolicy::AutoApprove,
            history_max_tokens: 32_000,
            history_retain_ratio: 0.75,
        }
    }
}

impl SessionConfig {
    pub fn with_turn_detection(mut self, policy: TurnDetectionPolicy) -> Self {
        self.turn_detection = policy;
        self
    }

    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    pub fn with_auto_response(mut self, auto_response: bool) -> Self {
        self.auto_response = auto_response;
        self
    }
}
