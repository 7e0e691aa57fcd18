//! The session state machine.
//!
//! Synchronous and single-owner: every input (transport event, application
//! call, tool outcome, timer poll) is applied to completion before the next
//! one, so the cancel-then-truncate sequence of an interruption can never
//! interleave with another transition. Side effects are queued as outbound
//! commands, application notifications and tool executions, which the
//! caller drains after each input.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;

use super::config::SessionConfig;
use super::events::{
    InboundEvent, OutboundCommand, ResponseReason, ResponseStatus, SessionFault,
    SessionNotification,
};
use super::state::{SessionState, Transition};
use super::{SessionError, SessionResult};
use crate::core::history::{
    AudioContent, ConversationItem, HistoryStore, ItemContent, ItemRole,
};
use crate::core::interruption::{InterruptionCoordinator, InterruptionOutcome, TruncationAction};
use crate::core::playback::PlaybackTracker;
use crate::core::tools::{
    DispatchAction, ToolCallDispatcher, ToolDefinition, ToolExecution, ToolHandler, ToolOutcome,
    ToolRegistry,
};
use crate::core::turn_detect::{TurnDetectionPolicy, TurnDetector, TurnEvent};

/// Finished output items whose playback is still tracked.
const MAX_TRAILING_ITEMS: usize = 4;

/// The response currently pending or streaming.
#[derive(Debug, Clone, Default)]
struct ActiveResponse {
    /// Provider id, known once the response started.
    id: Option<String>,
    output_item: Option<String>,
    /// The output item carries a local id the provider has not named yet.
    provisional: bool,
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub state: SessionState,
    pub active_response_id: Option<String>,
    pub response_pending: bool,
    pub history_len: usize,
    pub executing_tools: usize,
    pub turn_detection: &'static str,
    pub detection_lost: bool,
    pub closed: bool,
}

pub struct SessionStateMachine {
    session_id: String,
    config: SessionConfig,
    state: SessionState,
    closed: bool,
    detector: TurnDetector,
    tools: ToolRegistry,
    dispatcher: ToolCallDispatcher,
    interruption: InterruptionCoordinator,
    history: HistoryStore,
    playback: PlaybackTracker,
    active: Option<ActiveResponse>,
    /// Responses we cancelled; their late events are dropped.
    cancelled: HashSet<String>,
    /// Provider id of the input item of the open user turn.
    user_item: Option<String>,
    /// Finished output items whose playback may still be running, oldest
    /// first.
    trailing: Vec<String>,
    commands: Vec<OutboundCommand>,
    notifications: Vec<SessionNotification>,
    executions: Vec<ToolExecution>,
}

impl SessionStateMachine {
    pub fn new(session_id: impl Into<String>, config: SessionConfig) -> Self {
        let session_id = session_id.into();
        tracing::debug!(
            session_id = %session_id,
            turn_detection = config.turn_detection.name(),
            "Creating session state machine"
        );
        Self {
            detector: TurnDetector::new(config.turn_detection.clone(), config.vad_source),
            dispatcher: ToolCallDispatcher::new(config.tool_timeout, config.approval_policy),
            interruption: InterruptionCoordinator::new(config.cancel_ack_timeout),
            history: HistoryStore::new(config.history_max_tokens),
            playback: PlaybackTracker::new(),
            tools: ToolRegistry::new(),
            session_id,
            config,
            state: SessionState::Idle,
            closed: false,
            active: None,
            cancelled: HashSet::new(),
            user_item: None,
            trailing: Vec::new(),
            commands: Vec::new(),
            notifications: Vec::new(),
            executions: Vec::new(),
        }
    }

    /// Start with a pre-built tool registry.
    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    /// Seed history with items already present in the provider conversation,
    /// e.g. when resuming a stored session. Items with an id already in
    /// history are skipped.
    pub fn with_history(mut self, items: impl IntoIterator<Item = ConversationItem>) -> Self {
        for item in items {
            if let Err(e) = self.history.append(item) {
                tracing::debug!(session_id = %self.session_id, error = %e, "Skipping seeded item");
            }
        }
        self
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    pub fn playback(&self) -> &PlaybackTracker {
        &self.playback
    }

    pub fn turn_detection(&self) -> &TurnDetectionPolicy {
        self.detector.policy()
    }

    pub fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.tools.definitions()
    }

    pub fn active_response_id(&self) -> Option<&str> {
        self.active.as_ref().and_then(|a| a.id.as_deref())
    }

    pub fn has_active_response(&self) -> bool {
        self.active.is_some()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id.clone(),
            state: self.state,
            active_response_id: self.active_response_id().map(str::to_string),
            response_pending: self.active.is_some(),
            history_len: self.history.len(),
            executing_tools: self.dispatcher.executing(),
            turn_detection: self.detector.policy().name(),
            detection_lost: self.detector.is_detection_lost(),
            closed: self.closed,
        }
    }

    // =========================================================================
    // Output queues
    // =========================================================================

    pub fn take_commands(&mut self) -> Vec<OutboundCommand> {
        std::mem::take(&mut self.commands)
    }

    pub fn take_notifications(&mut self) -> Vec<SessionNotification> {
        std::mem::take(&mut self.notifications)
    }

    /// Tool executions to run concurrently; feed each outcome back through
    /// [`SessionStateMachine::tool_finished`].
    pub fn take_executions(&mut self) -> Vec<ToolExecution> {
        std::mem::take(&mut self.executions)
    }

    // =========================================================================
    // Application operations
    // =========================================================================

    pub fn register_tool(
        &mut self,
        definition: ToolDefinition,
        handler: Arc<dyn ToolHandler>,
    ) -> SessionResult<()> {
        self.ensure_open()?;
        self.tools.register(definition, handler)?;
        Ok(())
    }

    /// Register a tool refused under the safe-only approval policy.
    pub fn register_dangerous_tool(
        &mut self,
        definition: ToolDefinition,
        handler: Arc<dyn ToolHandler>,
    ) -> SessionResult<()> {
        self.ensure_open()?;
        self.tools.register_dangerous(definition, handler)?;
        Ok(())
    }

    pub fn set_turn_detection(&mut self, policy: TurnDetectionPolicy) -> SessionResult<()> {
        self.ensure_open()?;
        self.config.turn_detection = policy.clone();
        self.detector.set_policy(policy);
        Ok(())
    }

    /// Open a user turn explicitly (push-to-talk press).
    pub fn begin_user_turn(&mut self, now_ms: u64) -> SessionResult<()> {
        self.ensure_open()?;
        let event = self.detector.begin_manual_turn(now_ms);
        self.on_turn_event(event, now_ms);
        Ok(())
    }

    /// Force completion of the open user turn.
    pub fn submit_user_turn(&mut self, now_ms: u64) -> SessionResult<()> {
        self.ensure_open()?;
        if self.state != SessionState::UserSpeaking {
            return Err(SessionError::InvalidState {
                operation: "submit_user_turn",
                state: self.state,
            });
        }
        match self.detector.force_complete(now_ms) {
            Some(event) => self.on_turn_event(event, now_ms),
            None => self.complete_turn(),
        }
        Ok(())
    }

    /// Add a typed user message. Returns the new item id.
    pub fn submit_user_text(&mut self, text: &str) -> SessionResult<String> {
        self.ensure_open()?;
        self.ensure_idle("submit_user_text")?;

        let item = ConversationItem::user_message(ItemContent::text(text));
        let item_id = self.history.append(item)?;
        self.commands.push(OutboundCommand::CreateUserMessage {
            item_id: item_id.clone(),
            text: text.to_string(),
        });
        self.notify_finalized(&item_id);
        if self.config.auto_response {
            self.start_response(None, ResponseReason::Turn);
            self.transition(Transition::ResponseRequested);
        }
        self.enforce_history_budget();
        Ok(item_id)
    }

    /// Explicitly trigger generation. At most one response is ever in
    /// flight.
    pub fn request_response(&mut self, instructions: Option<String>) -> SessionResult<()> {
        self.ensure_open()?;
        self.ensure_idle("request_response")?;
        self.start_response(instructions, ResponseReason::Explicit);
        self.transition(Transition::ResponseRequested);
        Ok(())
    }

    /// Terminate the session: cancel any active response and in-flight tool
    /// calls. Further operations fail with [`SessionError::SessionClosed`].
    pub fn close(&mut self, now_ms: u64) {
        if self.closed {
            return;
        }
        self.cancel_active(now_ms);
        self.dispatcher.cancel_all();
        self.interruption.clear();
        self.detector.reset();
        self.transition(Transition::Reset);
        self.closed = true;
        self.notifications.push(SessionNotification::Closed);
        tracing::info!(session_id = %self.session_id, "Session closed");
    }

    /// Playback-progress callback from the sink.
    pub fn on_audio_played(&mut self, item_id: &str, ms_played: u64) -> bool {
        if !self.playback.on_played(item_id, ms_played) {
            return false;
        }
        let drained = self
            .playback
            .position(item_id)
            .is_some_and(|p| p.unplayed_ms() == 0);
        if drained && let Some(index) = self.trailing.iter().position(|id| id == item_id) {
            self.trailing.remove(index);
            self.playback.finish_item(item_id);
        }
        true
    }

    /// Outcome of a tool execution handed out by
    /// [`SessionStateMachine::take_executions`].
    pub fn tool_finished(&mut self, outcome: ToolOutcome) {
        if self.closed {
            tracing::debug!(call_id = %outcome.call_id, "Dropping tool outcome for closed session");
            return;
        }
        self.resolve_tool(outcome);
        self.enforce_history_budget();
    }

    /// Fire timers that are due at `now_ms`.
    pub fn poll(&mut self, now_ms: u64) {
        if self.closed {
            return;
        }
        if let Some(event) = self.detector.poll(now_ms) {
            self.on_turn_event(event, now_ms);
        }
        for response_id in self.interruption.poll(now_ms) {
            // late events for it now fall through as unknown or stale
            self.cancelled.remove(&response_id);
            self.fault(SessionFault::CancellationTimeout { response_id });
        }
    }

    /// Earliest session time at which [`SessionStateMachine::poll`] has work.
    pub fn next_deadline(&self) -> Option<u64> {
        match (self.detector.next_deadline(), self.interruption.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    // =========================================================================
    // Transport events
    // =========================================================================

    pub fn handle_event(&mut self, event: InboundEvent, now_ms: u64) {
        if self.closed {
            tracing::trace!(event = event.kind(), "Ignoring event for closed session");
            return;
        }
        tracing::trace!(session_id = %self.session_id, event = event.kind(), state = %self.state, "Inbound event");

        match event {
            InboundEvent::SpeechStarted { item_id, .. } => {
                if item_id.is_some() {
                    self.user_item = item_id;
                }
                if let Some(event) = self.detector.on_speech_started(now_ms) {
                    self.on_turn_event(event, now_ms);
                }
            }
            InboundEvent::SpeechStopped { item_id, .. } => {
                if item_id.is_some() {
                    self.user_item = item_id;
                }
                for event in self.detector.on_speech_stopped(now_ms) {
                    self.on_turn_event(event, now_ms);
                }
            }
            InboundEvent::InputAudioLevel { level } => {
                for event in self.detector.on_energy(level, now_ms) {
                    self.on_turn_event(event, now_ms);
                }
            }
            InboundEvent::SemanticTurnVerdict { complete } => {
                if let Some(event) = self.detector.on_semantic_verdict(complete, now_ms) {
                    self.on_turn_event(event, now_ms);
                }
            }
            InboundEvent::InputTranscript {
                item_id,
                transcript,
            } => self.on_input_transcript(item_id, transcript),
            InboundEvent::ToolCallArgumentDelta {
                response_id,
                call_id,
                name,
                delta,
            } => {
                if self.is_stale(&response_id) {
                    return;
                }
                self.dispatcher
                    .on_argument_delta(&response_id, &call_id, name.as_deref(), &delta);
            }
            InboundEvent::ToolCallDone {
                response_id,
                call_id,
                name,
                arguments,
            } => {
                if self.is_stale(&response_id) {
                    tracing::debug!(call_id = %call_id, response_id = %response_id, "Dropping tool call of inactive response");
                    return;
                }
                self.on_tool_call_done(&response_id, &call_id, name, &arguments);
            }
            InboundEvent::ResponseStarted { response_id } => self.on_response_started(response_id),
            InboundEvent::ResponseAudioDelta {
                response_id,
                item_id,
                audio,
                sample_rate,
            } => self.on_audio_delta(response_id, &item_id, audio, sample_rate),
            InboundEvent::ResponseTranscriptDelta {
                response_id,
                item_id,
                delta,
            } => self.on_transcript_delta(&response_id, &item_id, &delta),
            InboundEvent::ResponseDone {
                response_id,
                status,
            } => self.on_response_done(&response_id, status),
            InboundEvent::Error { code, message } => self.on_provider_error(code, message),
            InboundEvent::Malformed { detail } => {
                tracing::warn!(session_id = %self.session_id, detail = %detail, "Malformed transport event");
                self.fault(SessionFault::Protocol { message: detail });
                self.reset_to_idle(now_ms);
            }
            InboundEvent::DetectionLost => {
                if let Some(event) = self.detector.signal_lost() {
                    self.on_turn_event(event, now_ms);
                }
            }
            InboundEvent::DetectionRestored => {
                self.detector.signal_restored();
            }
        }

        self.enforce_history_budget();
    }

    // =========================================================================
    // Turn handling
    // =========================================================================

    fn on_turn_event(&mut self, event: TurnEvent, now_ms: u64) {
        match event {
            TurnEvent::SpeechStarted { .. } => self.on_speech_started(now_ms),
            TurnEvent::SpeechStopped { audio_end_ms } => {
                tracing::debug!(session_id = %self.session_id, audio_end_ms, "Speech stopped");
            }
            TurnEvent::TurnComplete { reason, .. } => {
                tracing::debug!(session_id = %self.session_id, ?reason, "Turn complete");
                self.complete_turn();
            }
            TurnEvent::DetectionLost => {
                self.fault(SessionFault::DetectionLost);
                self.reset_to_idle(now_ms);
            }
            TurnEvent::DetectionRestored => {}
        }
    }

    fn on_speech_started(&mut self, now_ms: u64) {
        match self.state {
            SessionState::Idle => {
                self.reconcile_trailing();
                self.transition(Transition::SpeechStarted);
            }
            SessionState::UserSpeaking | SessionState::Interrupted => {
                tracing::trace!(session_id = %self.session_id, "Speech already in progress");
            }
            SessionState::Processing => {
                tracing::info!(session_id = %self.session_id, "User resumed speaking; cancelling pending response");
                self.cancel_active(now_ms);
                self.reconcile_trailing();
                self.transition(Transition::SpeechStarted);
            }
            SessionState::AgentSpeaking => {
                self.transition(Transition::SpeechStarted);
                self.cancel_active(now_ms);
                self.reconcile_trailing();
                self.transition(Transition::InterruptionResolved);
            }
        }
    }

    fn complete_turn(&mut self) {
        if self.state != SessionState::UserSpeaking {
            tracing::debug!(state = %self.state, "Turn completion outside a user turn ignored");
            return;
        }

        let item_id = self
            .user_item
            .take()
            .unwrap_or_else(|| format!("item_{}", uuid::Uuid::new_v4().simple()));
        if !self.history.contains(&item_id) {
            let item = ConversationItem::user_message(ItemContent::default()).with_id(&item_id);
            if let Err(e) = self.history.append(item) {
                tracing::warn!(item_id = %item_id, error = %e, "Failed to record user turn");
            }
        }
        self.commands.push(OutboundCommand::CommitTurn { item_id });

        if self.config.auto_response {
            self.transition(Transition::TurnComplete);
            self.start_response(None, ResponseReason::Turn);
        } else {
            self.transition(Transition::TurnCommitted);
        }
    }

    fn on_input_transcript(&mut self, item_id: Option<String>, transcript: String) {
        let target = item_id.filter(|id| self.history.contains(id)).or_else(|| {
            self.history
                .items()
                .iter()
                .rev()
                .find(|item| item.role == ItemRole::User)
                .map(|item| item.id.clone())
        });
        let Some(target) = target else {
            tracing::debug!("Input transcript without a user item");
            return;
        };
        if let Some(item) = self.history.get_mut(&target) {
            item.content.transcript = Some(transcript.clone());
        }
        self.notifications.push(SessionNotification::Transcript {
            item_id: target.clone(),
            role: ItemRole::User,
            text: transcript,
            is_final: true,
        });
        self.notify_finalized(&target);
    }

    // =========================================================================
    // Responses
    // =========================================================================

    fn ensure_open(&self) -> SessionResult<()> {
        if self.closed {
            return Err(SessionError::SessionClosed);
        }
        Ok(())
    }

    fn ensure_idle(&self, operation: &'static str) -> SessionResult<()> {
        if self.active.is_some() || self.state.has_response() {
            return Err(SessionError::ResponseAlreadyActive);
        }
        if self.state != SessionState::Idle {
            return Err(SessionError::InvalidState {
                operation,
                state: self.state,
            });
        }
        Ok(())
    }

    fn start_response(&mut self, instructions: Option<String>, reason: ResponseReason) {
        tracing::debug!(session_id = %self.session_id, ?reason, "Requesting response");
        self.commands.push(OutboundCommand::RequestResponse {
            instructions,
            reason,
        });
        self.active = Some(ActiveResponse::default());
    }

    /// Events of a response other than the active one.
    fn is_stale(&self, response_id: &str) -> bool {
        if self.cancelled.contains(response_id) {
            return true;
        }
        match &self.active {
            Some(active) => active.id.as_deref() != Some(response_id),
            None => true,
        }
    }

    fn on_response_started(&mut self, response_id: String) {
        if self.cancelled.contains(&response_id) {
            return;
        }
        let awaiting = self.state == SessionState::Processing
            && self.active.as_ref().is_some_and(|a| a.id.is_none());
        if !awaiting {
            tracing::warn!(
                session_id = %self.session_id,
                response_id = %response_id,
                state = %self.state,
                "Unexpected response; cancelling it"
            );
            self.commands.push(OutboundCommand::CancelResponse {
                response_id: Some(response_id.clone()),
            });
            self.cancelled.insert(response_id);
            return;
        }

        let item_id = format!("item_{}", uuid::Uuid::new_v4().simple());
        if let Some(active) = self.active.as_mut() {
            active.id = Some(response_id);
        }
        self.open_output_item(&item_id, true);
        self.transition(Transition::ResponseStarted);
    }

    fn open_output_item(&mut self, item_id: &str, provisional: bool) {
        let item = ConversationItem::assistant_message(ItemContent::default()).with_id(item_id);
        if let Err(e) = self.history.append(item) {
            tracing::warn!(item_id, error = %e, "Output item already recorded");
        }
        self.playback.begin_item(item_id);
        if let Some(active) = self.active.as_mut() {
            active.output_item = Some(item_id.to_string());
            active.provisional = provisional;
        }
    }

    /// Resolve the provider's output item id to the item being recorded.
    fn bind_output_item(&mut self, provider_item_id: &str) -> String {
        let (current, provisional) = match &self.active {
            Some(active) => (active.output_item.clone(), active.provisional),
            None => (None, false),
        };

        match current {
            Some(current) if current == provider_item_id => current,
            Some(current) if provisional => {
                match self.history.rename(&current, provider_item_id) {
                    Ok(()) => self.playback.rename_item(&current, provider_item_id),
                    Err(e) => {
                        tracing::warn!(item_id = provider_item_id, error = %e, "Could not adopt provider item id");
                        return current;
                    }
                }
                if let Some(active) = self.active.as_mut() {
                    active.output_item = Some(provider_item_id.to_string());
                    active.provisional = false;
                }
                provider_item_id.to_string()
            }
            Some(current) => {
                self.finalize_output_item(&current);
                self.open_output_item(provider_item_id, false);
                provider_item_id.to_string()
            }
            None => {
                self.open_output_item(provider_item_id, false);
                provider_item_id.to_string()
            }
        }
    }

    fn on_audio_delta(&mut self, response_id: String, item_id: &str, audio: Bytes, sample_rate: u32) {
        if self.is_stale(&response_id) || self.state != SessionState::AgentSpeaking {
            tracing::trace!(response_id = %response_id, "Dropping audio of inactive response");
            return;
        }
        let item_id = self.bind_output_item(item_id);
        let Some(item) = self.history.get_mut(&item_id) else {
            return;
        };
        let content = item
            .content
            .audio
            .get_or_insert_with(|| AudioContent::new(sample_rate));
        content.append(&audio);
        let generated_ms = content.duration_ms;
        self.playback.on_generated(&item_id, generated_ms);

        self.notifications.push(SessionNotification::Audio {
            response_id,
            item_id,
            data: audio,
        });
    }

    fn on_transcript_delta(&mut self, response_id: &str, item_id: &str, delta: &str) {
        if self.is_stale(response_id) || self.state != SessionState::AgentSpeaking {
            return;
        }
        let item_id = self.bind_output_item(item_id);
        if let Some(item) = self.history.get_mut(&item_id) {
            item.content
                .transcript
                .get_or_insert_with(String::new)
                .push_str(delta);
        }
        self.notifications.push(SessionNotification::Transcript {
            item_id,
            role: ItemRole::Assistant,
            text: delta.to_string(),
            is_final: false,
        });
    }

    fn finalize_output_item(&mut self, item_id: &str) {
        let empty = self
            .history
            .get(item_id)
            .is_none_or(|item| item.content.is_empty());
        if empty {
            // tool-only responses leave an unused placeholder
            let _ = self.history.remove(item_id);
            self.playback.finish_item(item_id);
            return;
        }

        if let Some(transcript) = self
            .history
            .get(item_id)
            .and_then(|item| item.content.transcript.clone())
        {
            self.notifications.push(SessionNotification::Transcript {
                item_id: item_id.to_string(),
                role: ItemRole::Assistant,
                text: transcript,
                is_final: true,
            });
        }
        self.notify_finalized(item_id);
        self.prune_trailing();
        self.trailing.push(item_id.to_string());
    }

    /// Stop tracking trailing items the sink has finished, keeping at most
    /// [`MAX_TRAILING_ITEMS`] once the new one is added.
    fn prune_trailing(&mut self) {
        let playback = &mut self.playback;
        self.trailing.retain(|id| {
            let pending = playback
                .position(id)
                .is_some_and(|p| !p.reported || p.unplayed_ms() > 0);
            if !pending {
                playback.finish_item(id);
            }
            pending
        });
        while self.trailing.len() >= MAX_TRAILING_ITEMS {
            let oldest = self.trailing.remove(0);
            tracing::debug!(item_id = %oldest, "Dropping playback tracking for old output item");
            self.playback.finish_item(&oldest);
        }
    }

    fn on_response_done(&mut self, response_id: &str, status: ResponseStatus) {
        if self.cancelled.remove(response_id) {
            self.interruption.acknowledge(response_id);
            tracing::debug!(response_id, "Cancellation acknowledged");
            return;
        }
        let is_active = self
            .active
            .as_ref()
            .is_some_and(|a| a.id.as_deref() == Some(response_id));
        if !is_active {
            tracing::debug!(response_id, "Completion of unknown response ignored");
            return;
        }

        let active = self.active.take().unwrap_or_default();
        if let Some(item_id) = active.output_item {
            self.finalize_output_item(&item_id);
        }

        match status {
            ResponseStatus::Failed { message } => {
                tracing::error!(session_id = %self.session_id, response_id, message = %message, "Response failed");
                self.dispatcher.cancel_response(response_id);
                self.fault(SessionFault::GenerationFailed {
                    response_id: Some(response_id.to_string()),
                    code: None,
                    message,
                });
                self.transition(Transition::Reset);
            }
            ResponseStatus::Cancelled => {
                self.dispatcher.cancel_response(response_id);
                self.transition(Transition::ResponseDone);
            }
            ResponseStatus::Completed | ResponseStatus::Incomplete => {
                self.transition(Transition::ResponseDone);
                if self.dispatcher.seal_response(response_id) {
                    self.continue_after_tools();
                }
            }
        }
    }

    fn on_provider_error(&mut self, code: Option<String>, message: String) {
        // a rejected response request
        if self.state == SessionState::Processing && self.active.is_some() {
            let active = self.active.take().unwrap_or_default();
            tracing::error!(
                session_id = %self.session_id,
                code = ?code,
                message = %message,
                "Provider rejected response request"
            );
            if let Some(response_id) = &active.id {
                self.dispatcher.cancel_response(response_id);
            }
            self.fault(SessionFault::GenerationFailed {
                response_id: active.id,
                code,
                message,
            });
            self.transition(Transition::Reset);
            return;
        }

        tracing::error!(session_id = %self.session_id, code = ?code, message = %message, "Provider error");
        let message = match code {
            Some(code) => format!("{code}: {message}"),
            None => message,
        };
        self.fault(SessionFault::Protocol { message });
    }

    /// Cancel the active response and reconcile its output with playback.
    fn cancel_active(&mut self, now_ms: u64) -> Option<InterruptionOutcome> {
        let active = self.active.take()?;
        let outcome = match self.interruption.interrupt(
            active.id.as_deref(),
            active.output_item.as_deref(),
            &mut self.playback,
            &mut self.history,
            now_ms,
            &mut self.commands,
        ) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(session_id = %self.session_id, error = %e, "Interruption reconcile failed");
                return None;
            }
        };

        if let Some(response_id) = &active.id {
            self.cancelled.insert(response_id.clone());
            self.dispatcher.cancel_response(response_id);
        }
        self.notify_truncation(&outcome.action);
        Some(outcome)
    }

    /// The user started speaking while audio of already finished output
    /// items was still playing. Cuts each one at what was heard.
    fn reconcile_trailing(&mut self) {
        for item_id in std::mem::take(&mut self.trailing) {
            let behind = self
                .playback
                .position(&item_id)
                .is_some_and(|p| p.reported && p.unplayed_ms() > 0);
            if !behind {
                self.playback.finish_item(&item_id);
                continue;
            }
            match self.interruption.reconcile(
                &item_id,
                &mut self.playback,
                &mut self.history,
                &mut self.commands,
            ) {
                Ok(outcome) => self.notify_truncation(&outcome.action),
                Err(e) => {
                    tracing::warn!(item_id = %item_id, error = %e, "Trailing playback reconcile failed")
                }
            }
        }
    }

    fn notify_truncation(&mut self, action: &TruncationAction) {
        match action {
            TruncationAction::Truncated {
                item_id,
                audio_end_ms,
            } => {
                self.notifications.push(SessionNotification::ItemTruncated {
                    item_id: item_id.clone(),
                    audio_end_ms: *audio_end_ms,
                });
                self.notify_finalized(item_id);
            }
            TruncationAction::Discarded { item_id } => {
                self.notifications
                    .push(SessionNotification::ItemDiscarded {
                        item_id: item_id.clone(),
                    });
            }
            TruncationAction::None => {}
        }
    }

    fn reset_to_idle(&mut self, now_ms: u64) {
        self.cancel_active(now_ms);
        self.detector.reset();
        self.user_item = None;
        self.transition(Transition::Reset);
    }

    // =========================================================================
    // Tools
    // =========================================================================

    fn on_tool_call_done(
        &mut self,
        response_id: &str,
        call_id: &str,
        name: Option<String>,
        arguments: &str,
    ) {
        let name = name.or_else(|| {
            self.dispatcher
                .pending(call_id)
                .and_then(|call| call.name.clone())
        });
        let action = match self.dispatcher.on_arguments_done(
            response_id,
            call_id,
            name.as_deref(),
            Some(arguments),
            &self.tools,
        ) {
            Ok(action) => action,
            Err(e) => {
                tracing::warn!(session_id = %self.session_id, call_id, error = %e, "Tool call rejected");
                return;
            }
        };

        let name = name.unwrap_or_default();
        let item = ConversationItem::function_call(call_id, &name, arguments);
        match self.history.append(item) {
            Ok(item_id) => self.notify_finalized(&item_id),
            Err(e) => tracing::warn!(call_id, error = %e, "Failed to record tool call"),
        }
        self.notifications.push(SessionNotification::ToolStarted {
            call_id: call_id.to_string(),
            name,
        });

        match action {
            DispatchAction::Execute(execution) => self.executions.push(execution),
            DispatchAction::Resolved(outcome) => self.resolve_tool(outcome),
        }
    }

    fn resolve_tool(&mut self, outcome: ToolOutcome) {
        let call_id = outcome.call_id.clone();
        let Some(resolution) = self.dispatcher.complete(outcome) else {
            tracing::warn!(session_id = %self.session_id, call_id = %call_id, "Discarding late tool output");
            return;
        };

        let output = resolution.payload.to_string();
        let item = ConversationItem::function_call_output(&resolution.call_id, &output);
        match self.history.append(item) {
            Ok(item_id) => self.notify_finalized(&item_id),
            Err(e) => tracing::warn!(call_id = %call_id, error = %e, "Failed to record tool output"),
        }
        self.commands.push(OutboundCommand::CreateToolOutput {
            call_id: resolution.call_id.clone(),
            output,
        });
        self.notifications.push(SessionNotification::ToolFinished {
            call_id: resolution.call_id,
            name: resolution.name,
            success: resolution.success,
            payload: resolution.payload,
        });

        if resolution.continue_response {
            self.continue_after_tools();
        }
    }

    fn continue_after_tools(&mut self) {
        if self.state == SessionState::Idle && self.active.is_none() {
            self.start_response(None, ResponseReason::ToolContinuation);
            self.transition(Transition::ResponseRequested);
        } else {
            tracing::warn!(
                session_id = %self.session_id,
                state = %self.state,
                "Dropping tool continuation; outputs stay in history for the next response"
            );
        }
    }

    // =========================================================================
    // Bookkeeping
    // =========================================================================

    fn transition(&mut self, transition: Transition) -> bool {
        let Some(next) = self.state.next(transition) else {
            tracing::trace!(state = %self.state, ?transition, "No transition");
            return false;
        };
        if next != self.state {
            let old = self.state;
            self.state = next;
            tracing::debug!(session_id = %self.session_id, %old, new = %next, "State changed");
            self.notifications
                .push(SessionNotification::StateChanged { old, new: next });
        }
        true
    }

    fn fault(&mut self, fault: SessionFault) {
        self.notifications.push(SessionNotification::Error(fault));
    }

    fn notify_finalized(&mut self, item_id: &str) {
        if let Some(item) = self.history.get(item_id) {
            self.notifications
                .push(SessionNotification::ItemFinalized { item: item.clone() });
        }
    }

    fn enforce_history_budget(&mut self) {
        if !self.history.over_budget() {
            return;
        }
        let evicted = self.history.evict_oldest(self.config.history_retain_ratio);
        if evicted.is_empty() {
            return;
        }
        for item in &evicted {
            self.playback.finish_item(&item.id);
        }
        self.notifications.push(SessionNotification::ItemsEvicted {
            item_ids: evicted.into_iter().map(|item| item.id).collect(),
        });
    }
}
