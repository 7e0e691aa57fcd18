//! Async driver of a [`SessionStateMachine`].
//!
//! Each session runs in its own tokio task that consumes a single queue of
//! inputs (transport events, playback callbacks, application calls and tool
//! outcomes), which is the per-session serialization point. Tool handlers run
//! in separate tasks so a long-running tool never delays the processing of
//! `SpeechStarted`. The session clock is the task's monotonic time since
//! start, in milliseconds.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::{
    InboundEvent, OutboundCommand, SessionError, SessionNotification, SessionResult,
    SessionSnapshot, SessionStateMachine,
};
use crate::core::tools::{ToolDefinition, ToolError, ToolHandler, ToolOutcome};
use crate::core::turn_detect::TurnDetectionPolicy;

/// Capacity of the input and output queues.
const CHANNEL_BUFFER_SIZE: usize = 1024;

/// Everything a session emits, in emission order per input.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutput {
    Command(OutboundCommand),
    Notification(SessionNotification),
}

enum Control {
    BeginTurn,
    SubmitTurn,
    SubmitText(String),
    RequestResponse(Option<String>),
    RegisterTool {
        definition: ToolDefinition,
        handler: Arc<dyn ToolHandler>,
        dangerous: bool,
    },
    SetTurnDetection(TurnDetectionPolicy),
    Snapshot,
    Close,
}

enum ControlReply {
    Done,
    ItemId(String),
    Snapshot(Box<SessionSnapshot>),
}

enum SessionInput {
    Event(InboundEvent),
    AudioPlayed { item_id: String, ms_played: u64 },
    ToolFinished(ToolOutcome),
    Control {
        op: Control,
        reply: oneshot::Sender<SessionResult<ControlReply>>,
    },
}

/// Cloneable handle to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    session_id: Arc<str>,
    tx: mpsc::Sender<SessionInput>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session_id", &self.session_id)
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl SessionHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Queue a transport event. Events are applied in the order sent.
    pub async fn send_event(&self, event: InboundEvent) -> SessionResult<()> {
        self.tx
            .send(SessionInput::Event(event))
            .await
            .map_err(|_| SessionError::SessionClosed)
    }

    /// Playback-progress callback from the sink.
    pub async fn audio_played(&self, item_id: impl Into<String>, ms_played: u64) -> SessionResult<()> {
        self.tx
            .send(SessionInput::AudioPlayed {
                item_id: item_id.into(),
                ms_played,
            })
            .await
            .map_err(|_| SessionError::SessionClosed)
    }

    pub async fn begin_user_turn(&self) -> SessionResult<()> {
        self.control(Control::BeginTurn).await.map(|_| ())
    }

    pub async fn submit_user_turn(&self) -> SessionResult<()> {
        self.control(Control::SubmitTurn).await.map(|_| ())
    }

    pub async fn submit_user_text(&self, text: impl Into<String>) -> SessionResult<String> {
        match self.control(Control::SubmitText(text.into())).await? {
            ControlReply::ItemId(id) => Ok(id),
            _ => Ok(String::new()),
        }
    }

    pub async fn request_response(&self, instructions: Option<String>) -> SessionResult<()> {
        self.control(Control::RequestResponse(instructions))
            .await
            .map(|_| ())
    }

    pub async fn register_tool(
        &self,
        definition: ToolDefinition,
        handler: Arc<dyn ToolHandler>,
    ) -> SessionResult<()> {
        self.control(Control::RegisterTool {
            definition,
            handler,
            dangerous: false,
        })
        .await
        .map(|_| ())
    }

    pub async fn register_dangerous_tool(
        &self,
        definition: ToolDefinition,
        handler: Arc<dyn ToolHandler>,
    ) -> SessionResult<()> {
        self.control(Control::RegisterTool {
            definition,
            handler,
            dangerous: true,
        })
        .await
        .map(|_| ())
    }

    pub async fn set_turn_detection(&self, policy: TurnDetectionPolicy) -> SessionResult<()> {
        self.control(Control::SetTurnDetection(policy))
            .await
            .map(|_| ())
    }

    pub async fn snapshot(&self) -> SessionResult<SessionSnapshot> {
        match self.control(Control::Snapshot).await? {
            ControlReply::Snapshot(snapshot) => Ok(*snapshot),
            _ => Err(SessionError::SessionClosed),
        }
    }

    /// Close the session and wait until it has processed the request.
    pub async fn close(&self) -> SessionResult<()> {
        self.control(Control::Close).await.map(|_| ())
    }

    async fn control(&self, op: Control) -> SessionResult<ControlReply> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SessionInput::Control { op, reply })
            .await
            .map_err(|_| SessionError::SessionClosed)?;
        rx.await.map_err(|_| SessionError::SessionClosed)?
    }
}

/// Run `machine` on a new task.
///
/// Returns the handle, the stream of outputs, and the task handle. The task
/// ends after [`SessionHandle::close`], when every handle is dropped, or when
/// the output receiver is dropped.
pub fn spawn_session(
    machine: SessionStateMachine,
) -> (
    SessionHandle,
    mpsc::Receiver<SessionOutput>,
    JoinHandle<()>,
) {
    let (tx, rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
    let (out_tx, out_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
    let handle = SessionHandle {
        session_id: Arc::from(machine.session_id()),
        tx: tx.clone(),
    };
    let weak = tx.downgrade();
    drop(tx);

    let task = tokio::spawn(run_session(machine, rx, weak, out_tx));
    (handle, out_rx, task)
}

async fn run_session(
    mut machine: SessionStateMachine,
    mut rx: mpsc::Receiver<SessionInput>,
    weak_tx: mpsc::WeakSender<SessionInput>,
    out_tx: mpsc::Sender<SessionOutput>,
) {
    let clock = Instant::now();
    let now_ms = || clock.elapsed().as_millis() as u64;
    let session_id = machine.session_id().to_string();
    tracing::info!(session_id = %session_id, "Session task started");

    loop {
        let deadline = machine
            .next_deadline()
            .map(|ms| clock + Duration::from_millis(ms));

        let input = tokio::select! {
            input = rx.recv() => match input {
                Some(input) => Some(input),
                None => {
                    tracing::debug!(session_id = %session_id, "All session handles dropped");
                    machine.close(now_ms());
                    flush(&mut machine, &out_tx, &weak_tx).await;
                    break;
                }
            },
            _ = sleep_until(deadline) => None,
        };

        let now = now_ms();
        if let Some(input) = input {
            apply(&mut machine, input, now);
        }
        machine.poll(now);

        if !flush(&mut machine, &out_tx, &weak_tx).await {
            tracing::debug!(session_id = %session_id, "Output receiver dropped");
            machine.close(now_ms());
            break;
        }
        if machine.is_closed() {
            break;
        }
    }

    tracing::info!(session_id = %session_id, "Session task finished");
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn apply(machine: &mut SessionStateMachine, input: SessionInput, now_ms: u64) {
    match input {
        SessionInput::Event(event) => machine.handle_event(event, now_ms),
        SessionInput::AudioPlayed { item_id, ms_played } => {
            machine.on_audio_played(&item_id, ms_played);
        }
        SessionInput::ToolFinished(outcome) => machine.tool_finished(outcome),
        SessionInput::Control { op, reply } => {
            let result = match op {
                Control::BeginTurn => machine.begin_user_turn(now_ms).map(|_| ControlReply::Done),
                Control::SubmitTurn => machine.submit_user_turn(now_ms).map(|_| ControlReply::Done),
                Control::SubmitText(text) => machine.submit_user_text(&text).map(ControlReply::ItemId),
                Control::RequestResponse(instructions) => machine
                    .request_response(instructions)
                    .map(|_| ControlReply::Done),
                Control::RegisterTool {
                    definition,
                    handler,
                    dangerous,
                } => {
                    let result = if dangerous {
                        machine.register_dangerous_tool(definition, handler)
                    } else {
                        machine.register_tool(definition, handler)
                    };
                    result.map(|_| ControlReply::Done)
                }
                Control::SetTurnDetection(policy) => machine
                    .set_turn_detection(policy)
                    .map(|_| ControlReply::Done),
                Control::Snapshot => Ok(ControlReply::Snapshot(Box::new(machine.snapshot()))),
                Control::Close => {
                    machine.close(now_ms);
                    Ok(ControlReply::Done)
                }
            };
            // the caller may have stopped waiting
            let _ = reply.send(result);
        }
    }
}

/// Spawn pending tool executions and forward queued outputs. Returns `false`
/// when nobody is listening any more.
async fn flush(
    machine: &mut SessionStateMachine,
    out_tx: &mpsc::Sender<SessionOutput>,
    weak_tx: &mpsc::WeakSender<SessionInput>,
) -> bool {
    for execution in machine.take_executions() {
        let weak = weak_tx.clone();
        let call_id = execution.call_id.clone();
        let name = execution.name.clone();
        tokio::spawn(async move {
            let outcome = match tokio::spawn(execution.run()).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(call_id = %call_id, tool = %name, error = %e, "Tool task failed");
                    ToolOutcome::failed(
                        &call_id,
                        &name,
                        ToolError::Execution(format!("tool task failed: {e}")),
                    )
                }
            };
            if let Some(tx) = weak.upgrade() {
                let _ = tx.send(SessionInput::ToolFinished(outcome)).await;
            }
        });
    }

    for command in machine.take_commands() {
        if out_tx.send(SessionOutput::Command(command)).await.is_err() {
            return false;
        }
    }
    for notification in machine.take_notifications() {
        if out_tx
            .send(SessionOutput::Notification(notification))
            .await
            .is_err()
        {
            return false;
        }
    }
    true
}
