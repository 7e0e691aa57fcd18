//! Session WebSocket handler
//!
//! Each connection runs one orchestrated session. The handler bridges three
//! parties: the client (input audio, playback reports, push-to-talk and
//! text), the OpenAI Realtime transport, and the session task that decides
//! what is sent where.

use std::collections::HashSet;
use std::sync::Arc;

use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tokio::{select, time::timeout};
use tracing::{debug, error, info, warn};

use crate::core::history::ConversationItem;
use crate::core::realtime::openai::OpenAIRealtimeVoice;
use crate::core::realtime::{BoxedTransport, OpenAIRealtimeTransport};
use crate::core::session::{
    SessionError, SessionHandle, SessionNotification, SessionOutput, SessionStateMachine,
    spawn_session,
};
use crate::transcript::{EndReason, TranscriptEntry};
use crate::state::{ActiveSession, AppState};

use super::messages::{ClientMessage, ClientRoute, ServerMessage, SessionSetup};

/// Optimized channel buffer size for audio workloads
const CHANNEL_BUFFER_SIZE: usize = 1024;

/// Maximum WebSocket frame size (10 MB)
const MAX_WS_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Maximum WebSocket message size (10 MB)
const MAX_WS_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// How long a new connection may take to send its `config` message
const CONFIG_TIMEOUT: Duration = Duration::from_secs(30);

/// How often the connection is checked for inactivity
const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Inactivity after which the session is ended
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Stored messages replayed into a resumed session
const MAX_RESUME_ENTRIES: usize = 50;

/// Query parameters of `GET /session`
#[derive(Debug, Default, Deserialize)]
pub struct SessionParams {
    /// Id of a stored session to continue
    #[serde(default)]
    pub resume: Option<String>,
}

/// Session WebSocket handler
///
/// Upgrades the HTTP connection to a WebSocket that carries one
/// orchestrated voice session.
pub async fn session_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(params): Query<SessionParams>,
) -> Response {
    info!(resume = ?params.resume, "Session WebSocket connection upgrade requested");

    ws.max_frame_size(MAX_WS_FRAME_SIZE)
        .max_message_size(MAX_WS_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_session_socket(socket, state, params))
}

async fn handle_session_socket(socket: WebSocket, state: Arc<AppState>, params: SessionParams) {
    let (sender, mut receiver) = socket.split();
    let (client_tx, client_rx) = mpsc::channel::<ClientRoute>(CHANNEL_BUFFER_SIZE);
    let sender_task = tokio::spawn(write_client(sender, client_rx));

    let Some(setup) = wait_for_setup(&mut receiver, &client_tx).await else {
        let _ = client_tx.send(ClientRoute::Close).await;
        let _ = timeout(Duration::from_secs(2), sender_task).await;
        return;
    };

    match SessionBridge::start(state, setup, params.resume, client_tx.clone()).await {
        Ok(mut bridge) => {
            let (reason, details) = bridge.run(&mut receiver).await;
            bridge.finish(reason, details).await;
        }
        Err(message) => {
            let _ = client_tx.send(ClientRoute::Outgoing(message)).await;
        }
    }

    let _ = client_tx.send(ClientRoute::Close).await;
    drop(client_tx);
    if timeout(Duration::from_secs(2), sender_task).await.is_err() {
        debug!("Client writer did not finish in time");
    }
    info!("Session WebSocket connection terminated");
}

/// Writer task for outgoing frames
async fn write_client(
    mut sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<ClientRoute>,
) {
    while let Some(route) = rx.recv().await {
        let should_close = matches!(route, ClientRoute::Close);

        let result = match route {
            ClientRoute::Outgoing(message) => match serde_json::to_string(&message) {
                Ok(json) => sender.send(Message::Text(json.into())).await,
                Err(e) => {
                    error!("Failed to serialize outgoing message: {}", e);
                    continue;
                }
            },
            ClientRoute::Audio(data) => sender.send(Message::Binary(data)).await,
            ClientRoute::Close => sender.send(Message::Close(None)).await,
        };

        if let Err(e) = result {
            debug!("Failed to send WebSocket message: {}", e);
            break;
        }
        if should_close {
            break;
        }
    }
}

async fn send_error(client_tx: &mpsc::Sender<ClientRoute>, code: &str, message: impl Into<String>) {
    let _ = client_tx
        .send(ClientRoute::Outgoing(ServerMessage::error(code, message)))
        .await;
}

fn parse_client_message(text: &str) -> Result<ClientMessage, ServerMessage> {
    let message: ClientMessage = serde_json::from_str(text)
        .map_err(|e| ServerMessage::error("parse_error", format!("Invalid message format: {e}")))?;
    message
        .validate_size()
        .map_err(|e| ServerMessage::error("validation_error", e.to_string()))?;
    Ok(message)
}

/// Read frames until the client sends `config`. Returns `None` when the
/// client leaves or takes too long.
async fn wait_for_setup(
    receiver: &mut SplitStream<WebSocket>,
    client_tx: &mpsc::Sender<ClientRoute>,
) -> Option<SessionSetup> {
    let deadline = Instant::now() + CONFIG_TIMEOUT;
    loop {
        let frame = match tokio::time::timeout_at(deadline, receiver.next()).await {
            Ok(frame) => frame,
            Err(_) => {
                warn!("No config received within {}s", CONFIG_TIMEOUT.as_secs());
                send_error(client_tx, "config_timeout", "Expected a config message").await;
                return None;
            }
        };

        match frame {
            Some(Ok(Message::Text(text))) => match parse_client_message(&text) {
                Ok(ClientMessage::Config(setup)) => {
                    if let Some(policy) = &setup.turn_detection
                        && let Err(e) = policy.validate()
                    {
                        send_error(client_tx, "invalid_config", e.to_string()).await;
                        continue;
                    }
                    return Some(setup);
                }
                Ok(ClientMessage::Close) => return None,
                Ok(_) => {
                    send_error(client_tx, "not_configured", "Send a config message first").await;
                }
                Err(message) => {
                    let _ = client_tx.send(ClientRoute::Outgoing(message)).await;
                }
            },
            Some(Ok(Message::Binary(_))) => debug!("Dropping audio received before config"),
            Some(Ok(Message::Close(_))) | None => return None,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!("Session WebSocket error: {}", e);
                return None;
            }
        }
    }
}

/// What the main loop does after handling one input.
enum Flow {
    Continue,
    End(EndReason, Option<String>),
}

/// One running session and the connections it bridges.
struct SessionBridge {
    state: Arc<AppState>,
    session_id: String,
    handle: SessionHandle,
    outputs: mpsc::Receiver<SessionOutput>,
    task: JoinHandle<()>,
    transport: BoxedTransport,
    client_tx: mpsc::Sender<ClientRoute>,
    /// Items already written to the stored transcript
    persisted: HashSet<String>,
    /// Output item whose audio is currently being forwarded
    audio_item: Option<String>,
    last_activity: Instant,
}

impl SessionBridge {
    /// Connect the provider and spawn the session task.
    async fn start(
        state: Arc<AppState>,
        setup: SessionSetup,
        resume: Option<String>,
        client_tx: mpsc::Sender<ClientRoute>,
    ) -> Result<Self, ServerMessage> {
        let mut realtime = state
            .config
            .realtime_config()
            .map_err(|e| ServerMessage::error("missing_api_key", e))?;
        let mut session_config = state.config.session_config();

        if let Some(voice) = &setup.voice {
            realtime.voice = OpenAIRealtimeVoice::from_str_or_default(voice);
        }
        if let Some(instructions) = setup.instructions {
            realtime.instructions = Some(instructions);
        }
        if let Some(policy) = setup.turn_detection {
            realtime.turn_detection = policy.clone();
            session_config.turn_detection = policy;
        }

        let tools = state.build_tool_registry();
        realtime.tools = tools.definitions();

        let (session_id, history) = Self::resolve_session(&state, resume)?;

        let model = realtime.model.clone();
        let voice = realtime.voice.to_string();
        let transport = OpenAIRealtimeTransport::connect(realtime)
            .await
            .map_err(|e| {
                error!(session_id = %session_id, error = %e, "Failed to connect realtime provider");
                ServerMessage::error("provider_error", e.to_string())
            })?;
        let transport: BoxedTransport = Box::new(transport);

        if !history.is_empty()
            && let Err(e) = transport.replay_history(&history).await
        {
            warn!(session_id = %session_id, error = %e, "Failed to replay stored conversation");
        }

        let turn_detection = session_config.turn_detection.name().to_string();
        let resumed_items = history.len();
        let machine = SessionStateMachine::new(session_id.clone(), session_config)
            .with_tools(tools)
            .with_history(history);
        let (handle, outputs, task) = spawn_session(machine);

        state.sessions.insert(
            session_id.clone(),
            ActiveSession {
                handle: handle.clone(),
                started_at: time::OffsetDateTime::now_utc(),
            },
        );

        info!(
            session_id = %session_id,
            model = %model,
            voice = %voice,
            turn_detection = %turn_detection,
            resumed_items,
            "Session started"
        );

        let _ = client_tx
            .send(ClientRoute::Outgoing(ServerMessage::SessionCreated {
                session_id: session_id.clone(),
                model,
                voice,
                turn_detection,
                resumed_items,
            }))
            .await;

        Ok(Self {
            state,
            session_id,
            handle,
            outputs,
            task,
            transport,
            client_tx,
            persisted: HashSet::new(),
            audio_item: None,
            last_activity: Instant::now(),
        })
    }

    /// Pick the session id and the conversation to resume, creating the
    /// stored record for a new session.
    fn resolve_session(
        state: &AppState,
        resume: Option<String>,
    ) -> Result<(String, Vec<ConversationItem>), ServerMessage> {
        let Some(resume_id) = resume else {
            let session_id = uuid::Uuid::new_v4().to_string();
            if let Some(repo) = &state.transcripts
                && let Err(e) = repo.create_session(&session_id)
            {
                warn!(session_id = %session_id, error = %e, "Failed to create session record");
            }
            return Ok((session_id, Vec::new()));
        };

        if state.sessions.contains_key(&resume_id) {
            return Err(ServerMessage::error(
                "session_active",
                format!("Session {resume_id} is already active"),
            ));
        }
        let Some(repo) = &state.transcripts else {
            return Err(ServerMessage::error(
                "persistence_disabled",
                "Session resumption requires transcript persistence",
            ));
        };
        match repo.get_session(&resume_id) {
            Ok(Some(_)) => {}
            Ok(None) => {
                return Err(ServerMessage::error(
                    "session_not_found",
                    format!("Session {resume_id} not found"),
                ));
            }
            Err(e) => return Err(ServerMessage::error("session_not_found", e.to_string())),
        }
        let history = repo
            .resumption_context(&resume_id, MAX_RESUME_ENTRIES)
            .map_err(|e| ServerMessage::error("resume_failed", e.to_string()))?;
        Ok((resume_id, history))
    }

    /// Pump all three parties until one side ends the session.
    async fn run(&mut self, receiver: &mut SplitStream<WebSocket>) -> (EndReason, Option<String>) {
        loop {
            let flow = select! {
                frame = receiver.next() => {
                    self.last_activity = Instant::now();
                    match frame {
                        Some(Ok(message)) => self.on_client_frame(message).await,
                        Some(Err(e)) => {
                            warn!(session_id = %self.session_id, "Session WebSocket error: {}", e);
                            Flow::End(EndReason::NetworkError, Some(format!("WebSocket error: {e}")))
                        }
                        None => {
                            info!(session_id = %self.session_id, "Session WebSocket closed by client");
                            Flow::End(EndReason::NetworkError, None)
                        }
                    }
                }
                event = self.transport.next_event() => match event {
                    Some(event) => {
                        match self.handle.send_event(event).await {
                            Ok(()) => Flow::Continue,
                            Err(_) => Flow::End(EndReason::Error, Some("session task stopped".to_string())),
                        }
                    }
                    None => {
                        warn!(session_id = %self.session_id, "Realtime provider connection closed");
                        Flow::End(
                            EndReason::NetworkError,
                            Some("provider connection closed".to_string()),
                        )
                    }
                },
                output = self.outputs.recv() => match output {
                    Some(output) => self.on_output(output).await,
                    None => Flow::End(EndReason::Error, Some("session task stopped".to_string())),
                },
                _ = tokio::time::sleep(IDLE_CHECK_INTERVAL) => {
                    if self.last_activity.elapsed() > IDLE_TIMEOUT {
                        warn!(
                            session_id = %self.session_id,
                            "Session idle for {}s, closing",
                            self.last_activity.elapsed().as_secs()
                        );
                        send_error(&self.client_tx, "idle_timeout", "Connection closed due to inactivity").await;
                        Flow::End(EndReason::IdleTimeout, None)
                    } else {
                        Flow::Continue
                    }
                }
            };

            if let Flow::End(reason, details) = flow {
                return (reason, details);
            }
        }
    }

    async fn on_client_frame(&mut self, message: Message) -> Flow {
        match message {
            Message::Text(text) => match parse_client_message(&text) {
                Ok(message) => self.on_client_message(message).await,
                Err(message) => {
                    let _ = self.client_tx.send(ClientRoute::Outgoing(message)).await;
                    Flow::Continue
                }
            },
            Message::Binary(data) => {
                if let Err(e) = self.transport.append_input_audio(data).await {
                    warn!(session_id = %self.session_id, error = %e, "Failed to forward input audio");
                    send_error(&self.client_tx, "audio_error", format!("Failed to send audio: {e}")).await;
                }
                Flow::Continue
            }
            Message::Close(_) => {
                info!(session_id = %self.session_id, "Session WebSocket close received");
                Flow::End(EndReason::UserEnded, None)
            }
            Message::Ping(_) | Message::Pong(_) => Flow::Continue,
        }
    }

    async fn on_client_message(&mut self, message: ClientMessage) -> Flow {
        let result = match message {
            ClientMessage::Config(setup) => return self.reconfigure(setup).await,
            ClientMessage::AudioPlayed { item_id, ms_played } => {
                self.handle.audio_played(item_id, ms_played).await
            }
            ClientMessage::BeginTurn => self.handle.begin_user_turn().await,
            ClientMessage::SubmitTurn => self.handle.submit_user_turn().await,
            ClientMessage::RequestResponse { instructions } => {
                self.handle.request_response(instructions).await
            }
            ClientMessage::Text { text } => self.handle.submit_user_text(text).await.map(|_| ()),
            ClientMessage::Close => return Flow::End(EndReason::UserEnded, None),
        };

        match result {
            Ok(()) => Flow::Continue,
            Err(SessionError::SessionClosed) => {
                Flow::End(EndReason::Error, Some("session task stopped".to_string()))
            }
            Err(e) => {
                let code = match e {
                    SessionError::ResponseAlreadyActive => "response_active",
                    SessionError::InvalidState { .. } => "invalid_state",
                    _ => "session_error",
                };
                send_error(&self.client_tx, code, e.to_string()).await;
                Flow::Continue
            }
        }
    }

    /// A later `config` may only change turn detection.
    async fn reconfigure(&mut self, setup: SessionSetup) -> Flow {
        if setup.voice.is_some() || setup.instructions.is_some() {
            send_error(
                &self.client_tx,
                "invalid_config",
                "voice and instructions are fixed once the session starts",
            )
            .await;
        }
        let Some(policy) = setup.turn_detection else {
            return Flow::Continue;
        };
        if let Err(e) = policy.validate() {
            send_error(&self.client_tx, "invalid_config", e.to_string()).await;
            return Flow::Continue;
        }
        if let Err(e) = self.transport.set_turn_detection(&policy).await {
            send_error(&self.client_tx, "provider_error", e.to_string()).await;
            return Flow::Continue;
        }
        info!(session_id = %self.session_id, turn_detection = policy.name(), "Turn detection changed");
        match self.handle.set_turn_detection(policy).await {
            Ok(()) => Flow::Continue,
            Err(e) => Flow::End(EndReason::Error, Some(e.to_string())),
        }
    }

    async fn on_output(&mut self, output: SessionOutput) -> Flow {
        match output {
            SessionOutput::Command(command) => {
                if let Err(e) = self.transport.send(command).await {
                    error!(session_id = %self.session_id, error = %e, "Failed to send command to provider");
                    return Flow::End(EndReason::NetworkError, Some(e.to_string()));
                }
                Flow::Continue
            }
            SessionOutput::Notification(notification) => self.on_notification(notification).await,
        }
    }

    async fn on_notification(&mut self, notification: SessionNotification) -> Flow {
        let message = match notification {
            SessionNotification::StateChanged { old, new } => {
                Some(ServerMessage::StateChanged { old, new })
            }
            SessionNotification::Audio {
                response_id,
                item_id,
                data,
            } => {
                if self.audio_item.as_deref() != Some(item_id.as_str()) {
                    self.audio_item = Some(item_id.clone());
                    let _ = self
                        .client_tx
                        .send(ClientRoute::Outgoing(ServerMessage::AudioStarted {
                            response_id,
                            item_id,
                        }))
                        .await;
                }
                let _ = self.client_tx.send(ClientRoute::Audio(data)).await;
                None
            }
            SessionNotification::Transcript {
                item_id,
                role,
                text,
                is_final,
            } => Some(ServerMessage::Transcript {
                item_id,
                role: role.as_str().to_string(),
                text,
                is_final,
            }),
            SessionNotification::ItemFinalized { item } => {
                self.persist(&item);
                None
            }
            SessionNotification::ItemTruncated {
                item_id,
                audio_end_ms,
            } => Some(ServerMessage::Truncated {
                item_id,
                audio_end_ms,
                discarded: false,
            }),
            SessionNotification::ItemDiscarded { item_id } => Some(ServerMessage::Truncated {
                item_id,
                audio_end_ms: 0,
                discarded: true,
            }),
            SessionNotification::ItemsEvicted { item_ids } => {
                debug!(session_id = %self.session_id, count = item_ids.len(), "History items evicted");
                None
            }
            SessionNotification::ToolStarted { call_id, name } => {
                Some(ServerMessage::ToolStarted { call_id, name })
            }
            SessionNotification::ToolFinished {
                call_id,
                name,
                success,
                payload,
            } => Some(ServerMessage::ToolFinished {
                call_id,
                name,
                success,
                payload,
            }),
            SessionNotification::Error(fault) => {
                Some(ServerMessage::error(fault.code(), fault.to_string()))
            }
            SessionNotification::Closed => {
                return Flow::End(EndReason::UserEnded, None);
            }
        };

        if let Some(message) = message {
            let _ = self.client_tx.send(ClientRoute::Outgoing(message)).await;
        }
        Flow::Continue
    }

    /// Append a finalized item to the stored transcript. Each item is
    /// written once, when it first carries text.
    fn persist(&mut self, item: &ConversationItem) {
        let Some(repo) = &self.state.transcripts else {
            return;
        };
        if self.persisted.contains(&item.id) {
            return;
        }
        let entry = TranscriptEntry::from_item(&self.session_id, item);
        let is_tool = entry.tool_call_id.is_some();
        if !is_tool && entry.text.as_deref().is_none_or(str::is_empty) {
            return;
        }
        match repo.add_entry(&entry) {
            Ok(_) => {
                self.persisted.insert(item.id.clone());
            }
            Err(e) => {
                warn!(session_id = %self.session_id, item_id = %item.id, error = %e, "Failed to persist transcript entry");
            }
        }
    }

    /// Close everything down and record how the session ended.
    async fn finish(mut self, reason: EndReason, details: Option<String>) {
        if self.handle.close().await.is_ok() {
            // drain what the close produced: the cancel and final items
            while let Ok(Some(output)) = timeout(Duration::from_millis(200), self.outputs.recv()).await {
                match output {
                    SessionOutput::Command(command) => {
                        let _ = self.transport.send(command).await;
                    }
                    SessionOutput::Notification(SessionNotification::ItemFinalized { item }) => {
                        self.persist(&item);
                    }
                    SessionOutput::Notification(_) => {}
                }
            }
        }
        if let Err(e) = self.transport.close().await {
            debug!(session_id = %self.session_id, error = %e, "Failed to close provider connection");
        }
        self.task.abort();

        self.state.sessions.remove(&self.session_id);
        if let Some(repo) = &self.state.transcripts
            && let Err(e) = repo.end_session(&self.session_id, reason, details)
        {
            warn!(session_id = %self.session_id, error = %e, "Failed to record session end");
        }

        let _ = self
            .client_tx
            .send(ClientRoute::Outgoing(ServerMessage::Closing {
                reason: reason.as_str().to_string(),
            }))
            .await;
        info!(session_id = %self.session_id, reason = reason.as_str(), "Session finished");
    }
}
