//! OpenAI Realtime WebSocket transport.
//!
//! One WebSocket per session. A background task owns both halves of the
//! socket: it writes queued [`ClientEvent`]s and translates incoming frames
//! into [`InboundEvent`]s. The session core decides when responses start and
//! when they are interrupted, so the provider is configured with
//! `create_response = false` and `interrupt_response = false`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;

use super::config::OpenAIRealtimeConfig;
use super::convert::{EventTranslator, history_item, turn_detection_for};
use super::messages::{ClientEvent, InputAudioTranscription, SessionConfig, ToolDef};
use crate::core::history::ConversationItem;
use crate::core::realtime::{RealtimeTransport, TransportError, TransportResult};
use crate::core::session::{InboundEvent, OutboundCommand};
use crate::core::turn_detect::TurnDetectionPolicy;

/// Capacity of the outgoing and incoming event queues.
const WS_CHANNEL_CAPACITY: usize = 1024;

pub struct OpenAIRealtimeTransport {
    ws_tx: mpsc::Sender<ClientEvent>,
    events: mpsc::Receiver<InboundEvent>,
    translator: Arc<Mutex<EventTranslator>>,
    connected: Arc<AtomicBool>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for OpenAIRealtimeTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAIRealtimeTransport")
            .field("connected", &self.connected.load(Ordering::SeqCst))
            .finish()
    }
}

impl OpenAIRealtimeTransport {
    /// Open the WebSocket and configure the provider session.
    pub async fn connect(config: OpenAIRealtimeConfig) -> TransportResult<Self> {
        if config.api_key.is_empty() {
            return Err(TransportError::AuthenticationFailed(
                "OpenAI API key is required".to_string(),
            ));
        }

        let url = config.ws_url();
        let parsed = url::Url::parse(&url)
            .map_err(|e| TransportError::InvalidConfiguration(format!("invalid url {url}: {e}")))?;
        let host = match (parsed.host_str(), parsed.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(TransportError::InvalidConfiguration(format!(
                    "url has no host: {url}"
                )));
            }
        };

        let request = http::Request::builder()
            .uri(&url)
            .header("Authorization", format!("Bearer {}", config.api_key))
            .header("OpenAI-Beta", "realtime=v1")
            .header(
                "Sec-WebSocket-Key",
                tungstenite::handshake::client::generate_key(),
            )
            .header("Sec-WebSocket-Version", "13")
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Host", host)
            .body(())
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        let (ws_stream, _response) =
            tokio_tungstenite::connect_async(request)
                .await
                .map_err(|e| match e {
                    tungstenite::Error::Http(response)
                        if response.status() == http::StatusCode::UNAUTHORIZED =>
                    {
                        TransportError::AuthenticationFailed("invalid API key".to_string())
                    }
                    other => TransportError::ConnectionFailed(other.to_string()),
                })?;

        tracing::info!(model = %config.model, "Connected to OpenAI Realtime API");

        let (mut ws_sink, mut ws_stream) = ws_stream.split();

        let session_update = ClientEvent::SessionUpdate {
            session: build_session_config(&config),
        };
        let json = serde_json::to_string(&session_update)
            .map_err(|e| TransportError::SerializationError(e.to_string()))?;
        ws_sink
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| TransportError::WebSocketError(e.to_string()))?;

        let (ws_tx, mut rx) = mpsc::channel::<ClientEvent>(WS_CHANNEL_CAPACITY);
        let (events_tx, events) = mpsc::channel::<InboundEvent>(WS_CHANNEL_CAPACITY);
        let translator = Arc::new(Mutex::new(EventTranslator::new(&config.turn_detection)));
        let connected = Arc::new(AtomicBool::new(true));
        let shutdown = CancellationToken::new();

        let task_translator = translator.clone();
        let task_connected = connected.clone();
        let task_shutdown = shutdown.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_shutdown.cancelled() => {
                        let _ = ws_sink.send(Message::Close(None)).await;
                        tracing::info!("OpenAI Realtime connection closed");
                        break;
                    }

                    Some(event) = rx.recv() => {
                        let json = match serde_json::to_string(&event) {
                            Ok(j) => j,
                            Err(e) => {
                                tracing::error!(event = event.event_type(), "Failed to serialize event: {}", e);
                                continue;
                            }
                        };
                        if let Err(e) = ws_sink.send(Message::Text(json.into())).await {
                            tracing::error!("Failed to send WebSocket message: {}", e);
                            break;
                        }
                    }

                    msg = ws_stream.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                let translated = task_translator.lock().translate_text(&text);
                                for event in translated {
                                    if events_tx.send(event).await.is_err() {
                                        tracing::debug!("Event receiver dropped");
                                        break;
                                    }
                                }
                            }
                            Some(Ok(Message::Ping(data))) => {
                                if let Err(e) = ws_sink.send(Message::Pong(data)).await {
                                    tracing::error!("Failed to send pong: {}", e);
                                }
                            }
                            Some(Ok(Message::Close(frame))) => {
                                tracing::info!(frame = ?frame, "WebSocket closed by server");
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                tracing::error!("WebSocket error: {}", e);
                                break;
                            }
                            None => break,
                        }
                    }
                }
            }
            task_connected.store(false, Ordering::SeqCst);
        });

        Ok(Self {
            ws_tx,
            events,
            translator,
            connected,
            shutdown,
            task,
        })
    }

    async fn send_event(&self, event: ClientEvent) -> TransportResult<()> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        tracing::debug!(event = event.event_type(), "Sending client event");
        self.ws_tx
            .send(event)
            .await
            .map_err(|_| TransportError::NotConnected)
    }
}

/// Initial `session.update` payload.
fn build_session_config(config: &OpenAIRealtimeConfig) -> SessionConfig {
    SessionConfig {
        modalities: Some(vec!["text".to_string(), "audio".to_string()]),
        instructions: config.instructions.clone(),
        voice: Some(config.voice.as_str().to_string()),
        input_audio_format: Some("pcm16".to_string()),
        output_audio_format: Some("pcm16".to_string()),
        input_audio_transcription: config
            .transcription_model
            .as_ref()
            .map(|model| InputAudioTranscription {
                model: model.clone(),
            }),
        turn_detection: turn_detection_for(&config.turn_detection),
        tools: (!config.tools.is_empty()).then(|| {
            config
                .tools
                .iter()
                .map(|t| ToolDef {
                    tool_type: "function".to_string(),
                    name: t.name.clone(),
                    description: Some(t.description.clone()),
                    parameters: Some(t.parameters.clone()),
                })
                .collect()
        }),
        tool_choice: (!config.tools.is_empty()).then(|| "auto".to_string()),
    }
}

#[async_trait]
impl RealtimeTransport for OpenAIRealtimeTransport {
    async fn send(&self, command: OutboundCommand) -> TransportResult<()> {
        let event = self.translator.lock().command(command);
        match event {
            Some(event) => self.send_event(event).await,
            None => Ok(()),
        }
    }

    async fn append_input_audio(&self, audio: Bytes) -> TransportResult<()> {
        self.send_event(ClientEvent::audio_append(&audio)).await
    }

    async fn next_event(&mut self) -> Option<InboundEvent> {
        self.events.recv().await
    }

    async fn set_turn_detection(&self, policy: &TurnDetectionPolicy) -> TransportResult<()> {
        self.translator.lock().set_policy(policy);
        self.send_event(ClientEvent::SessionUpdate {
            session: SessionConfig {
                turn_detection: turn_detection_for(policy),
                ..Default::default()
            },
        })
        .await
    }

    async fn replay_history(&self, items: &[ConversationItem]) -> TransportResult<()> {
        for event in items.iter().filter_map(history_item) {
            self.send_event(event).await?;
        }
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        self.shutdown.cancel();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.task.is_finished()
    }
}

impl Drop for OpenAIRealtimeTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
