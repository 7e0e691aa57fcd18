//! Translation between OpenAI wire events and the session event model.

use std::collections::HashMap;

use bytes::Bytes;
use serde_json::Value;

use super::config::OPENAI_REALTIME_SAMPLE_RATE;
use super::messages::{ClientEvent, ConversationItem, ResponseConfig, ServerEvent, TurnDetection};
use crate::core::history::{self, ItemKind, ItemRole};
use crate::core::session::{InboundEvent, OutboundCommand, ResponseStatus};
use crate::core::turn_detect::TurnDetectionPolicy;

/// Provider VAD settings for a policy. Response creation and barge-in stay
/// with the session core, so both provider switches are off.
pub fn turn_detection_for(policy: &TurnDetectionPolicy) -> Option<TurnDetection> {
    match policy {
        TurnDetectionPolicy::Energy {
            threshold,
            prefix_padding_ms,
            silence_duration_ms,
        } => Some(TurnDetection::ServerVad {
            threshold: Some(*threshold),
            prefix_padding_ms: Some(*prefix_padding_ms),
            silence_duration_ms: Some(*silence_duration_ms),
            create_response: Some(false),
            interrupt_response: Some(false),
        }),
        TurnDetectionPolicy::Semantic { eagerness } => Some(TurnDetection::SemanticVad {
            eagerness: Some(eagerness.to_string()),
            create_response: Some(false),
            interrupt_response: Some(false),
        }),
        TurnDetectionPolicy::Manual => None,
    }
}

/// Stateful translator for one connection.
///
/// Tracks function-call names announced by `response.output_item.added` so
/// that argument events, which carry only the call id, can be attributed.
#[derive(Debug, Default)]
pub struct EventTranslator {
    call_names: HashMap<String, String>,
    provider_vad: bool,
}

impl EventTranslator {
    pub fn new(policy: &TurnDetectionPolicy) -> Self {
        Self {
            call_names: HashMap::new(),
            provider_vad: !policy.is_manual(),
        }
    }

    pub fn set_policy(&mut self, policy: &TurnDetectionPolicy) {
        self.provider_vad = !policy.is_manual();
    }

    /// Decode one text frame. Frames that are not valid events become
    /// [`InboundEvent::Malformed`].
    pub fn translate_text(&mut self, text: &str) -> Vec<InboundEvent> {
        match serde_json::from_str::<ServerEvent>(text) {
            Ok(event) => self.translate(event),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to parse server event");
                vec![InboundEvent::Malformed {
                    detail: format!("invalid server event: {e}"),
                }]
            }
        }
    }

    pub fn translate(&mut self, event: ServerEvent) -> Vec<InboundEvent> {
        let event = match event {
            ServerEvent::Error { error } => {
                tracing::error!(
                    error_type = %error.error_type,
                    code = ?error.code,
                    event_id = ?error.event_id,
                    "OpenAI Realtime error: {}",
                    error.message
                );
                InboundEvent::Error {
                    code: error.code,
                    message: error.message,
                }
            }
            ServerEvent::SessionCreated { session } | ServerEvent::SessionUpdated { session } => {
                tracing::debug!(
                    session_id = ?session.get("id").and_then(|id| id.as_str()),
                    "Provider session configured"
                );
                return Vec::new();
            }
            ServerEvent::SpeechStarted {
                audio_start_ms,
                item_id,
            } => InboundEvent::SpeechStarted {
                audio_start_ms,
                item_id,
            },
            ServerEvent::SpeechStopped {
                audio_end_ms,
                item_id,
            } => InboundEvent::SpeechStopped {
                audio_end_ms,
                item_id,
            },
            ServerEvent::InputAudioBufferCommitted { item_id, .. } => {
                tracing::debug!(item_id = %item_id, "Input audio committed");
                return Vec::new();
            }
            ServerEvent::TranscriptionCompleted {
                item_id,
                transcript,
                ..
            } => InboundEvent::InputTranscript {
                item_id: Some(item_id),
                transcript,
            },
            ServerEvent::TranscriptionFailed { item_id, error, .. } => {
                tracing::warn!(item_id = %item_id, "Input transcription failed: {}", error.message);
                return Vec::new();
            }
            ServerEvent::ResponseCreated { response } => InboundEvent::ResponseStarted {
                response_id: response.id,
            },
            ServerEvent::ResponseDone { response } => {
                for item in &response.output {
                    if let Some(call_id) = &item.call_id {
                        self.call_names.remove(call_id);
                    }
                }
                InboundEvent::ResponseDone {
                    status: response_status(response.status.as_deref(), response.status_details.as_ref()),
                    response_id: response.id,
                }
            }
            ServerEvent::OutputItemAdded { item, .. } => {
                if item.item_type == "function_call"
                    && let (Some(call_id), Some(name)) = (item.call_id, item.name)
                {
                    self.call_names.insert(call_id, name);
                }
                return Vec::new();
            }
            ServerEvent::AudioTranscriptDelta {
                response_id,
                item_id,
                delta,
                ..
            } => InboundEvent::ResponseTranscriptDelta {
                response_id,
                item_id,
                delta,
            },
            ServerEvent::AudioDelta {
                response_id,
                item_id,
                delta,
                ..
            } => match ServerEvent::decode_audio_delta(&delta) {
                Ok(audio) => InboundEvent::ResponseAudioDelta {
                    response_id,
                    item_id,
                    audio: Bytes::from(audio),
                    sample_rate: OPENAI_REALTIME_SAMPLE_RATE,
                },
                Err(e) => InboundEvent::Malformed {
                    detail: format!("undecodable audio delta for item {item_id}: {e}"),
                },
            },
            ServerEvent::FunctionCallArgumentsDelta {
                response_id,
                call_id,
                delta,
                ..
            } => InboundEvent::ToolCallArgumentDelta {
                name: self.call_names.get(&call_id).cloned(),
                response_id,
                call_id,
                delta,
            },
            ServerEvent::FunctionCallArgumentsDone {
                response_id,
                call_id,
                arguments,
                name,
                ..
            } => InboundEvent::ToolCallDone {
                name: name.or_else(|| self.call_names.get(&call_id).cloned()),
                response_id,
                call_id,
                arguments,
            },
            ServerEvent::Unknown => return Vec::new(),
        };
        vec![event]
    }

    /// Wire event for a session command. `None` when the command has no
    /// wire form under the current policy.
    pub fn command(&self, command: OutboundCommand) -> Option<ClientEvent> {
        let event = match command {
            // the provider commits on its own when it runs VAD
            OutboundCommand::CommitTurn { .. } if self.provider_vad => return None,
            OutboundCommand::CommitTurn { .. } => ClientEvent::InputAudioBufferCommit,
            OutboundCommand::CreateUserMessage { text, .. } => ClientEvent::ConversationItemCreate {
                item: ConversationItem::user_text(text),
                previous_item_id: None,
            },
            OutboundCommand::CancelResponse { response_id } => {
                ClientEvent::ResponseCancel { response_id }
            }
            OutboundCommand::TruncateItem {
                item_id,
                content_index,
                audio_end_ms,
            } => ClientEvent::ConversationItemTruncate {
                item_id,
                content_index,
                audio_end_ms: u32::try_from(audio_end_ms).unwrap_or(u32::MAX),
            },
            OutboundCommand::DeleteItem { item_id } => ClientEvent::ConversationItemDelete { item_id },
            OutboundCommand::CreateToolOutput { call_id, output } => {
                ClientEvent::ConversationItemCreate {
                    item: ConversationItem::function_call_output(call_id, output),
                    previous_item_id: None,
                }
            }
            OutboundCommand::RequestResponse {
                instructions,
                reason,
            } => ClientEvent::ResponseCreate {
                response: Some(ResponseConfig {
                    instructions,
                    metadata: Some(serde_json::json!({ "reason": reason })),
                }),
            },
        };
        Some(event)
    }
}

/// Wire form of a stored history item, used to seed a resumed session.
/// Tool items are skipped.
pub fn history_item(item: &history::ConversationItem) -> Option<ClientEvent> {
    if !matches!(item.kind, ItemKind::Message) {
        return None;
    }
    let text = item.content.display_text()?.to_string();
    let item = match item.role {
        ItemRole::User => ConversationItem::user_text(text),
        ItemRole::Assistant => ConversationItem::assistant_text(text),
        ItemRole::Tool => return None,
    };
    Some(ClientEvent::ConversationItemCreate {
        item,
        previous_item_id: None,
    })
}

fn response_status(status: Option<&str>, details: Option<&Value>) -> ResponseStatus {
    match status {
        Some("cancelled") => ResponseStatus::Cancelled,
        Some("incomplete") => ResponseStatus::Incomplete,
        Some("failed") => {
            let message = details
                .and_then(|d| d.pointer("/error/message"))
                .and_then(Value::as_str)
                .unwrap_or("response failed")
                .to_string();
            ResponseStatus::Failed { message }
        }
        _ => ResponseStatus::Completed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::history::ItemContent;
    use crate::core::session::ResponseReason;

    fn translator() -> EventTranslator {
        EventTranslator::new(&TurnDetectionPolicy::default())
    }

    #[test]
    fn test_speech_started() {
        let events = translator().translate_text(
            r#"{"type":"input_audio_buffer.speech_started","event_id":"e","audio_start_ms":1200,"item_id":"item_u1"}"#,
        );
        assert_eq!(
            events,
            vec![InboundEvent::SpeechStarted {
                audio_start_ms: 1200,
                item_id: Some("item_u1".into())
            }]
        );
    }

    #[test]
    fn test_audio_delta_decoded() {
        let events = translator().translate_text(
            r#"{"type":"response.audio.delta","response_id":"r1","item_id":"i1","output_index":0,"content_index":0,"delta":"AAAA"}"#,
        );
        match &events[..] {
            [InboundEvent::ResponseAudioDelta { audio, sample_rate, .. }] => {
                assert_eq!(audio.len(), 3);
                assert_eq!(*sample_rate, 24000);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_bad_audio_is_malformed() {
        let events = translator().translate_text(
            r#"{"type":"response.audio.delta","response_id":"r1","item_id":"i1","delta":"!!!"}"#,
        );
        assert!(matches!(events[0], InboundEvent::Malformed { .. }));
    }

    #[test]
    fn test_invalid_json_is_malformed() {
        let events = translator().translate_text("{not json");
        assert!(matches!(events[0], InboundEvent::Malformed { .. }));
    }

    #[test]
    fn test_function_call_name_tracked() {
        let mut t = translator();
        assert!(t
            .translate_text(
                r#"{"type":"response.output_item.added","response_id":"r1","output_index":0,"item":{"id":"fc1","type":"function_call","call_id":"call_1","name":"lookup_flight","arguments":""}}"#,
            )
            .is_empty());
        let events = t.translate_text(
            r#"{"type":"response.function_call_arguments.done","response_id":"r1","item_id":"fc1","output_index":0,"call_id":"call_1","arguments":"{\"flight\":\"UA1\"}"}"#,
        );
        assert_eq!(
            events,
            vec![InboundEvent::ToolCallDone {
                response_id: "r1".into(),
                call_id: "call_1".into(),
                name: Some("lookup_flight".into()),
                arguments: r#"{"flight":"UA1"}"#.into(),
            }]
        );
    }

    #[test]
    fn test_response_done_status() {
        let events = translator().translate_text(
            r#"{"type":"response.done","response":{"id":"r1","status":"failed","status_details":{"type":"failed","error":{"type":"server_error","message":"model crashed"}},"output":[]}}"#,
        );
        assert_eq!(
            events,
            vec![InboundEvent::ResponseDone {
                response_id: "r1".into(),
                status: ResponseStatus::Failed {
                    message: "model crashed".into()
                }
            }]
        );
        assert_eq!(response_status(Some("cancelled"), None), ResponseStatus::Cancelled);
        assert_eq!(response_status(None, None), ResponseStatus::Completed);
    }

    #[test]
    fn test_commit_dropped_under_provider_vad() {
        let t = translator();
        assert!(t
            .command(OutboundCommand::CommitTurn {
                item_id: "item_1".into()
            })
            .is_none());

        let manual = EventTranslator::new(&TurnDetectionPolicy::Manual);
        assert_eq!(
            manual.command(OutboundCommand::CommitTurn {
                item_id: "item_1".into()
            }),
            Some(ClientEvent::InputAudioBufferCommit)
        );
    }

    #[test]
    fn test_tool_output_command() {
        let event = translator()
            .command(OutboundCommand::CreateToolOutput {
                call_id: "call_1".into(),
                output: r#"{"success":true}"#.into(),
            })
            .unwrap();
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "conversation.item.create");
        assert_eq!(json["item"]["type"], "function_call_output");
        assert_eq!(json["item"]["call_id"], "call_1");
    }

    #[test]
    fn test_response_request_carries_reason() {
        let event = translator()
            .command(OutboundCommand::RequestResponse {
                instructions: None,
                reason: ResponseReason::ToolContinuation,
            })
            .unwrap();
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["response"]["metadata"]["reason"], "tool_continuation");
    }

    #[test]
    fn test_policy_mapping_disables_provider_responses() {
        let Some(TurnDetection::ServerVad {
            create_response,
            interrupt_response,
            silence_duration_ms,
            ..
        }) = turn_detection_for(&TurnDetectionPolicy::default())
        else {
            panic!("expected server vad");
        };
        assert_eq!(create_response, Some(false));
        assert_eq!(interrupt_response, Some(false));
        assert_eq!(silence_duration_ms, Some(500));
        assert!(turn_detection_for(&TurnDetectionPolicy::Manual).is_none());
    }

    #[test]
    fn test_history_item_skips_tools() {
        let user = history::ConversationItem::user_message(ItemContent::text("hi"));
        assert!(history_item(&user).is_some());
        let output = history::ConversationItem::function_call_output("call_1", "{}");
        assert!(history_item(&output).is_none());
    }
}
