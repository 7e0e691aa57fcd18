use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::core::history::{ConversationItem, ItemKind, ItemRole};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    User,
    Assistant,
    ToolCall,
    ToolResult,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Active,
    Completed,
    Disconnected,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Disconnected => "disconnected",
            SessionStatus::Error => "error",
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SessionStatus::Active),
            "completed" => Ok(SessionStatus::Completed),
            "disconnected" => Ok(SessionStatus::Disconnected),
            "error" => Ok(SessionStatus::Error),
            other => Err(format!("unknown session status '{other}'")),
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// The user hung up.
    UserEnded,
    /// No activity for too long.
    IdleTimeout,
    /// The provider's maximum session length was reached.
    SessionLimit,
    /// The client or provider connection dropped.
    NetworkError,
    Error,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::UserEnded => "user_ended",
            EndReason::IdleTimeout => "idle_timeout",
            EndReason::SessionLimit => "session_limit",
            EndReason::NetworkError => "network_error",
            EndReason::Error => "error",
        }
    }
}

/// Metadata of one recorded voice session (`session.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceSessionRecord {
    pub id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    pub title: Option<String>,
    pub status: SessionStatus,
    pub message_count: u64,
    pub tool_call_count: u64,
    /// Preview of the first user message.
    pub first_message: Option<String>,
    pub last_message: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub ended_at: Option<OffsetDateTime>,
    pub end_reason: Option<EndReason>,
    pub duration_seconds: Option<i64>,
    pub error_details: Option<String>,
}

impl VoiceSessionRecord {
    pub fn new(id: impl Into<String>) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: id.into(),
            created_at: now,
            updated_at: now,
            title: None,
            status: SessionStatus::Active,
            message_count: 0,
            tool_call_count: 0,
            first_message: None,
            last_message: None,
            ended_at: None,
            end_reason: None,
            duration_seconds: None,
            error_details: None,
        }
    }
}

/// Row of `sessions.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct IndexEntry {
    pub id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub title: Option<String>,
    pub status: SessionStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct SessionIndex {
    pub sessions: Vec<IndexEntry>,
}

/// One line of `transcript.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub id: String,
    pub session_id: String,
    pub entry_type: EntryType,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_arguments: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_duration_ms: Option<u64>,
    /// Where playback was cut off if the item was interrupted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub truncated_at_ms: Option<u64>,
}

impl TranscriptEntry {
    pub fn new(session_id: impl Into<String>, entry_type: EntryType) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            entry_type,
            timestamp: OffsetDateTime::now_utc(),
            text: None,
            tool_name: None,
            tool_call_id: None,
            tool_arguments: None,
            tool_result: None,
            audio_duration_ms: None,
            truncated_at_ms: None,
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Entry for a finalized history item.
    pub fn from_item(session_id: &str, item: &ConversationItem) -> Self {
        let mut entry = match &item.kind {
            ItemKind::Message => {
                let entry_type = match item.role {
                    ItemRole::User => EntryType::User,
                    ItemRole::Assistant => EntryType::Assistant,
                    ItemRole::Tool => EntryType::System,
                };
                let mut entry = Self::new(session_id, entry_type);
                entry.text = item.content.display_text().map(str::to_string);
                entry
            }
            ItemKind::FunctionCall {
                call_id,
                name,
                arguments,
            } => {
                let mut entry = Self::new(session_id, EntryType::ToolCall);
                entry.tool_name = Some(name.clone());
                entry.tool_call_id = Some(call_id.clone());
                entry.tool_arguments = Some(parse_or_string(arguments));
                entry
            }
            ItemKind::FunctionCallOutput { call_id, output } => {
                let mut entry = Self::new(session_id, EntryType::ToolResult);
                entry.tool_call_id = Some(call_id.clone());
                entry.tool_result = Some(parse_or_string(output));
                entry
            }
        };
        entry.timestamp = item.created_at;
        let audio_ms = item.audio_duration_ms();
        if audio_ms > 0 {
            entry.audio_duration_ms = Some(audio_ms);
        }
        entry.truncated_at_ms = item.audio_end_ms;
        entry
    }
}

fn parse_or_string(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Aggregate view over recent sessions.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionStats {
    pub total_sessions: usize,
    pub by_status: std::collections::BTreeMap<String, usize>,
    pub by_end_reason: std::collections::BTreeMap<String, usize>,
    pub avg_duration_seconds: i64,
    pub avg_messages: u64,
    pub avg_tool_calls: u64,
}
