use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Bytes per PCM16 mono sample.
const BYTES_PER_SAMPLE: u64 = 2;

/// Default output sample rate of realtime speech providers.
pub const DEFAULT_SAMPLE_RATE: u32 = 24_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemRole {
    User,
    Assistant,
    Tool,
}

impl ItemRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemRole::User => "user",
            ItemRole::Assistant => "assistant",
            ItemRole::Tool => "tool",
        }
    }
}

/// What kind of conversation item this is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ItemKind {
    Message,
    FunctionCall {
        call_id: String,
        name: String,
        arguments: String,
    },
    FunctionCallOutput {
        call_id: String,
        output: String,
    },
}

/// PCM16 mono audio attached to an item.
///
/// The raw samples stay in memory for the lifetime of the session and are
/// never serialized; records only carry the duration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioContent {
    #[serde(skip)]
    pub pcm: Vec<u8>,
    pub sample_rate: u32,
    pub duration_ms: u64,
}

impl AudioContent {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            pcm: Vec::new(),
            sample_rate: if sample_rate == 0 {
                DEFAULT_SAMPLE_RATE
            } else {
                sample_rate
            },
            duration_ms: 0,
        }
    }

    pub fn append(&mut self, chunk: &[u8]) {
        self.pcm.extend_from_slice(chunk);
        self.duration_ms = bytes_to_ms(self.pcm.len() as u64, self.sample_rate);
    }

    /// Drop every sample after `cutoff_ms`. The recorded duration becomes
    /// exactly `cutoff_ms` (or stays unchanged if it was already shorter).
    pub fn truncate_to(&mut self, cutoff_ms: u64) {
        if cutoff_ms >= self.duration_ms {
            return;
        }
        let keep = ms_to_bytes(cutoff_ms, self.sample_rate).min(self.pcm.len() as u64);
        self.pcm.truncate(keep as usize);
        self.duration_ms = cutoff_ms;
    }
}

/// Duration of `len` bytes of PCM16 mono audio.
pub fn bytes_to_ms(len: u64, sample_rate: u32) -> u64 {
    let bytes_per_second = sample_rate as u64 * BYTES_PER_SAMPLE;
    if bytes_per_second == 0 {
        return 0;
    }
    len * 1000 / bytes_per_second
}

/// Byte offset of `ms` into PCM16 mono audio, aligned to a whole sample.
pub fn ms_to_bytes(ms: u64, sample_rate: u32) -> u64 {
    let samples = ms * sample_rate as u64 / 1000;
    samples * BYTES_PER_SAMPLE
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Transcript of the item's audio.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<AudioContent>,
}

impl ItemContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.as_deref().is_none_or(str::is_empty)
            && self.transcript.as_deref().is_none_or(str::is_empty)
            && self.audio.as_ref().is_none_or(|a| a.duration_ms == 0)
    }

    /// Text that best represents the item: the transcript for audio, the text
    /// otherwise.
    pub fn display_text(&self) -> Option<&str> {
        self.transcript.as_deref().or(self.text.as_deref())
    }
}

/// An atomic unit of conversation history, serialized as
/// `{id, role, content, truncation_marker, timestamp}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationItem {
    pub id: String,
    pub role: ItemRole,
    #[serde(flatten)]
    pub kind: ItemKind,
    pub content: ItemContent,
    /// Set to `audio_end_ms` when the item was cut short by an interruption.
    #[serde(rename = "truncation_marker")]
    pub audio_end_ms: Option<u64>,
    #[serde(rename = "timestamp", with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl ConversationItem {
    fn new(role: ItemRole, kind: ItemKind, content: ItemContent) -> Self {
        Self {
            id: String::new(),
            role,
            kind,
            content,
            audio_end_ms: None,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn user_message(content: ItemContent) -> Self {
        Self::new(ItemRole::User, ItemKind::Message, content)
    }

    pub fn assistant_message(content: ItemContent) -> Self {
        Self::new(ItemRole::Assistant, ItemKind::Message, content)
    }

    pub fn function_call(
        call_id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self::new(
            ItemRole::Assistant,
            ItemKind::FunctionCall {
                call_id: call_id.into(),
                name: name.into(),
                arguments: arguments.into(),
            },
            ItemContent::default(),
        )
    }

    pub fn function_call_output(call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self::new(
            ItemRole::Tool,
            ItemKind::FunctionCallOutput {
                call_id: call_id.into(),
                output: output.into(),
            },
            ItemContent::default(),
        )
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Call id for function calls and their outputs.
    pub fn call_id(&self) -> Option<&str> {
        match &self.kind {
            ItemKind::FunctionCall { call_id, .. } | ItemKind::FunctionCallOutput { call_id, .. } => {
                Some(call_id)
            }
            ItemKind::Message => None,
        }
    }

    pub fn is_truncated(&self) -> bool {
        self.audio_end_ms.is_some()
    }

    pub fn audio_duration_ms(&self) -> u64 {
        self.content.audio.as_ref().map(|a| a.duration_ms).unwrap_or(0)
    }

    /// Rough token cost of the item: a quarter token per character of text
    /// plus twenty tokens per second of audio.
    pub fn estimated_tokens(&self) -> usize {
        let mut chars = 0usize;
        if let Some(text) = &self.content.text {
            chars += text.chars().count();
        }
        if let Some(transcript) = &self.content.transcript {
            chars += transcript.chars().count();
        }
        match &self.kind {
            ItemKind::Message => {}
            ItemKind::FunctionCall {
                name, arguments, ..
            } => chars += name.len() + arguments.len(),
            ItemKind::FunctionCallOutput { output, .. } => chars += output.len(),
        }
        chars.div_ceil(4) + (self.audio_duration_ms() / 50) as usize
    }
}

/// Cut `text` to the share of it that corresponds to `played_ms` out of
/// `total_ms`, backing off to the previous word boundary.
pub fn truncate_text_proportionally(text: &str, played_ms: u64, total_ms: u64) -> String {
    if total_ms == 0 || played_ms >= total_ms {
        return text.to_string();
    }
    let total_chars = text.chars().count();
    let keep_chars = (total_chars as u128 * played_ms as u128 / total_ms as u128) as usize;
    if keep_chars == 0 {
        return String::new();
    }

    let byte_end = text
        .char_indices()
        .nth(keep_chars)
        .map(|(i, _)| i)
        .unwrap_or(text.len());

    // already on a boundary
    if text[byte_end..].starts_with(char::is_whitespace) {
        return text[..byte_end].trim_end().to_string();
    }

    let prefix = &text[..byte_end];
    match prefix.rfind(char::is_whitespace) {
        Some(boundary) => prefix[..boundary].trim_end().to_string(),
        None => prefix.to_string(),
    }
}
