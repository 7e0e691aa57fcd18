//! File-based transcript repository.
//!
//! Layout:
//!
//! ```text
//! {dir}/sessions.json                  index, newest first
//! {dir}/{session_id}/session.json      session metadata
//! {dir}/{session_id}/transcript.jsonl  entries, append-only
//! ```
//!
//! JSON documents are replaced atomically (temp file, fsync, rename). A
//! single lock serializes index updates between concurrent sessions.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use time::OffsetDateTime;

use super::models::{
    EndReason, EntryType, IndexEntry, SessionIndex, SessionStats, SessionStatus, TranscriptEntry,
    VoiceSessionRecord,
};
use super::{TranscriptError, TranscriptResult};
use crate::core::history::{ConversationItem, ItemContent};

const INDEX_FILE: &str = "sessions.json";
const SESSION_FILE: &str = "session.json";
const TRANSCRIPT_FILE: &str = "transcript.jsonl";

/// Characters kept for message previews and titles.
const PREVIEW_CHARS: usize = 100;
const TITLE_CHARS: usize = 50;

/// Sessions considered by [`TranscriptRepository::session_stats`].
const STATS_WINDOW: usize = 100;

#[derive(Debug)]
pub struct TranscriptRepository {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl TranscriptRepository {
    /// Open (and create if needed) a repository rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> TranscriptResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let repo = Self {
            dir,
            lock: Mutex::new(()),
        };
        let index = repo.dir.join(INDEX_FILE);
        if !index.exists() {
            write_json_atomic(&index, &SessionIndex::default())?;
        }
        tracing::info!(dir = %repo.dir.display(), "Transcript repository initialized");
        Ok(repo)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn session_dir(&self, session_id: &str) -> TranscriptResult<PathBuf> {
        if !is_valid_session_id(session_id) {
            return Err(TranscriptError::InvalidId(session_id.to_string()));
        }
        Ok(self.dir.join(session_id))
    }

    // --- Sessions ---

    /// Create a session record. Fails if the id is already taken.
    pub fn create_session(&self, session_id: &str) -> TranscriptResult<VoiceSessionRecord> {
        let _guard = self.lock.lock();
        self.create_session_locked(session_id)
    }

    fn create_session_locked(&self, session_id: &str) -> TranscriptResult<VoiceSessionRecord> {
        let dir = self.session_dir(session_id)?;
        if dir.join(SESSION_FILE).exists() {
            return Err(TranscriptError::AlreadyExists(session_id.to_string()));
        }
        fs::create_dir_all(&dir)?;

        let record = VoiceSessionRecord::new(session_id);
        write_json_atomic(&dir.join(SESSION_FILE), &record)?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(TRANSCRIPT_FILE))?;

        let mut index: SessionIndex = read_json(&self.dir.join(INDEX_FILE))?;
        index.sessions.insert(
            0,
            IndexEntry {
                id: record.id.clone(),
                created_at: record.created_at,
                title: None,
                status: record.status,
            },
        );
        write_json_atomic(&self.dir.join(INDEX_FILE), &index)?;

        tracing::info!(session_id = %session_id, "Created transcript session");
        Ok(record)
    }

    pub fn get_session(&self, session_id: &str) -> TranscriptResult<Option<VoiceSessionRecord>> {
        let path = self.session_dir(session_id)?.join(SESSION_FILE);
        if !path.exists() {
            return Ok(None);
        }
        read_json(&path).map(Some)
    }

    fn update_session_locked(&self, record: &mut VoiceSessionRecord) -> TranscriptResult<()> {
        record.updated_at = OffsetDateTime::now_utc();
        let dir = self.session_dir(&record.id)?;
        write_json_atomic(&dir.join(SESSION_FILE), record)?;

        let index_path = self.dir.join(INDEX_FILE);
        let mut index: SessionIndex = read_json(&index_path)?;
        if let Some(entry) = index.sessions.iter_mut().find(|s| s.id == record.id) {
            entry.title = record.title.clone();
            entry.status = record.status;
        }
        write_json_atomic(&index_path, &index)
    }

    /// Sessions newest first, optionally filtered by status.
    pub fn list_sessions(
        &self,
        status: Option<SessionStatus>,
        limit: usize,
    ) -> TranscriptResult<Vec<VoiceSessionRecord>> {
        let index: SessionIndex = read_json(&self.dir.join(INDEX_FILE))?;
        let mut sessions = Vec::new();
        for entry in index.sessions {
            if sessions.len() >= limit {
                break;
            }
            if status.is_some_and(|s| s != entry.status) {
                continue;
            }
            match self.get_session(&entry.id) {
                Ok(Some(record)) => sessions.push(record),
                Ok(None) => {}
                Err(e) => tracing::warn!(session_id = %entry.id, error = %e, "Skipping unreadable session"),
            }
        }
        Ok(sessions)
    }

    /// Record how a session ended. `user_ended` completes the session; any
    /// other reason marks it disconnected.
    pub fn end_session(
        &self,
        session_id: &str,
        reason: EndReason,
        error_details: Option<String>,
    ) -> TranscriptResult<VoiceSessionRecord> {
        let _guard = self.lock.lock();
        let mut record = self
            .get_session(session_id)?
            .ok_or_else(|| TranscriptError::NotFound(session_id.to_string()))?;

        let ended = OffsetDateTime::now_utc();
        record.status = if reason == EndReason::UserEnded {
            SessionStatus::Completed
        } else {
            SessionStatus::Disconnected
        };
        record.ended_at = Some(ended);
        record.end_reason = Some(reason);
        record.duration_seconds = Some((ended - record.created_at).whole_seconds());
        record.error_details = error_details;
        self.update_session_locked(&mut record)?;

        tracing::info!(
            session_id = %session_id,
            reason = reason.as_str(),
            duration_seconds = ?record.duration_seconds,
            messages = record.message_count,
            tool_calls = record.tool_call_count,
            "Session ended"
        );
        if let Some(details) = &record.error_details {
            tracing::warn!(session_id = %session_id, "Session error details: {}", details);
        }
        Ok(record)
    }

    pub fn session_stats(&self) -> TranscriptResult<SessionStats> {
        let sessions = self.list_sessions(None, STATS_WINDOW)?;
        let mut stats = SessionStats {
            total_sessions: sessions.len(),
            ..Default::default()
        };

        let mut total_duration = 0i64;
        let mut duration_count = 0i64;
        let mut total_messages = 0u64;
        let mut total_tool_calls = 0u64;

        for session in &sessions {
            *stats
                .by_status
                .entry(session.status.as_str().to_string())
                .or_default() += 1;
            let reason = session.end_reason.map(|r| r.as_str()).unwrap_or("unknown");
            *stats.by_end_reason.entry(reason.to_string()).or_default() += 1;

            if let Some(duration) = session.duration_seconds.filter(|d| *d > 0) {
                total_duration += duration;
                duration_count += 1;
            }
            total_messages += session.message_count;
            total_tool_calls += session.tool_call_count;
        }

        if duration_count > 0 {
            stats.avg_duration_seconds = total_duration / duration_count;
        }
        if !sessions.is_empty() {
            stats.avg_messages = total_messages / sessions.len() as u64;
            stats.avg_tool_calls = total_tool_calls / sessions.len() as u64;
        }
        Ok(stats)
    }

    // --- Transcript ---

    /// Append an entry and update the session counters. The session is
    /// created on first use.
    pub fn add_entry(&self, entry: &TranscriptEntry) -> TranscriptResult<String> {
        let _guard = self.lock.lock();
        let dir = self.session_dir(&entry.session_id)?;
        let mut record = match self.get_session(&entry.session_id)? {
            Some(record) => record,
            None => {
                tracing::warn!(session_id = %entry.session_id, "Session not found, creating");
                self.create_session_locked(&entry.session_id)?
            }
        };

        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(TRANSCRIPT_FILE))?;
        file.write_all(line.as_bytes())?;

        record.message_count += 1;
        if entry.entry_type == EntryType::ToolCall {
            record.tool_call_count += 1;
        }
        if entry.entry_type == EntryType::User
            && let Some(text) = entry.text.as_deref().filter(|t| !t.is_empty())
        {
            if record.first_message.is_none() {
                record.first_message = Some(preview(text, PREVIEW_CHARS));
                record.title = Some(title(text));
            }
            record.last_message = Some(preview(text, PREVIEW_CHARS));
        }
        self.update_session_locked(&mut record)?;

        Ok(entry.id.clone())
    }

    /// Entries in order; with `limit`, only the last `limit`.
    pub fn get_transcript(
        &self,
        session_id: &str,
        limit: Option<usize>,
    ) -> TranscriptResult<Vec<TranscriptEntry>> {
        let path = self.session_dir(session_id)?.join(TRANSCRIPT_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(fs::File::open(&path)?);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(&line)?);
        }
        if let Some(limit) = limit
            && entries.len() > limit
        {
            entries.drain(..entries.len() - limit);
        }
        Ok(entries)
    }

    /// Conversation to replay into a resumed session: the user and assistant
    /// messages among the last `max_entries` entries. Tool entries are
    /// skipped.
    pub fn resumption_context(
        &self,
        session_id: &str,
        max_entries: usize,
    ) -> TranscriptResult<Vec<ConversationItem>> {
        let entries = self.get_transcript(session_id, Some(max_entries))?;
        Ok(entries
            .into_iter()
            .filter_map(|entry| {
                let text = entry.text.filter(|t| !t.is_empty())?;
                match entry.entry_type {
                    EntryType::User => Some(ConversationItem::user_message(ItemContent::text(text))),
                    EntryType::Assistant => {
                        Some(ConversationItem::assistant_message(ItemContent::text(text)))
                    }
                    _ => None,
                }
            })
            .collect())
    }
}

fn is_valid_session_id(id: &str) -> bool {
    !id.is_empty() && !id.contains("..") && !id.contains('/') && !id.contains('\\')
}

fn preview(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

fn title(text: &str) -> String {
    let mut title = preview(text, TITLE_CHARS);
    if text.chars().count() > TITLE_CHARS {
        title.push_str("...");
    }
    title
}

fn read_json<T: DeserializeOwned>(path: &Path) -> TranscriptResult<T> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Write to a temp file in the same directory, fsync, then rename.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> TranscriptResult<()> {
    let json = serde_json::to_string_pretty(value)?;
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_title_truncated_on_char_boundary() {
        let text = "é".repeat(60);
        let t = title(&text);
        assert_eq!(t.chars().count(), 53);
        assert!(t.ends_with("..."));
        assert_eq!(title("short"), "short");
    }

    #[test]
    fn test_rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let repo = TranscriptRepository::open(dir.path()).unwrap();
        assert!(matches!(
            repo.create_session("../escape"),
            Err(TranscriptError::InvalidId(_))
        ));
        assert!(matches!(
            repo.get_session("a/b"),
            Err(TranscriptError::InvalidId(_))
        ));
    }

    #[test]
    fn test_atomic_write_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let repo = TranscriptRepository::open(dir.path()).unwrap();
        repo.create_session("sess_1").unwrap();
        assert!(!dir.path().join("sessions.tmp").exists());
        assert!(dir.path().join("sess_1").join("session.json").exists());
    }
}
