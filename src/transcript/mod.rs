//! Durable session transcripts.
//!
//! Each orchestrated session gets a record with running counters and an
//! append-only transcript of finalized conversation items. Stored
//! transcripts can seed a resumed session.

mod models;
mod repository;

use thiserror::Error;

pub use models::{
    EndReason, EntryType, SessionStats, SessionStatus, TranscriptEntry, VoiceSessionRecord,
};
pub use repository::TranscriptRepository;

#[derive(Debug, Error)]
pub enum TranscriptError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid session id: {0}")]
    InvalidId(String),
}

pub type TranscriptResult<T> = Result<T, TranscriptError>;
