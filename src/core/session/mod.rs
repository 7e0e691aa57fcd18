//! Session orchestration.
//!
//! [`SessionStateMachine`] is the per-session coordinator: it owns the
//! conversation history, playback positions, turn detector, tool dispatcher
//! and interruption coordinator, and sequences responses so that at most one
//! is ever in flight. [`runner`] wraps it in a tokio task with a single
//! input queue.

mod config;
mod events;
mod machine;
pub mod runner;
mod state;

use thiserror::Error;

pub use config::SessionConfig;
pub use events::{
    InboundEvent, OutboundCommand, ResponseReason, ResponseStatus, SessionFault,
    SessionNotification,
};
pub use machine::{SessionSnapshot, SessionStateMachine};
pub use runner::{SessionHandle, SessionOutput, spawn_session};
pub use state::{SessionState, Transition};

use crate::core::history::HistoryError;
use crate::core::tools::DuplicateToolError;

/// Failures returned synchronously to the calling application code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("Tool already registered: {0}")]
    DuplicateTool(String),

    #[error("A response is already active")]
    ResponseAlreadyActive,

    #[error("Item not found: {0}")]
    ItemNotFound(String),

    #[error("Item already exists: {0}")]
    DuplicateItem(String),

    #[error("Session is closed")]
    SessionClosed,
}

pub type SessionResult<T> = Result<T, SessionError>;

impl From<DuplicateToolError> for SessionError {
    fn from(err: DuplicateToolError) -> Self {
        SessionError::DuplicateTool(err.0)
    }
}

impl From<HistoryError> for SessionError {
    fn from(err: HistoryError) -> Self {
        match err {
            HistoryError::ItemNotFound(id) => SessionError::ItemNotFound(id),
            HistoryError::DuplicateItem(id) => SessionError::DuplicateItem(id),
        }
    }
}
