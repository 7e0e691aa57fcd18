//! Conversation history store.
//!
//! Ordered log of the items exchanged in a session (user and assistant
//! messages, function calls and their outputs). Content only ever shrinks
//! after it is recorded: interruptions truncate it to what the user heard.

mod item;
mod store;

use thiserror::Error;

pub use item::{
    AudioContent, ConversationItem, DEFAULT_SAMPLE_RATE, ItemContent, ItemKind, ItemRole,
    bytes_to_ms, ms_to_bytes, truncate_text_proportionally,
};
pub use store::{HistoryStore, TruncateOutcome};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HistoryError {
    #[error("Item not found: {0}")]
    ItemNotFound(String),

    #[error("Item already exists: {0}")]
    DuplicateItem(String),
}

pub type HistoryResult<T> = Result<T, HistoryError>;
