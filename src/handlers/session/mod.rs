//! Orchestrated voice session over WebSocket.

pub mod handler;
pub mod messages;

pub use handler::{SessionParams, session_handler};
pub use messages::{ClientMessage, ServerMessage, SessionSetup};
