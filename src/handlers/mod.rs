//! HTTP and WebSocket request handlers
//!
//! - `api` - Health check endpoint
//! - `session` - Orchestrated voice session WebSocket
//! - `sessions` - Stored and live session inspection
//! - `tools` - Configured webhook tools listing and direct execution

pub mod api;
pub mod session;
pub mod sessions;
pub mod tools;

pub use session::session_handler;
