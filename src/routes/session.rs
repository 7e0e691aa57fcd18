//! Session WebSocket route configuration

use axum::{Router, routing::get};
use tower_http::trace::TraceLayer;

use crate::handlers::session_handler;
use crate::state::AppState;
use std::sync::Arc;

/// Create the session WebSocket router
///
/// # Endpoint
///
/// `GET /session` - WebSocket upgrade for one orchestrated voice session.
/// `GET /session?resume={id}` continues a stored session.
///
/// # Protocol
///
/// After the upgrade, clients send:
/// 1. a `config` message (voice, instructions, turn detection)
/// 2. binary audio frames (PCM 16-bit, 24kHz, mono)
/// 3. `audio_played` reports while output audio plays
///
/// Server responds with:
/// - `session_created` once the provider is connected
/// - `state_changed`, `transcript`, `tool_started`, `tool_finished`, `truncated`
/// - binary frames of output audio
/// - `error` on failures
///
/// # Example
///
/// ```json
/// // Client sends config
/// {"type": "config", "voice": "marin", "turn_detection": {"type": "semantic_vad"}}
///
/// // Server responds
/// {"type": "session_created", "session_id": "...", "model": "gpt-realtime", "voice": "marin", "turn_detection": "semantic_vad", "resumed_items": 0}
///
/// // Client reports playback of output audio
/// {"type": "audio_played", "item_id": "item_abc", "ms_played": 1200}
/// ```
pub fn create_session_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/session", get(session_handler))
        .layer(TraceLayer::new_for_http())
}
