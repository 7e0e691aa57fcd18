use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::handlers::{sessions, tools};
use crate::state::AppState;
use std::sync::Arc;

/// Create the session inspection and tool router
pub fn create_api_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/sessions", get(sessions::list_sessions))
        .route("/sessions/stats", get(sessions::session_stats))
        .route("/sessions/{session_id}", get(sessions::get_session))
        .route("/sessions/{session_id}/end", post(sessions::end_session))
        .route("/tools", get(tools::list_tools))
        .route("/execute/{tool_name}", post(tools::execute_tool))
        .layer(TraceLayer::new_for_http())
}
