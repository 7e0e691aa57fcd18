//! REST view over stored and live sessions.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::info;

use crate::core::session::SessionSnapshot;
use crate::errors::{AppError, AppResult};
use crate::state::AppState;
use crate::transcript::{
    EndReason, SessionStats, SessionStatus, TranscriptEntry, TranscriptRepository,
    VoiceSessionRecord,
};

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TranscriptParams {
    /// Only the last `limit` transcript entries
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct SessionListResponse {
    pub sessions: Vec<VoiceSessionRecord>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct SessionStatsResponse {
    #[serde(flatten)]
    pub stats: SessionStats,
    pub active_sessions: usize,
}

#[derive(Debug, Serialize)]
pub struct SessionDetailResponse {
    pub session: VoiceSessionRecord,
    pub transcript: Vec<TranscriptEntry>,
    /// Present while the session is running on this server
    #[serde(skip_serializing_if = "Option::is_none")]
    pub live: Option<SessionSnapshot>,
}

fn repository(state: &AppState) -> AppResult<&Arc<TranscriptRepository>> {
    state
        .transcripts
        .as_ref()
        .ok_or_else(|| AppError::NotFound("transcript persistence is disabled".to_string()))
}

/// `GET /sessions`
pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> AppResult<Json<SessionListResponse>> {
    let repo = repository(&state)?;
    let status = params
        .status
        .as_deref()
        .map(str::parse::<SessionStatus>)
        .transpose()
        .map_err(AppError::BadRequest)?;
    let limit = params.limit.unwrap_or(DEFAULT_LIST_LIMIT).min(MAX_LIST_LIMIT);

    let sessions = repo.list_sessions(status, limit)?;
    Ok(Json(SessionListResponse {
        count: sessions.len(),
        sessions,
    }))
}

/// `GET /sessions/stats`
pub async fn session_stats(
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<SessionStatsResponse>> {
    let repo = repository(&state)?;
    Ok(Json(SessionStatsResponse {
        stats: repo.session_stats()?,
        active_sessions: state.sessions.len(),
    }))
}

/// `GET /sessions/{id}`
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Query(params): Query<TranscriptParams>,
) -> AppResult<Json<SessionDetailResponse>> {
    let repo = repository(&state)?;
    let session = repo
        .get_session(&session_id)?
        .ok_or_else(|| AppError::NotFound(format!("session {session_id}")))?;
    let transcript = repo.get_transcript(&session_id, params.limit)?;

    // clone the handle out so no map guard is held across the await
    let handle = state.sessions.get(&session_id).map(|s| s.handle.clone());
    let live = match handle {
        Some(handle) => handle.snapshot().await.ok(),
        None => None,
    };

    Ok(Json(SessionDetailResponse {
        session,
        transcript,
        live,
    }))
}

/// `POST /sessions/{id}/end`
///
/// A live session is closed and its record is finalized by the WebSocket
/// handler; a stored session that is still marked active is ended directly.
pub async fn end_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let handle = state.sessions.get(&session_id).map(|s| s.handle.clone());
    if let Some(handle) = handle {
        info!(session_id = %session_id, "Ending live session on request");
        // an already closed session has nothing left to stop
        let _ = handle.close().await;
        return Ok((
            StatusCode::ACCEPTED,
            Json(json!({ "session_id": session_id, "status": "closing" })),
        )
            .into_response());
    }

    let repo = repository(&state)?;
    let existing = repo
        .get_session(&session_id)?
        .ok_or_else(|| AppError::NotFound(format!("session {session_id}")))?;
    if existing.status != SessionStatus::Active {
        return Err(AppError::Conflict(format!(
            "session {session_id} already ended ({})",
            existing.status.as_str()
        )));
    }
    let record = repo.end_session(&session_id, EndReason::UserEnded, None)?;
    Ok((StatusCode::OK, Json(record)).into_response())
}
