//! Read-only HTTP endpoints
//!
//! Everything here reads the lock-free session snapshots; nothing waits on
//! a session actor.

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use companion_protocol::{FeedEntry, SessionState, SessionSummary};
use serde::Serialize;

use crate::error::SessionError;
use crate::export::transcript_markdown;
use crate::feed::reconstruct;
use crate::session_actor::SessionActorHandle;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

/// A `SessionError` rendered as a JSON response
#[derive(Debug)]
pub struct ApiError(SessionError);

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            SessionError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::CONFLICT,
        };
        let body = ErrorBody {
            code: self.0.code(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct SessionsResponse {
    pub sessions: Vec<SessionSummary>,
}

#[derive(Debug, Serialize)]
pub struct FeedResponse {
    pub session_id: String,
    pub revision: u64,
    pub entries: Vec<FeedEntry>,
}

fn lookup(state: &AppState, session_id: &str) -> Result<SessionActorHandle, ApiError> {
    state
        .registry
        .get_session(session_id)
        .ok_or_else(|| SessionError::NotFound(session_id.to_string()).into())
}

pub async fn health_handler() -> impl IntoResponse {
    "OK"
}

pub async fn list_sessions(State(state): State<AppState>) -> Json<SessionsResponse> {
    Json(SessionsResponse {
        sessions: state.registry.summaries(),
    })
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionState>, ApiError> {
    let snapshot = lookup(&state, &session_id)?.snapshot();
    Ok(Json(snapshot.to_state()))
}

pub async fn get_feed(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<FeedResponse>, ApiError> {
    let snapshot = lookup(&state, &session_id)?.snapshot();
    Ok(Json(FeedResponse {
        session_id,
        revision: snapshot.summary.revision,
        entries: reconstruct(&snapshot.messages),
    }))
}

pub async fn export_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Response, ApiError> {
    let snapshot = lookup(&state, &session_id)?.snapshot();
    let markdown = transcript_markdown(&snapshot.messages);
    Ok((
        [(header::CONTENT_TYPE, "text/markdown; charset=utf-8")],
        markdown,
    )
        .into_response())
}
