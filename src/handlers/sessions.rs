//! Session management endpoints.

use axum::extract::{Path, State};
use axum::Json;
use serde_json::{json, Value};

use crate::error::{success_envelope, ApiError, ErrorCode};
use crate::state::AppState;

/// DELETE /session/:id — close a session and dispose its stores.
pub async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let session = state
        .sessions
        .remove(&id)
        .await
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, format!("no open session {id}")))?;
    state.tasks.remove_session(&session.id).await;
    state.capabilities.remove(&session.id).await;
    Ok(Json(success_envelope(
        "session_close",
        json!({ "session_id": id, "closed": true }),
        None,
    )))
}

/// GET /sessions — operational listing.
pub async fn list_sessions(State(state): State<AppState>) -> Json<Value> {
    let sessions = state.sessions.list().await;
    let count = sessions.len();
    Json(success_envelope(
        "session_list",
        json!({ "sessions": sessions, "count": count }),
        None,
    ))
}
