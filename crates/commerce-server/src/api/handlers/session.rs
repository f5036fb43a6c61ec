//! `GET /api/session/{id}` — the session's current snapshot (completed
//! stages only; see `SessionStore::sanitized_run`).

use crate::api::response;
use crate::api::routes::AppState;
use axum::extract::{Path, State};
use axum::response::IntoResponse;

pub async fn get_session(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.orchestrator.session_snapshot(&id) {
        Some(snapshot) => response::ok(snapshot).into_response(),
        None => response::not_found(format!("no session '{id}'")).into_response(),
    }
}
