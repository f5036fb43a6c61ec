//! `POST /api/chat/process` — create/resume a session and drive one run.

use crate::api::response;
use crate::api::routes::AppState;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct ProcessRequest {
    pub session_id: String,
    pub message: String,
}

pub async fn process(
    State(state): State<AppState>,
    Json(req): Json<ProcessRequest>,
) -> impl IntoResponse {
    let outcome = state.orchestrator.process(&req.session_id, &req.message).await;
    response::ok(outcome)
}
