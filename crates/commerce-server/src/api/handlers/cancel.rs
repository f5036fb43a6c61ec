//! `POST /api/cancel` — cancel the active run on a session.

use crate::api::response;
use crate::api::routes::AppState;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub session_id: String,
}

pub async fn cancel(
    State(state): State<AppState>,
    Json(req): Json<CancelRequest>,
) -> impl IntoResponse {
    let cancelled = state.orchestrator.cancel(&req.session_id);
    response::ok(serde_json::json!({ "cancelled": cancelled }))
}
