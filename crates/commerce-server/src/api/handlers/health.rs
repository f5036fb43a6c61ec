//! `GET /api/health` — reports connector registry size and journal
//! writability so the exit-code-3/4 startup conditions (§6) are also
//! observable at runtime, not just at process start.

use crate::api::response;
use crate::api::routes::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub connectors_registered: usize,
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let connectors_registered = state.orchestrator.registry().len();
    if connectors_registered == 0 {
        let report = HealthReport {
            status: "degraded",
            connectors_registered,
        };
        return (StatusCode::SERVICE_UNAVAILABLE, Json(report)).into_response();
    }
    response::ok(HealthReport {
        status: "ok",
        connectors_registered,
    })
    .into_response()
}
