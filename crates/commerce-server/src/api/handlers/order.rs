//! `POST /api/order/confirm` and the supplemental `POST /api/order/otp`.
//!
//! §6 only names `selected_product_index` in the confirm body, with no
//! separate accept/reject flag; an absent index is the client's way of
//! declining (the alternative — requiring clients to also pass
//! `accepted: false` — adds a field the spec never names for no gain, since
//! "no index chosen" already means "nothing to purchase").

use crate::api::error::ApiError;
use crate::api::response;
use crate::api::routes::AppState;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct ConfirmRequest {
    pub session_id: String,
    pub selected_product_index: Option<usize>,
}

pub async fn confirm(
    State(state): State<AppState>,
    Json(req): Json<ConfirmRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let accepted = req.selected_product_index.is_some();
    let result = state
        .orchestrator
        .confirm(&req.session_id, accepted, req.selected_product_index)
        .await?;
    Ok(response::ok(result))
}

/// Supplemental endpoint (§4.8 phase 4 names the `otp_required` event but
/// §6's table never gives the client a place to post the code back; this is
/// the analogous counterpart to `/api/order/confirm`).
#[derive(Debug, Deserialize)]
pub struct OtpRequest {
    pub session_id: String,
    pub code: String,
}

pub async fn submit_otp(
    State(state): State<AppState>,
    Json(req): Json<OtpRequest>,
) -> impl IntoResponse {
    let delivered = state.orchestrator.supply_otp(&req.session_id, req.code);
    response::ok(serde_json::json!({ "delivered": delivered }))
}
