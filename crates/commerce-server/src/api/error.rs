//! HTTP conversion for `commerce_core::CoreError` (§6, §7).
//!
//! The core error taxonomy already has a stable `kind()`; this module's
//! only job is picking the HTTP status that matches each kind and shaping
//! the JSON body the client sees.

use crate::api::response::ErrorResponse;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use commerce_core::CoreError;

pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match &self.0 {
            CoreError::BadRequest(_) => StatusCode::BAD_REQUEST,
            CoreError::Overloaded(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::StageTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            CoreError::StageInternal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            CoreError::ConnectorUnavailable(_) => StatusCode::BAD_GATEWAY,
            CoreError::NoConnectorsAvailable => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::NoSuitableOption => StatusCode::UNPROCESSABLE_ENTITY,
            CoreError::UserCancelled => StatusCode::CONFLICT,
            CoreError::ConfirmationTimeout => StatusCode::REQUEST_TIMEOUT,
            CoreError::RiskBlocked { .. } => StatusCode::FORBIDDEN,
            CoreError::DuplicateSuppressed => StatusCode::OK,
            CoreError::JournalFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse::new("CoreError", self.0.to_string(), self.0.kind());
        if self.0.is_fatal() {
            tracing::error!(kind = self.0.kind(), "fatal core error surfaced to client");
        } else {
            tracing::warn!(kind = self.0.kind(), "core error surfaced to client");
        }
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_request_maps_to_400() {
        let err = ApiError::from(CoreError::BadRequest("missing field".to_string()));
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn risk_blocked_maps_to_403() {
        let err = ApiError::from(CoreError::RiskBlocked { score: 90 });
        assert_eq!(err.status_code(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn confirmation_timeout_maps_to_408() {
        let err = ApiError::from(CoreError::ConfirmationTimeout);
        assert_eq!(err.status_code(), StatusCode::REQUEST_TIMEOUT);
    }
}
