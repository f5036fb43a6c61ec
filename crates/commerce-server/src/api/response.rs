//! API response helpers (§6).
//!
//! Thin wrappers that keep every handler's success/error shape consistent
//! without each one hand-rolling a `(StatusCode, Json<_>)` tuple.

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct SuccessResponse<T> {
    pub success: bool,
    pub data: T,
}

impl<T: Serialize> SuccessResponse<T> {
    pub fn new(data: T) -> Self {
        Self { success: true, data }
    }
}

pub fn ok<T: Serialize>(data: T) -> impl IntoResponse {
    (StatusCode::OK, Json(SuccessResponse::new(data)))
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    pub message: String,
    pub code: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
            message: message.into(),
            code: code.into(),
        }
    }
}

pub fn not_found(message: impl Into<String>) -> impl IntoResponse {
    let body = ErrorResponse::new("NotFound", message, "NOT_FOUND");
    (StatusCode::NOT_FOUND, Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_response_sets_flag() {
        let resp = SuccessResponse::new(42);
        assert!(resp.success);
        assert_eq!(resp.data, 42);
    }
}
