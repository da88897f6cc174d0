//! Maps `strixun_core::error::CoreError` onto the HTTP status and JSON
//! body documented in spec.md §7. This is the *only* place a `CoreError`
//! becomes a response — middleware must never swallow one first
//! (spec.md §7 propagation policy).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use strixun_core::error::CoreError;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after: Option<u64>,
}

pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let retry_after = match &err {
            CoreError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        };
        let body = ErrorBody {
            error: err.kind(),
            message: err.to_string(),
            retry_after,
        };
        (status, Json(body)).into_response()
    }
}
