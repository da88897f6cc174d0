//! `GET /health` (authed, per spec.md §6) and `GET /healthz` (added
//! liveness probe, unauthenticated — grounded on
//! `plimsoll-indexer::api::health`, which reports only process
//! liveness, never customer data).

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::error::ApiError;
use crate::extract::{bearer_token, is_service_request};
use crate::state::AppState;

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
}

pub async fn health(State(state): State<AppState>, headers: HeaderMap) -> Result<Response, ApiError> {
    if !is_service_request(&headers) {
        match bearer_token(&headers) {
            Some(token) => {
                state.identity.authenticate(token).await?;
            }
            None => return Err(ApiError(strixun_core::error::CoreError::Unauthorized)),
        }
    }

    Ok(Json(HealthResponse { status: "ok", service: "strixun-identity-worker" }).into_response())
}

pub async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok", service: "strixun-identity-worker" })
}
