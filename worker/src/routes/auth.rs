//! `/auth/*` — every endpoint named in spec.md §6's HTTP surface table.

use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::extract::{bearer_token, csrf_header};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct RequestOtpBody {
    pub email: String,
}

/// No generic rate-limit bucket applies here — `otp-request` is its own
/// dedicated bucket and the two systems are kept orthogonal rather than
/// stacked (see DESIGN.md, Open Question #1).
pub async fn request_otp(
    State(state): State<AppState>,
    Json(body): Json<RequestOtpBody>,
) -> Result<Response, ApiError> {
    let resp = state.identity.request_otp(&body.email).await?;
    Ok((StatusCode::OK, Json(resp)).into_response())
}

#[derive(Debug, Deserialize)]
pub struct VerifyOtpBody {
    pub email: String,
    pub otp: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VerifyOtpWireResponse {
    token: String,
    customer_id: String,
    email: String,
    display_name: String,
    expires_at: chrono::DateTime<chrono::Utc>,
}

pub async fn verify_otp(
    State(state): State<AppState>,
    Json(body): Json<VerifyOtpBody>,
) -> Result<Response, ApiError> {
    let resp = state.identity.verify_otp(&body.email, &body.otp).await?;

    let max_age = (resp.expires_at - chrono::Utc::now()).num_seconds().max(0);
    let cookie = format!(
        "auth_token={}; Domain=.{}; Path=/; Secure; HttpOnly; SameSite=Lax; Max-Age={}",
        resp.token, state.config.apex_domain, max_age
    );

    let mut response = Json(VerifyOtpWireResponse {
        token: resp.token,
        customer_id: resp.customer_id,
        email: resp.email,
        display_name: resp.display_name,
        expires_at: resp.expires_at,
    })
    .into_response();

    response
        .headers_mut()
        .insert(axum::http::header::SET_COOKIE, HeaderValue::from_str(&cookie).expect("cookie value is ASCII"));

    Ok(response)
}

fn require_csrf(headers: &HeaderMap, claims: &strixun_core::identity::Claims) -> Result<(), ApiError> {
    let provided = csrf_header(headers);
    match provided {
        Some(token) if strixun_core::crypto::ct_eq(token.as_bytes(), claims.csrf.as_bytes()) => Ok(()),
        _ => Err(ApiError(strixun_core::error::CoreError::Forbidden("csrf token mismatch".into()))),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshWireResponse {
    token: String,
    expires_at: chrono::DateTime<chrono::Utc>,
}

pub async fn refresh(State(state): State<AppState>, headers: HeaderMap) -> Result<Response, ApiError> {
    let token = bearer_token(&headers).ok_or(strixun_core::error::CoreError::Unauthorized)?;
    let claims = state.identity.authenticate(token).await?;
    require_csrf(&headers, &claims)?;

    let resp = state.identity.refresh(token).await?;
    Ok(Json(RefreshWireResponse { token: resp.token, expires_at: resp.expires_at }).into_response())
}

#[derive(Debug, Serialize)]
struct SuccessResponse {
    success: bool,
}

pub async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Result<Response, ApiError> {
    let token = bearer_token(&headers).ok_or(strixun_core::error::CoreError::Unauthorized)?;
    let claims = state.identity.decode_token(token)?;
    require_csrf(&headers, &claims)?;

    state.identity.logout(token).await?;
    Ok(Json(SuccessResponse { success: true }).into_response())
}

pub async fn me(State(state): State<AppState>, headers: HeaderMap) -> Result<Response, ApiError> {
    let token = bearer_token(&headers).ok_or(strixun_core::error::CoreError::Unauthorized)?;
    let customer = state.identity.me(token).await?;
    let plain = serde_json::to_value(customer.filtered_for_self()).expect("Customer always serializes");

    let envelope = strixun_core::cipher::encrypt_v5_json(token, &plain);
    let mut response = (StatusCode::OK, envelope).into_response();
    response.headers_mut().insert("x-encrypted", HeaderValue::from_static("true"));
    response.headers_mut().insert(
        axum::http::header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    Ok(response)
}
