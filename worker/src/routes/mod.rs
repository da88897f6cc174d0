//! Router assembly. CORS, tracing and timeout layers wrap every route
//! the same way the teacher crate's `api::router` does; the origin
//! policy itself follows spec.md §6 with the dev-localhost-reflection
//! addition resolved in DESIGN.md (Open Question #4).

pub mod admin;
pub mod auth;
pub mod health;

use std::time::Duration;

use axum::http::{header, HeaderName, HeaderValue, Method};
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

const REQUEST_TIMEOUT_SECS: u64 = 30;

/// `Access-Control-Allow-Headers: *` does not satisfy the fetch spec's
/// credentialed-request rules, so browsers would silently drop every
/// header on a credentialed call — list the ones this API actually
/// reads instead of reaching for `Any` (spec.md §6 headers contract).
fn allowed_request_headers() -> Vec<HeaderName> {
    vec![
        header::AUTHORIZATION,
        header::CONTENT_TYPE,
        HeaderName::from_static("x-csrf-token"),
        HeaderName::from_static("x-service-key"),
        HeaderName::from_static("x-customer-id"),
        HeaderName::from_static("x-strixun-request-integrity"),
        HeaderName::from_static("x-strixun-request-timestamp"),
    ]
}

fn cors_layer(state: &AppState) -> CorsLayer {
    let is_local_dev = state.config.environment.is_local_dev();
    let allowed: Vec<HeaderValue> = state
        .config
        .allowed_origins
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();

    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::PATCH, Method::DELETE, Method::OPTIONS])
        .allow_headers(allowed_request_headers())
        .allow_credentials(true);

    if is_local_dev {
        // Dev posture reflects any localhost origin instead of requiring
        // it to be pre-listed in ALLOWED_ORIGINS — never a wildcard,
        // since `allow_credentials(true)` forbids combining the two.
        layer.allow_origin(tower_http::cors::AllowOrigin::predicate(|origin, _| {
            origin.as_bytes().starts_with(b"http://localhost:") || origin.as_bytes().starts_with(b"http://127.0.0.1:")
        }))
    } else {
        layer.allow_origin(allowed)
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state);

    Router::new()
        .route("/auth/request-otp", post(auth::request_otp))
        .route("/auth/verify-otp", post(auth::verify_otp))
        .route("/auth/refresh", post(auth::refresh))
        .route("/auth/logout", post(auth::logout))
        .route("/auth/me", get(auth::me))
        .route("/admin/migrate-customers", post(admin::migrate_customers))
        .route("/health", get(health::health))
        .route("/healthz", get(health::healthz))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(REQUEST_TIMEOUT_SECS)))
        .with_state(state)
}
