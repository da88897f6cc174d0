//! End-to-end router tests covering the three literal scenarios named
//! in spec.md §8: happy-path login, lockout after repeated bad OTPs,
//! and rate limiting of `request-otp`. Driven with `tower::ServiceExt`
//! against the real `axum::Router`, the same way
//! `plimsoll-indexer`'s own route tests drive its router with `oneshot`
//! rather than spinning up a TCP listener.

use std::env;
use std::sync::Mutex;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

use strixun_core::config::Config;

mod common;
use common::{build_test_router, extract_json};

// `Config::from_env` reads process-global env vars; serialize tests that
// touch it so they don't race each other's ENVIRONMENT/EMAIL_API_KEY.
static ENV_LOCK: Mutex<()> = Mutex::new(());

fn test_config() -> Config {
    env::set_var("ENVIRONMENT", "test");
    env::set_var("JWT_SECRET", "test-secret-at-least-32-bytes-long!!");
    env::set_var("EMAIL_API_KEY", "test_local");
    env::remove_var("NETWORK_INTEGRITY_KEYPHRASE");
    Config::from_env().expect("test config loads")
}

async fn request_otp(app: &axum::Router, email: &str) -> Value {
    let req = Request::builder()
        .method("POST")
        .uri("/auth/request-otp")
        .header("content-type", "application/json")
        .body(Body::from(json!({ "email": email }).to_string()))
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    extract_json(resp).await
}

async fn verify_otp(app: &axum::Router, email: &str, otp: &str) -> (StatusCode, Value) {
    let req = Request::builder()
        .method("POST")
        .uri("/auth/verify-otp")
        .header("content-type", "application/json")
        .body(Body::from(json!({ "email": email, "otp": otp }).to_string()))
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    (status, extract_json(resp).await)
}

#[tokio::test]
async fn happy_path_login_issues_session() {
    let _guard = ENV_LOCK.lock().unwrap();
    let app = build_test_router(test_config());

    let otp_body = request_otp(&app, "student@idling.app").await;
    let otp = otp_body["otp"].as_str().expect("otp echoed back in test mode").to_string();

    let (status, body) = verify_otp(&app, "student@idling.app", &otp).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["email"], "student@idling.app");
    assert!(body["token"].as_str().unwrap().split('.').count() == 3, "token is a JWT");
}

#[tokio::test]
async fn wrong_otp_five_times_locks_the_code() {
    let _guard = ENV_LOCK.lock().unwrap();
    let app = build_test_router(test_config());

    request_otp(&app, "locked-out@idling.app").await;

    for _ in 0..5 {
        let (status, _) = verify_otp(&app, "locked-out@idling.app", "000000000").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    // The sixth attempt finds the record already locked (5 attempts used)
    // and is rejected as attempts-exhausted before the record is deleted.
    let (status, body) = verify_otp(&app, "locked-out@idling.app", "000000000").await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"], "RateLimited");

    // A seventh attempt now 400s: the record is gone.
    let (status, body) = verify_otp(&app, "locked-out@idling.app", "000000000").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "ValidationError");
}

#[tokio::test]
async fn request_otp_rate_limited_after_three_in_an_hour() {
    let _guard = ENV_LOCK.lock().unwrap();
    let app = build_test_router(test_config());

    for _ in 0..3 {
        let body = request_otp(&app, "rate-limited@idling.app").await;
        assert_eq!(body["success"], true);
    }

    let req = Request::builder()
        .method("POST")
        .uri("/auth/request-otp")
        .header("content-type", "application/json")
        .body(Body::from(json!({ "email": "rate-limited@idling.app" }).to_string()))
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = extract_json(resp).await;
    assert_eq!(body["error"], "RateLimited");
    assert!(body["retryAfter"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn healthz_is_unauthenticated() {
    let _guard = ENV_LOCK.lock().unwrap();
    let app = build_test_router(test_config());

    let req = Request::builder().method("GET").uri("/healthz").body(Body::empty()).unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn health_requires_auth() {
    let _guard = ENV_LOCK.lock().unwrap();
    let app = build_test_router(test_config());

    let req = Request::builder().method("GET").uri("/health").body(Body::empty()).unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}
