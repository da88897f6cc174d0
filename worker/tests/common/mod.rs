use axum::body::Body;
use axum::response::Response;
use serde_json::Value;

use strixun_core::config::Config;
use strixun_identity_worker::routes::build_router;
use strixun_identity_worker::state::AppState;

pub fn build_test_router(config: Config) -> axum::Router {
    build_router(AppState::build(config))
}

pub async fn extract_json(resp: Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .expect("response body readable");
    serde_json::from_slice(&bytes).expect("response body is JSON")
}
