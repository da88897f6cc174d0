//! `/admin/*` — gated by `isSuperAdmin` in the JWT or a matching
//! `X-Service-Key` (spec.md §4.5). The one representative endpoint
//! wired here triggers the legacy-key migration engine so it has a
//! real caller instead of living only in `strixun-core`'s tests.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::Value;

use crate::error::ApiError;
use crate::extract::{bearer_token, service_key};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrateBody {
    pub migration_id: String,
    pub old_prefix: String,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub delete_old: bool,
}

async fn require_super_admin(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let claims = match bearer_token(headers) {
        Some(token) => state.identity.decode_token(token).ok(),
        None => None,
    };
    state.identity.assert_super_admin(claims.as_ref(), service_key(headers)).map_err(ApiError)
}

/// Moves legacy `customer_{id}` keys onto the canonical
/// `customer:profile:{id}` entity shape, indexing by email as it goes.
/// The `transform` here is intentionally minimal — each product service
/// supplies its own when it wires this endpoint for its own legacy
/// prefixes; this one demonstrates the customer-profile migration cited
/// literally in spec.md §8 scenario 6.
pub async fn migrate_customers(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<MigrateBody>,
) -> Result<Response, ApiError> {
    require_super_admin(&state, &headers).await?;

    let record = state
        .identity
        .store()
        .migrate(
            &body.migration_id,
            "customer",
            &body.old_prefix,
            strixun_core::entity::MigrationOptions {
                dry_run: body.dry_run,
                delete_old: body.delete_old,
            },
            |_old_key, raw| {
                let value: Value = serde_json::from_slice(raw).ok()?;
                let email = value.get("email")?.as_str()?.to_string();
                let id = value.get("customerId").and_then(|v| v.as_str())?.to_string();
                let email_hash = hex::encode(strixun_core::crypto::sha256(email.to_lowercase().trim().as_bytes()));
                Some(strixun_core::entity::TransformedEntity {
                    entity_type: "profile".to_string(),
                    id,
                    data: value,
                    indexes: vec![],
                    single_indexes: vec![("by-email".to_string(), email_hash)],
                })
            },
        )
        .await;

    Ok(Json(record).into_response())
}
