//! Small header-extraction helpers shared by the route handlers.
//! Auth material is pulled straight off the inbound `HeaderMap` into a
//! typed, request-scoped value — never smuggled onto a mutable request
//! object (spec.md §9).

use axum::http::HeaderMap;

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

pub fn service_key(headers: &HeaderMap) -> Option<&str> {
    headers.get("x-service-key").and_then(|v| v.to_str().ok())
}

pub fn connecting_ip(headers: &HeaderMap) -> Option<&str> {
    headers.get("cf-connecting-ip").and_then(|v| v.to_str().ok())
}

pub fn csrf_header(headers: &HeaderMap) -> Option<&str> {
    headers.get("x-csrf-token").and_then(|v| v.to_str().ok())
}

pub fn request_integrity_header(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(strixun_core::integrity::REQUEST_INTEGRITY_HEADER)
        .and_then(|v| v.to_str().ok())
}

pub fn request_timestamp_header(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(strixun_core::integrity::REQUEST_TIMESTAMP_HEADER)
        .and_then(|v| v.to_str().ok())
}

pub fn customer_id_header(headers: &HeaderMap) -> Option<&str> {
    headers.get(strixun_core::integrity::CUSTOMER_ID_HEADER).and_then(|v| v.to_str().ok())
}

/// Recognises the inbound request as service-to-service per the
/// disjunction in spec.md §4.4.
pub fn is_service_request(headers: &HeaderMap) -> bool {
    let bearer = bearer_token(headers);
    strixun_core::integrity::is_service_call(&strixun_core::integrity::ServiceCallSignals {
        has_request_integrity_header: request_integrity_header(headers).is_some(),
        service_request_header: headers.get("x-service-request").and_then(|v| v.to_str().ok()),
        service_key_header: service_key(headers),
        bearer_token: bearer,
        auth_context_type_service: false,
    })
}
