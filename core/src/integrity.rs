//! IntegrityLayer (C4) — HMAC request/response signing for
//! service-to-service calls. Inert for user-facing JWT-bearer calls,
//! which use the response-cipher envelope (`crate::cipher`) instead.

use chrono::Utc;

use crate::crypto::{b64url_decode, b64url_encode, ct_eq, hmac_sha256};

pub const REQUEST_INTEGRITY_HEADER: &str = "X-Strixun-Request-Integrity";
pub const REQUEST_TIMESTAMP_HEADER: &str = "X-Strixun-Request-Timestamp";
pub const CUSTOMER_ID_HEADER: &str = "X-Customer-ID";
pub const RESPONSE_INTEGRITY_HEADER: &str = "X-Strixun-Response-Integrity";
pub const SERVICE_REQUEST_HEADER: &str = "X-Service-Request";
pub const SERVICE_KEY_HEADER: &str = "X-Service-Key";

/// Clock skew tolerated in request timestamps.
pub const REPLAY_WINDOW_SECS: i64 = 5 * 60;

const NO_CUSTOMER: &str = "\u{2205}"; // "∅"

pub struct IntegrityLayer {
    keyphrase: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct SignedRequestHeaders {
    pub signature: String,
    pub timestamp: String,
    pub customer_id: Option<String>,
}

impl IntegrityLayer {
    pub fn new(keyphrase: impl Into<Vec<u8>>) -> Self {
        IntegrityLayer {
            keyphrase: keyphrase.into(),
        }
    }

    fn request_message(
        method: &str,
        path_with_query: &str,
        body: &[u8],
        timestamp: &str,
        customer_id: Option<&str>,
    ) -> Vec<u8> {
        let mut msg = Vec::new();
        msg.extend_from_slice(method.as_bytes());
        msg.push(b'\n');
        msg.extend_from_slice(path_with_query.as_bytes());
        msg.push(b'\n');
        msg.extend_from_slice(body);
        msg.push(b'\n');
        msg.extend_from_slice(timestamp.as_bytes());
        msg.push(b'\n');
        msg.extend_from_slice(customer_id.unwrap_or(NO_CUSTOMER).as_bytes());
        msg
    }

    /// Signs an outbound request, producing the three headers the spec
    /// requires (`X-Strixun-Request-Integrity`, `-Timestamp`, and
    /// `X-Customer-ID` when known).
    pub fn sign_request(
        &self,
        method: &str,
        path_with_query: &str,
        body: &[u8],
        customer_id: Option<&str>,
    ) -> SignedRequestHeaders {
        let timestamp = Utc::now().timestamp().to_string();
        let msg = Self::request_message(method, path_with_query, body, &timestamp, customer_id);
        let sig = hmac_sha256(&self.keyphrase, &msg);
        SignedRequestHeaders {
            signature: b64url_encode(&sig),
            timestamp,
            customer_id: customer_id.map(str::to_string),
        }
    }

    /// Verifies an inbound request's signature and replay-window
    /// timestamp. `customer_id` should already be resolved via the
    /// order in the spec (explicit field → header → JWT claim → none).
    pub fn verify_request(
        &self,
        method: &str,
        path_with_query: &str,
        body: &[u8],
        timestamp: &str,
        customer_id: Option<&str>,
        signature_b64url: &str,
    ) -> bool {
        let now = Utc::now().timestamp();
        let Ok(ts) = timestamp.parse::<i64>() else {
            return false;
        };
        if (now - ts).abs() > REPLAY_WINDOW_SECS {
            return false;
        }
        let Ok(sig_bytes) = b64url_decode(signature_b64url) else {
            return false;
        };
        let msg = Self::request_message(method, path_with_query, body, timestamp, customer_id);
        let expected = hmac_sha256(&self.keyphrase, &msg);
        ct_eq(&expected, &sig_bytes)
    }

    fn response_message(status: u16, body: &[u8]) -> Vec<u8> {
        let mut msg = Vec::new();
        msg.extend_from_slice(status.to_string().as_bytes());
        msg.push(b'\n');
        msg.extend_from_slice(body);
        msg
    }

    pub fn sign_response(&self, status: u16, body: &[u8]) -> String {
        let msg = Self::response_message(status, body);
        b64url_encode(&hmac_sha256(&self.keyphrase, &msg))
    }

    pub fn verify_response(&self, status: u16, body: &[u8], signature_b64url: &str) -> bool {
        let Ok(sig_bytes) = b64url_decode(signature_b64url) else {
            return false;
        };
        let msg = Self::response_message(status, body);
        let expected = hmac_sha256(&self.keyphrase, &msg);
        ct_eq(&expected, &sig_bytes)
    }
}

/// Resolves the customer id to embed/verify, in the order the spec
/// mandates: explicit field, then header, then JWT claim, else none.
pub fn resolve_customer_id(
    explicit: Option<&str>,
    header: Option<&str>,
    jwt_claim: Option<&str>,
) -> Option<String> {
    explicit
        .or(header)
        .or(jwt_claim)
        .map(str::to_string)
}

/// Known image content-type / URL patterns that still get response
/// signatures for opaque-byte integrity even though they're 200s.
pub fn is_image_response(content_type: &str, url_path: &str) -> bool {
    content_type.starts_with("image/")
        || [".png", ".jpg", ".jpeg", ".gif", ".webp"]
            .iter()
            .any(|ext| url_path.ends_with(ext))
}

/// Recognises an inbound request as service-to-service per the spec's
/// disjunction of signals.
pub struct ServiceCallSignals<'a> {
    pub has_request_integrity_header: bool,
    pub service_request_header: Option<&'a str>,
    pub service_key_header: Option<&'a str>,
    pub bearer_token: Option<&'a str>,
    pub auth_context_type_service: bool,
}

pub fn is_service_call(signals: &ServiceCallSignals) -> bool {
    if signals.has_request_integrity_header {
        return true;
    }
    if signals.service_request_header == Some("true") {
        return true;
    }
    if signals.service_key_header.is_some() {
        return true;
    }
    if signals.auth_context_type_service {
        return true;
    }
    if let Some(token) = signals.bearer_token {
        // A JWT always has exactly 3 dot-segments; anything else is a
        // raw service token.
        if token.split('.').count() != 3 {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_request_signature_verifies() {
        let layer = IntegrityLayer::new(b"shared-keyphrase".to_vec());
        let headers = layer.sign_request("POST", "/customer/sync", b"{}", Some("cust_1"));
        assert!(layer.verify_request(
            "POST",
            "/customer/sync",
            b"{}",
            &headers.timestamp,
            Some("cust_1"),
            &headers.signature
        ));
    }

    #[test]
    fn tampered_body_fails_verification() {
        let layer = IntegrityLayer::new(b"shared-keyphrase".to_vec());
        let headers = layer.sign_request("POST", "/customer/sync", b"{}", Some("cust_1"));
        assert!(!layer.verify_request(
            "POST",
            "/customer/sync",
            b"{\"tampered\":true}",
            &headers.timestamp,
            Some("cust_1"),
            &headers.signature
        ));
    }

    #[test]
    fn wrong_keyphrase_fails_verification() {
        let layer_a = IntegrityLayer::new(b"key-a".to_vec());
        let layer_b = IntegrityLayer::new(b"key-b".to_vec());
        let headers = layer_a.sign_request("GET", "/path", b"", None);
        assert!(!layer_b.verify_request("GET", "/path", b"", &headers.timestamp, None, &headers.signature));
    }

    #[test]
    fn response_round_trips() {
        let layer = IntegrityLayer::new(b"k".to_vec());
        let sig = layer.sign_response(200, b"{\"ok\":true}");
        assert!(layer.verify_response(200, b"{\"ok\":true}", &sig));
        assert!(!layer.verify_response(200, b"{\"ok\":false}", &sig));
    }

    #[test]
    fn service_call_recognition_disjunction() {
        assert!(is_service_call(&ServiceCallSignals {
            has_request_integrity_header: true,
            service_request_header: None,
            service_key_header: None,
            bearer_token: None,
            auth_context_type_service: false,
        }));
        assert!(is_service_call(&ServiceCallSignals {
            has_request_integrity_header: false,
            service_request_header: None,
            service_key_header: None,
            bearer_token: Some("not-a-jwt"),
            auth_context_type_service: false,
        }));
        assert!(!is_service_call(&ServiceCallSignals {
            has_request_integrity_header: false,
            service_request_header: None,
            service_key_header: None,
            bearer_token: Some("aaa.bbb.ccc"),
            auth_context_type_service: false,
        }));
    }

    #[test]
    fn customer_id_resolution_order() {
        assert_eq!(resolve_customer_id(Some("e"), Some("h"), Some("j")).as_deref(), Some("e"));
        assert_eq!(resolve_customer_id(None, Some("h"), Some("j")).as_deref(), Some("h"));
        assert_eq!(resolve_customer_id(None, None, Some("j")).as_deref(), Some("j"));
        assert_eq!(resolve_customer_id(None, None, None), None);
    }
}
