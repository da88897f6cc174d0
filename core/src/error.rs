//! Typed error kinds shared by every component in the substrate.
//!
//! Each variant carries enough information for the worker binary's
//! `IntoResponse` impl to map it onto the HTTP status and JSON body
//! documented in the spec's error-handling section, without leaking
//! which of (bad key / bad tag / malformed input) caused a crypto
//! failure.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("rate limited, retry after {retry_after}s")]
    RateLimited { retry_after: u64 },

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("integrity check failed: {0}")]
    IntegrityFailed(String),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("email delivery failed")]
    EmailDeliveryFailed,

    #[error("internal crypto error")]
    Crypto,

    #[error("request timed out")]
    Timeout,
}

impl CoreError {
    /// The HTTP status this error kind maps to, per the spec's error table.
    pub fn http_status(&self) -> u16 {
        match self {
            CoreError::Validation(_) => 400,
            CoreError::Unauthorized => 401,
            CoreError::Forbidden(_) => 403,
            CoreError::NotFound(_) => 404,
            CoreError::Conflict(_) => 409,
            CoreError::RateLimited { .. } => 429,
            CoreError::DecryptionFailed => 401,
            CoreError::IntegrityFailed(_) => 500,
            CoreError::UpstreamUnavailable(_) => 503,
            CoreError::EmailDeliveryFailed => 502,
            CoreError::Crypto => 500,
            CoreError::Timeout => 408,
        }
    }

    pub fn retryable(&self) -> bool {
        matches!(
            self,
            CoreError::RateLimited { .. }
                | CoreError::UpstreamUnavailable(_)
                | CoreError::Timeout
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "ValidationError",
            CoreError::Unauthorized => "Unauthorized",
            CoreError::Forbidden(_) => "Forbidden",
            CoreError::NotFound(_) => "NotFound",
            CoreError::Conflict(_) => "Conflict",
            CoreError::RateLimited { .. } => "RateLimited",
            CoreError::DecryptionFailed => "DecryptionFailed",
            CoreError::IntegrityFailed(_) => "IntegrityFailed",
            CoreError::UpstreamUnavailable(_) => "UpstreamUnavailable",
            CoreError::EmailDeliveryFailed => "EmailDeliveryFailed",
            CoreError::Crypto => "CryptoError",
            CoreError::Timeout => "Timeout",
        }
    }
}

/// Crypto primitives collapse every failure mode into this before it
/// crosses a component boundary — see `crypto::CryptoError` for the
/// internal (non-leaked) detail.
impl From<crate::crypto::CryptoError> for CoreError {
    fn from(_: crate::crypto::CryptoError) -> Self {
        CoreError::DecryptionFailed
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
