//! IdentityService (C5) — OTP lifecycle, JWT session issuance, refresh/
//! logout/blacklist, rate limiting, and super-admin gating. The single
//! most intricate component; encapsulates all `/auth/*` behaviour.

use std::sync::Arc;

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::Config;
use crate::crypto::{ct_eq, sha256};
use crate::email::{EmailMessage, EmailSender};
use crate::entity::EntityStore;
use crate::error::{CoreError, CoreResult};
use crate::kv::{KvStore, PutOptions};
use crate::models::{Customer, CustomerPreferences, OtpRecord, Session, OTP_TTL_SECS};
use crate::words::generate_display_name;

const EMAIL_SERVICE: &str = "auth";
const CUSTOMER_SERVICE: &str = "customer";

/// Attempts at drawing a fresh word-list name before falling back to a
/// disambiguated one (spec.md §4.5 "generate a unique displayName").
const DISPLAY_NAME_GENERATION_ATTEMPTS: u32 = 20;

/// Numeric OTP width. Draws are debiased per spec.md §7 before reducing
/// mod `10^9` so every 9-digit value is equally likely.
const OTP_MODULUS: u64 = 1_000_000_000;

fn email_regex() -> &'static Regex {
    use std::sync::OnceLock;
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)+$")
            .expect("static regex is valid")
    })
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

pub fn validate_email(email: &str) -> CoreResult<()> {
    if email_regex().is_match(email) {
        Ok(())
    } else {
        Err(CoreError::Validation("invalid email".into()))
    }
}

fn email_hash(normalized_email: &str) -> String {
    hex::encode(sha256(normalized_email.as_bytes()))
}

/// Draws a uniform 9-digit code, rejecting the biased top zone of the
/// 64-bit sample space before reducing mod `10^9` (spec.md §7).
pub fn generate_otp_code() -> String {
    let reject_above = u64::MAX - (u64::MAX % OTP_MODULUS);
    let mut rng = rand::thread_rng();
    loop {
        let sample = rng.next_u64();
        if sample < reject_above {
            return format!("{:09}", sample % OTP_MODULUS);
        }
    }
}

// ---------------------------------------------------------------------
// Rate limiting — sliding window, timestamp-list backed (spec.md §4.5,
// design note: "stay with timestamp lists for exactness in low-volume
// buckets").
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct RateLimitBucketSpec {
    pub name: &'static str,
    pub max: u32,
    pub window_secs: i64,
}

pub mod buckets {
    use super::RateLimitBucketSpec;

    pub const READ: RateLimitBucketSpec = RateLimitBucketSpec { name: "read", max: 100, window_secs: 60 };
    pub const CHECK: RateLimitBucketSpec = RateLimitBucketSpec { name: "check", max: 50, window_secs: 60 };
    pub const WRITE: RateLimitBucketSpec = RateLimitBucketSpec { name: "write", max: 20, window_secs: 60 };
    pub const ADMIN: RateLimitBucketSpec = RateLimitBucketSpec { name: "admin", max: 5, window_secs: 60 };
    pub const OTP_REQUEST: RateLimitBucketSpec = RateLimitBucketSpec { name: "otp-request", max: 3, window_secs: 3600 };
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RateWindow {
    requests: Vec<i64>,
}

pub struct RateLimiter {
    kv: Arc<dyn KvStore>,
}

impl RateLimiter {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        RateLimiter { kv }
    }

    /// Identifier resolution order: hashed `X-Service-Key` → `customerId`
    /// → `CF-Connecting-IP` → `"unknown"`.
    pub fn resolve_subject(
        service_key: Option<&str>,
        customer_id: Option<&str>,
        connecting_ip: Option<&str>,
    ) -> String {
        if let Some(key) = service_key {
            return hex::encode(sha256(key.as_bytes()));
        }
        if let Some(id) = customer_id {
            return id.to_string();
        }
        if let Some(ip) = connecting_ip {
            return ip.to_string();
        }
        "unknown".to_string()
    }

    /// Checks and records one hit against `bucket` for `subject`.
    /// `now - window <= ts` keeps a request "at the window boundary"
    /// counted, `now - window > ts` lets it expire (spec.md §8).
    pub async fn check(&self, bucket: &RateLimitBucketSpec, subject: &str) -> CoreResult<()> {
        let key = format!("rl:{}:{}", bucket.name, subject);
        let now = Utc::now().timestamp();
        let window_start = now - bucket.window_secs;

        let mut window: RateWindow = self.kv.get_json(&key).await.unwrap_or(RateWindow { requests: vec![] });
        window.requests.retain(|&ts| ts > window_start);

        if window.requests.len() as u32 >= bucket.max {
            let oldest = *window.requests.iter().min().unwrap_or(&now);
            let retry_after = (oldest + bucket.window_secs - now).max(1) as u64;
            return Err(CoreError::RateLimited { retry_after });
        }

        window.requests.push(now);
        self.kv
            .put_json(&key, &window, PutOptions::ttl((bucket.window_secs * 2) as u64))
            .await;
        Ok(())
    }

    pub async fn remaining(&self, bucket: &RateLimitBucketSpec, subject: &str) -> u32 {
        let key = format!("rl:{}:{}", bucket.name, subject);
        let now = Utc::now().timestamp();
        let window_start = now - bucket.window_secs;
        let window: RateWindow = self.kv.get_json(&key).await.unwrap_or(RateWindow { requests: vec![] });
        let used = window.requests.iter().filter(|&&ts| ts > window_start).count() as u32;
        bucket.max.saturating_sub(used)
    }
}

// ---------------------------------------------------------------------
// JWT
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub email: String,
    pub exp: i64,
    pub iat: i64,
    pub jti: String,
    pub csrf: String,
    #[serde(rename = "isSuperAdmin")]
    pub is_super_admin: bool,
}

// ---------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestOtpResponse {
    pub success: bool,
    pub expires_in: i64,
    pub remaining: u32,
    /// Only populated when `Config::may_echo_otp_in_response` holds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub otp: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyOtpResponse {
    pub token: String,
    pub customer_id: String,
    pub email: String,
    pub display_name: String,
    pub expires_at: chrono::DateTime<Utc>,
    /// Not serialized into the JSON body; the worker uses it to build
    /// the `Set-Cookie` header.
    #[serde(skip)]
    pub csrf: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    pub token: String,
    pub expires_at: chrono::DateTime<Utc>,
}

pub struct IdentityService {
    store: EntityStore,
    kv: Arc<dyn KvStore>,
    email_sender: Arc<dyn EmailSender>,
    rate_limiter: RateLimiter,
    config: Arc<Config>,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl IdentityService {
    pub fn new(kv: Arc<dyn KvStore>, email_sender: Arc<dyn EmailSender>, config: Arc<Config>) -> Self {
        let encoding_key = EncodingKey::from_secret(config.jwt_secret.as_bytes());
        let decoding_key = DecodingKey::from_secret(config.jwt_secret.as_bytes());
        IdentityService {
            store: EntityStore::new(kv.clone()),
            rate_limiter: RateLimiter::new(kv.clone()),
            kv,
            email_sender,
            config,
            encoding_key,
            decoding_key,
        }
    }

    fn validation(&self) -> Validation {
        let mut v = Validation::new(Algorithm::HS256);
        v.leeway = 0;
        v.validate_exp = true;
        v
    }

    fn is_super_admin_email(&self, email: &str) -> bool {
        self.config.super_admin_emails.iter().any(|e| e == email)
    }

    // -- request-otp -----------------------------------------------

    pub async fn request_otp(&self, raw_email: &str) -> CoreResult<RequestOtpResponse> {
        validate_email(raw_email.trim())?;
        let email = normalize_email(raw_email);
        validate_email(&email)?;
        let hash = email_hash(&email);

        self.rate_limiter.check(&buckets::OTP_REQUEST, &hash).await?;

        let code = generate_otp_code();
        let record = OtpRecord::new(code.clone(), hash.clone());
        self.store
            .put_entity(EMAIL_SERVICE, "otp", &hash, record)
            .await;

        let send_result = self
            .email_sender
            .send(EmailMessage {
                to: email.clone(),
                subject: "Your sign-in code".to_string(),
                html: format!("<p>Your code is <b>{code}</b>. It expires in 10 minutes.</p>"),
            })
            .await;

        if let Err(err) = send_result {
            // Do not leak vendor status; delete the half-issued record.
            self.store.delete_entity(EMAIL_SERVICE, "otp", &hash).await;
            warn!(email_hash = %hash, "otp email delivery failed, record rolled back");
            return Err(err);
        }

        let remaining = self.rate_limiter.remaining(&buckets::OTP_REQUEST, &hash).await;
        info!(email_hash = %hash, "otp issued");

        Ok(RequestOtpResponse {
            success: true,
            expires_in: OTP_TTL_SECS,
            remaining,
            otp: self.config.may_echo_otp_in_response().then(|| code),
        })
    }

    // -- verify-otp --------------------------------------------------

    pub async fn verify_otp(&self, raw_email: &str, otp: &str) -> CoreResult<VerifyOtpResponse> {
        validate_email(raw_email.trim())?;
        let email = normalize_email(raw_email);
        let hash = email_hash(&email);

        let mut record: OtpRecord = self
            .store
            .get_entity(EMAIL_SERVICE, "otp", &hash)
            .await
            .ok_or_else(|| CoreError::Validation("OtpNotFoundOrExpired".into()))?;

        if record.consumed || record.is_expired() {
            self.store.delete_entity(EMAIL_SERVICE, "otp", &hash).await;
            return Err(CoreError::Validation("OtpNotFoundOrExpired".into()));
        }

        if record.is_locked() {
            self.store.delete_entity(EMAIL_SERVICE, "otp", &hash).await;
            return Err(CoreError::RateLimited { retry_after: 0 });
        }

        if !ct_eq(otp.as_bytes(), record.code.as_bytes()) {
            record.attempts += 1;
            self.store.put_entity(EMAIL_SERVICE, "otp", &hash, record).await;
            return Err(CoreError::Validation("OtpInvalid".into()));
        }

        record.consumed = true;
        self.store.delete_entity(EMAIL_SERVICE, "otp", &hash).await;

        let customer = self.upsert_customer_on_login(&email, &hash).await;
        let is_super_admin = self.is_super_admin_email(&email);
        let session = Session::new(customer.customer_id.clone(), is_super_admin);
        self.store
            .put_entity("auth", "session", &session.jti, session.clone())
            .await;

        let token = self.sign_session(&customer, &session)?;

        Ok(VerifyOtpResponse {
            token,
            customer_id: customer.customer_id,
            email,
            display_name: customer.display_name,
            expires_at: session.expires_at,
            csrf: session.csrf,
        })
    }

    /// Write entity then index: a re-read in the same request must see
    /// both (spec.md §4.5).
    async fn upsert_customer_on_login(&self, email: &str, hash: &str) -> Customer {
        if let Some(customer_id) = self.store.index_get_single(CUSTOMER_SERVICE, "by-email", hash).await {
            if let Some(customer) = self
                .store
                .get_entity::<Customer>(CUSTOMER_SERVICE, "profile", &customer_id)
                .await
            {
                return customer;
            }
        }

        let customer_id = format!("cust_{}", hex::encode(crate::crypto::random_bytes(12)));
        let display_name = self.claim_unique_display_name(&customer_id).await;
        let now = Utc::now();
        let customer = Customer {
            customer_id: customer_id.clone(),
            email: email.to_string(),
            email_hash: hash.to_string(),
            display_name,
            display_name_history: vec![],
            created_at: now,
            updated_at: now,
            preferences: CustomerPreferences::default(),
            plan: None,
            tier: None,
            status: None,
            flairs: vec![],
        };
        self.store
            .put_entity(CUSTOMER_SERVICE, "profile", &customer_id, customer.clone())
            .await;
        self.store
            .index_set_single(CUSTOMER_SERVICE, "by-email", hash, &customer_id)
            .await;
        customer
    }

    /// Generates a display name and claims it in the `by-display-name`
    /// index, retrying on collision (spec.md §4.5 "generate a unique
    /// displayName"). Falls back to appending random hex once the
    /// word-list's combinations are exhausted, so this always
    /// terminates with a claimed name.
    async fn claim_unique_display_name(&self, customer_id: &str) -> String {
        for _ in 0..DISPLAY_NAME_GENERATION_ATTEMPTS {
            let candidate = generate_display_name();
            if self.try_claim_display_name(&candidate, customer_id).await {
                return candidate;
            }
        }
        loop {
            let candidate = format!("{}{}", generate_display_name(), hex::encode(crate::crypto::random_bytes(4)));
            if self.try_claim_display_name(&candidate, customer_id).await {
                return candidate;
            }
        }
    }

    /// Atomically-enough claims `name` in the `by-display-name` index:
    /// `true` iff no other customer already holds it.
    async fn try_claim_display_name(&self, name: &str, customer_id: &str) -> bool {
        let key = name.to_lowercase();
        if self
            .store
            .index_get_single(CUSTOMER_SERVICE, "by-display-name", &key)
            .await
            .is_some()
        {
            return false;
        }
        self.store
            .index_set_single(CUSTOMER_SERVICE, "by-display-name", &key, customer_id)
            .await;
        true
    }

    fn sign_session(&self, customer: &Customer, session: &Session) -> CoreResult<String> {
        let claims = Claims {
            sub: customer.customer_id.clone(),
            email: customer.email.clone(),
            exp: session.expires_at.timestamp(),
            iat: session.issued_at.timestamp(),
            jti: session.jti.clone(),
            csrf: session.csrf.clone(),
            is_super_admin: session.is_super_admin,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|_| CoreError::Crypto)
    }

    // -- token decode / session lookups ------------------------------

    pub fn decode_token(&self, token: &str) -> CoreResult<Claims> {
        decode::<Claims>(token, &self.decoding_key, &self.validation())
            .map(|data| data.claims)
            .map_err(|_| CoreError::Unauthorized)
    }

    async fn is_blacklisted(&self, jti: &str) -> bool {
        self.kv.get_text(&format!("auth:blacklist:{jti}")).await.is_some()
    }

    /// Full bearer-token validation: signature, expiry, and blacklist.
    pub async fn authenticate(&self, token: &str) -> CoreResult<Claims> {
        let claims = self.decode_token(token)?;
        if self.is_blacklisted(&claims.jti).await {
            return Err(CoreError::Unauthorized);
        }
        Ok(claims)
    }

    // -- refresh / logout / me ----------------------------------------

    pub async fn refresh(&self, token: &str) -> CoreResult<RefreshResponse> {
        let claims = self.authenticate(token).await?;
        let customer = self
            .store
            .get_entity::<Customer>(CUSTOMER_SERVICE, "profile", &claims.sub)
            .await
            .ok_or(CoreError::Unauthorized)?;

        let new_session = Session::new(customer.customer_id.clone(), claims.is_super_admin);
        self.store
            .put_entity("auth", "session", &new_session.jti, new_session.clone())
            .await;

        self.blacklist_jti(&claims.jti, claims.exp).await;
        self.store.delete_entity("auth", "session", &claims.jti).await;

        let token = self.sign_session(&customer, &new_session)?;
        Ok(RefreshResponse {
            token,
            expires_at: new_session.expires_at,
        })
    }

    /// Idempotent: a second logout on an already-blacklisted token is a
    /// no-op success (spec.md §8).
    pub async fn logout(&self, token: &str) -> CoreResult<()> {
        let claims = self.decode_token(token)?;
        self.blacklist_jti(&claims.jti, claims.exp).await;
        self.store.delete_entity("auth", "session", &claims.jti).await;
        Ok(())
    }

    async fn blacklist_jti(&self, jti: &str, exp: i64) {
        let remaining = (exp - Utc::now().timestamp()).max(0) as u64;
        self.kv
            .put_text(&format!("auth:blacklist:{jti}"), "1", PutOptions::ttl(remaining))
            .await;
    }

    pub async fn me(&self, token: &str) -> CoreResult<Customer> {
        let claims = self.authenticate(token).await?;
        self.store
            .get_entity(CUSTOMER_SERVICE, "profile", &claims.sub)
            .await
            .ok_or(CoreError::Unauthorized)
    }

    /// `/admin/*` gating: JWT `isSuperAdmin` claim, or a matching
    /// `X-Service-Key`.
    pub fn assert_super_admin(&self, claims: Option<&Claims>, service_key: Option<&str>) -> CoreResult<()> {
        if let Some(key) = service_key {
            if let Some(configured) = &self.config.service_api_key {
                if ct_eq(key.as_bytes(), configured.as_bytes()) {
                    return Ok(());
                }
            }
        }
        if claims.map(|c| c.is_super_admin).unwrap_or(false) {
            return Ok(());
        }
        Err(CoreError::Forbidden("SuperAdminRequired".into()))
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }
}
