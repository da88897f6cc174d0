//! ResponseCipher (part of C6) — the response-encryption envelope
//! (v5 default, two-stage variant for custodial re-disclosure) and the
//! include/exclude/tag response filter.
//!
//! Mixed-shape "maybe encrypted" bodies are modelled as the tagged
//! [`ResponseBody`] variant rather than a runtime-sniffed header, per
//! the redesign note in spec.md §9.

use std::collections::HashSet;
use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value;

use crate::crypto::{aes_gcm_decrypt, aes_gcm_encrypt, ct_eq, pbkdf2, random_bytes, sha256, PBKDF2_ITERATIONS};
use crate::error::{CoreError, CoreResult};

pub const ENVELOPE_VERSION_V5: u8 = 5;
pub const ENVELOPE_VERSION_V4: u8 = 4;
pub const ENVELOPE_VERSION_TWO_STAGE: u8 = 0xF5;

const SALT_LEN: usize = 16;
const IV_LEN: usize = 12;
const HASH_LEN: usize = 32;

/// A response is either a plain (unencrypted) body or a v5/two-stage
/// envelope — never a single struct discriminated by a boolean flag.
pub enum ResponseBody {
    Plain(Vec<u8>),
    Encrypted(Vec<u8>),
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).expect("writing to an in-memory buffer cannot fail");
    encoder.finish().expect("finishing an in-memory gzip stream cannot fail")
}

fn gunzip(data: &[u8]) -> CoreResult<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).map_err(|_| CoreError::DecryptionFailed)?;
    Ok(out)
}

fn derive_key(token: &str, salt: &[u8]) -> Vec<u8> {
    pbkdf2(token.as_bytes(), salt, PBKDF2_ITERATIONS, 32)
}

/// Encrypts `plaintext` with a key derived from `token`
/// (`PBKDF2(token, salt, 100_000, SHA-256, 32B)`), compressing first
/// when it would shrink the payload by more than 5%.
pub fn encrypt_v5(token: &str, plaintext: &[u8]) -> Vec<u8> {
    let salt = random_bytes(SALT_LEN);
    let iv = random_bytes(IV_LEN);
    let token_hash = sha256(token.as_bytes());

    let compressed = gzip(plaintext);
    let (body, flag) = if (compressed.len() as f64) < (plaintext.len() as f64) * 0.95 {
        (compressed, 1u8)
    } else {
        (plaintext.to_vec(), 0u8)
    };

    let key = derive_key(token, &salt);
    let ciphertext = aes_gcm_encrypt(&key, &iv, &body, None).expect("key/iv lengths are fixed and valid");

    let mut envelope = Vec::with_capacity(4 + SALT_LEN + IV_LEN + HASH_LEN + 1 + ciphertext.len());
    envelope.push(ENVELOPE_VERSION_V5);
    envelope.push(SALT_LEN as u8);
    envelope.push(IV_LEN as u8);
    envelope.push(HASH_LEN as u8);
    envelope.extend_from_slice(&salt);
    envelope.extend_from_slice(&iv);
    envelope.extend_from_slice(&token_hash);
    envelope.push(flag);
    envelope.extend_from_slice(&ciphertext);
    envelope
}

/// Decrypts a v5 envelope. Rejects any version other than 5 (including
/// the explicitly-unsupported legacy v3) before attempting PBKDF2, and
/// verifies the embedded token hash in constant time before deriving a
/// key — every failure mode collapses to `DecryptionFailed` (spec.md §7).
pub fn decrypt_v5(token: &str, envelope: &[u8]) -> CoreResult<Vec<u8>> {
    if envelope.len() < 4 {
        return Err(CoreError::DecryptionFailed);
    }
    let version = envelope[0];
    if version == 3 {
        return Err(CoreError::DecryptionFailed);
    }
    if version != ENVELOPE_VERSION_V5 {
        return Err(CoreError::DecryptionFailed);
    }
    let salt_len = envelope[1] as usize;
    let iv_len = envelope[2] as usize;
    let hash_len = envelope[3] as usize;

    let header_len = 4 + salt_len + iv_len + hash_len + 1;
    if envelope.len() < header_len {
        return Err(CoreError::DecryptionFailed);
    }

    let mut cursor = 4;
    let salt = &envelope[cursor..cursor + salt_len];
    cursor += salt_len;
    let iv = &envelope[cursor..cursor + iv_len];
    cursor += iv_len;
    let token_hash = &envelope[cursor..cursor + hash_len];
    cursor += hash_len;
    let flag = envelope[cursor];
    cursor += 1;
    let ciphertext = &envelope[cursor..];

    let expected_hash = sha256(token.as_bytes());
    if !ct_eq(token_hash, &expected_hash) {
        return Err(CoreError::DecryptionFailed);
    }

    let key = derive_key(token, salt);
    let body = aes_gcm_decrypt(&key, iv, ciphertext, None)?;

    if flag == 1 {
        gunzip(&body)
    } else {
        Ok(body)
    }
}

pub fn encrypt_v5_json(token: &str, value: &Value) -> Vec<u8> {
    encrypt_v5(token, &serde_json::to_vec(value).expect("Value always serializes"))
}

pub fn decrypt_v5_json(token: &str, envelope: &[u8]) -> CoreResult<Value> {
    let bytes = decrypt_v5(token, envelope)?;
    serde_json::from_slice(&bytes).map_err(|_| CoreError::DecryptionFailed)
}

// ---------------------------------------------------------------------
// Two-stage encryption — nested AES-GCM for custodial re-disclosure of
// private fields via an approved `DataRequest` (spec.md §4.6, Open
// Question #2: wired only into that flow, not general responses).
// ---------------------------------------------------------------------

/// Stage-1 key comes from the data owner's token; stage-2 from a
/// per-request grant (`DataRequest.request_key`). Decryption requires
/// both, and the owner's token must be supplied out-of-band.
pub fn encrypt_two_stage(owner_token: &str, request_key: &[u8], plaintext: &[u8]) -> Vec<u8> {
    let stage1_salt = random_bytes(SALT_LEN);
    let stage1_iv = random_bytes(IV_LEN);
    let stage1_hash = sha256(owner_token.as_bytes());
    let stage1_key = derive_key(owner_token, &stage1_salt);
    let stage1_ct = aes_gcm_encrypt(&stage1_key, &stage1_iv, plaintext, None)
        .expect("key/iv lengths are fixed and valid");

    let stage2_salt = random_bytes(SALT_LEN);
    let stage2_iv = random_bytes(IV_LEN);
    let stage2_hash = sha256(request_key);
    let stage2_key = pbkdf2(request_key, &stage2_salt, PBKDF2_ITERATIONS, 32);
    let stage2_ct = aes_gcm_encrypt(&stage2_key, &stage2_iv, &stage1_ct, None)
        .expect("key/iv lengths are fixed and valid");

    let mut envelope = Vec::new();
    envelope.push(ENVELOPE_VERSION_TWO_STAGE);
    for part in [&stage1_salt, &stage1_iv, &stage1_hash[..].to_vec(), &stage2_salt, &stage2_iv, &stage2_hash[..].to_vec()] {
        envelope.push(part.len() as u8);
    }
    envelope.extend_from_slice(&stage1_salt);
    envelope.extend_from_slice(&stage1_iv);
    envelope.extend_from_slice(&stage1_hash);
    envelope.extend_from_slice(&stage2_salt);
    envelope.extend_from_slice(&stage2_iv);
    envelope.extend_from_slice(&stage2_hash);
    envelope.extend_from_slice(&stage2_ct);
    envelope
}

pub fn decrypt_two_stage(owner_token: &str, request_key: &[u8], envelope: &[u8]) -> CoreResult<Vec<u8>> {
    if envelope.first() != Some(&ENVELOPE_VERSION_TWO_STAGE) {
        return Err(CoreError::DecryptionFailed);
    }
    if envelope.len() < 7 {
        return Err(CoreError::DecryptionFailed);
    }
    let lens: Vec<usize> = envelope[1..7].iter().map(|&b| b as usize).collect();
    let [s1_salt_len, s1_iv_len, s1_hash_len, s2_salt_len, s2_iv_len, s2_hash_len] = lens[..] else {
        return Err(CoreError::DecryptionFailed);
    };

    let mut cursor = 7;
    let take = |cursor: &mut usize, len: usize, env: &[u8]| -> CoreResult<Vec<u8>> {
        if env.len() < *cursor + len {
            return Err(CoreError::DecryptionFailed);
        }
        let slice = env[*cursor..*cursor + len].to_vec();
        *cursor += len;
        Ok(slice)
    };

    let stage1_salt = take(&mut cursor, s1_salt_len, envelope)?;
    let stage1_iv = take(&mut cursor, s1_iv_len, envelope)?;
    let stage1_hash = take(&mut cursor, s1_hash_len, envelope)?;
    let stage2_salt = take(&mut cursor, s2_salt_len, envelope)?;
    let stage2_iv = take(&mut cursor, s2_iv_len, envelope)?;
    let stage2_hash = take(&mut cursor, s2_hash_len, envelope)?;
    let stage2_ct = &envelope[cursor..];

    if !ct_eq(&stage2_hash, &sha256(request_key)) {
        return Err(CoreError::DecryptionFailed);
    }
    let stage2_key = pbkdf2(request_key, &stage2_salt, PBKDF2_ITERATIONS, 32);
    let stage1_ct = aes_gcm_decrypt(&stage2_key, &stage2_iv, stage2_ct, None)?;

    if !ct_eq(&stage1_hash, &sha256(owner_token.as_bytes())) {
        return Err(CoreError::DecryptionFailed);
    }
    let stage1_key = derive_key(owner_token, &stage1_salt);
    aes_gcm_decrypt(&stage1_key, &stage1_iv, &stage1_ct, None).map_err(CoreError::from)
}

// ---------------------------------------------------------------------
// Response field filtering
// ---------------------------------------------------------------------

/// Root fields that survive every filter regardless of include/exclude.
pub const ALWAYS_PRESENT_FIELDS: &[&str] = &["id", "customerId"];

#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: &'static str,
    pub required: bool,
    pub tags: &'static [&'static str],
}

#[derive(Debug, Clone, Default)]
pub struct ResponseFilter {
    pub include: Option<HashSet<String>>,
    pub exclude: HashSet<String>,
    pub tags: HashSet<String>,
}

impl ResponseFilter {
    pub fn from_query(include: &str, exclude: &str, tags: &str) -> Self {
        let split = |s: &str| -> HashSet<String> {
            s.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        };
        let include_set = split(include);
        ResponseFilter {
            include: (!include_set.is_empty()).then_some(include_set),
            exclude: split(exclude),
            tags: split(tags),
        }
    }
}

/// Applies include/exclude/tag filtering to a JSON object, preserving
/// key order and structure. Non-object values pass through untouched.
pub fn apply_response_filter(value: Value, specs: &[FieldSpec], filter: &ResponseFilter) -> Value {
    let Value::Object(map) = value else {
        return value;
    };

    let mut out = serde_json::Map::new();
    for (key, val) in map {
        if ALWAYS_PRESENT_FIELDS.contains(&key.as_str()) {
            out.insert(key, val);
            continue;
        }
        if filter.exclude.contains(&key) {
            continue;
        }

        let spec = specs.iter().find(|s| s.name == key);
        let keep = if let Some(include) = &filter.include {
            include.contains(&key)
        } else if let Some(spec) = spec {
            spec.required || spec.tags.iter().any(|t| filter.tags.contains(*t))
        } else {
            // Unknown fields with no declared spec default to visible
            // unless an include allow-list was given.
            true
        };

        if keep {
            out.insert(key, val);
        }
    }
    Value::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn v5_envelope_round_trips() {
        let token = "eyJhbGciOi.payload.sig";
        let plaintext = br#"{"customerId":"cust_1","displayName":"CoolPanda42"}"#;
        let envelope = encrypt_v5(token, plaintext);
        assert_eq!(envelope[0], ENVELOPE_VERSION_V5);
        let decrypted = decrypt_v5(token, &envelope).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn wrong_token_fails_with_decryption_failed() {
        let envelope = encrypt_v5("token-a", b"{}");
        let err = decrypt_v5("token-b", &envelope).unwrap_err();
        assert!(matches!(err, CoreError::DecryptionFailed));
    }

    #[test]
    fn large_compressible_payload_sets_flag() {
        let token = "tok";
        let plaintext = "x".repeat(4096);
        let envelope = encrypt_v5(token, plaintext.as_bytes());
        // flag byte sits right before ciphertext at offset header_len-1
        let flag = envelope[4 + SALT_LEN + IV_LEN + HASH_LEN];
        assert_eq!(flag, 1);
        assert_eq!(decrypt_v5(token, &envelope).unwrap(), plaintext.as_bytes());
    }

    #[test]
    fn rejects_unknown_and_legacy_v3_version_without_pbkdf2() {
        let mut envelope = encrypt_v5("tok", b"{}");
        envelope[0] = 3;
        assert!(matches!(decrypt_v5("tok", &envelope), Err(CoreError::DecryptionFailed)));
        envelope[0] = 9;
        assert!(matches!(decrypt_v5("tok", &envelope), Err(CoreError::DecryptionFailed)));
    }

    #[test]
    fn two_stage_round_trips_with_both_keys() {
        let owner_token = "owner-token";
        let request_key = b"per-request-grant-key";
        let plaintext = b"alice@example.com";
        let envelope = encrypt_two_stage(owner_token, request_key, plaintext);
        let decrypted = decrypt_two_stage(owner_token, request_key, &envelope).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn two_stage_fails_without_owner_token() {
        let request_key = b"grant";
        let envelope = encrypt_two_stage("owner", request_key, b"secret");
        assert!(decrypt_two_stage("not-owner", request_key, &envelope).is_err());
        assert!(decrypt_two_stage("owner", b"wrong-grant", &envelope).is_err());
    }

    #[test]
    fn filter_always_keeps_root_fields() {
        let value = json!({"id": "1", "customerId": "c1", "email": "a@b.com"});
        let filter = ResponseFilter {
            include: None,
            exclude: ["id".to_string(), "customerId".to_string()].into_iter().collect(),
            tags: Default::default(),
        };
        let specs = [FieldSpec { name: "email", required: false, tags: &["summary"] }];
        let filtered = apply_response_filter(value, &specs, &filter);
        assert_eq!(filtered["id"], "1");
        assert_eq!(filtered["customerId"], "c1");
        assert!(filtered.get("email").is_none());
    }

    #[test]
    fn filter_honours_include_allowlist() {
        let value = json!({"id": "1", "email": "a@b.com", "displayName": "X"});
        let filter = ResponseFilter::from_query("displayName", "", "");
        let specs = [
            FieldSpec { name: "email", required: true, tags: &[] },
            FieldSpec { name: "displayName", required: false, tags: &[] },
        ];
        let filtered = apply_response_filter(value, &specs, &filter);
        assert!(filtered.get("email").is_none());
        assert_eq!(filtered["displayName"], "X");
    }
}
