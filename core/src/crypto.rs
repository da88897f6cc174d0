//! CryptoKit (C1) — pure, stateless primitive wrappers.
//!
//! Every primitive here returns a tagged [`CryptoError`]; callers one
//! layer up must not let the specific tag leak past a component
//! boundary (see `error::CoreError::from` which collapses all of these
//! into a single `DecryptionFailed`).

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

/// Fixed by the wire format — changing it is a breaking envelope change.
pub const PBKDF2_ITERATIONS: u32 = 100_000;
pub const AES_KEY_LEN: usize = 32;
pub const AES_IV_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("auth tag mismatch")]
    AuthTagMismatch,
    #[error("malformed input")]
    MalformedInput,
    #[error("invalid key length")]
    InvalidKeyLength,
}

/// CSPRNG bytes.
pub fn random_bytes(n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

pub fn sha256(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

type HmacSha256 = Hmac<Sha256>;

pub fn hmac_sha256(key: &[u8], msg: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(msg);
    mac.finalize().into_bytes().into()
}

/// `PBKDF2(password, salt, iters=100_000, SHA-256, outLen=32)`.
pub fn pbkdf2(password: &[u8], salt: &[u8], iters: u32, out_len: usize) -> Vec<u8> {
    let mut out = vec![0u8; out_len];
    pbkdf2_hmac::<Sha256>(password, salt, iters, &mut out);
    out
}

/// AES-256-GCM encrypt. `iv` must be 12 bytes. Returns `ciphertext || tag`.
pub fn aes_gcm_encrypt(
    key: &[u8],
    iv: &[u8],
    plaintext: &[u8],
    aad: Option<&[u8]>,
) -> Result<Vec<u8>, CryptoError> {
    if key.len() != AES_KEY_LEN || iv.len() != AES_IV_LEN {
        return Err(CryptoError::InvalidKeyLength);
    }
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Nonce::from_slice(iv);
    let payload = Payload {
        msg: plaintext,
        aad: aad.unwrap_or(&[]),
    };
    cipher
        .encrypt(nonce, payload)
        .map_err(|_| CryptoError::MalformedInput)
}

/// AES-256-GCM decrypt. Fails with `AuthTagMismatch` on tamper — this is
/// the *only* place that distinction is observable; callers at a
/// component boundary must fold it into `DecryptionFailed`.
pub fn aes_gcm_decrypt(
    key: &[u8],
    iv: &[u8],
    ciphertext_and_tag: &[u8],
    aad: Option<&[u8]>,
) -> Result<Vec<u8>, CryptoError> {
    if key.len() != AES_KEY_LEN || iv.len() != AES_IV_LEN {
        return Err(CryptoError::InvalidKeyLength);
    }
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Nonce::from_slice(iv);
    let payload = Payload {
        msg: ciphertext_and_tag,
        aad: aad.unwrap_or(&[]),
    };
    cipher
        .decrypt(nonce, payload)
        .map_err(|_| CryptoError::AuthTagMismatch)
}

/// Constant-time byte-slice comparison.
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

pub fn b64url_encode(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn b64url_decode(s: &str) -> Result<Vec<u8>, CryptoError> {
    URL_SAFE_NO_PAD
        .decode(s)
        .map_err(|_| CryptoError::MalformedInput)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn b64url_round_trips() {
        for sample in [&b""[..], b"a", b"hello world", &[0u8, 1, 2, 255, 254]] {
            let encoded = b64url_encode(sample);
            assert!(!encoded.contains('='), "must be unpadded");
            assert_eq!(b64url_decode(&encoded).unwrap(), sample);
        }
    }

    #[test]
    fn aes_gcm_round_trips() {
        let key = random_bytes(AES_KEY_LEN);
        let iv = random_bytes(AES_IV_LEN);
        let plaintext = b"the quick brown fox";
        let ct = aes_gcm_encrypt(&key, &iv, plaintext, None).unwrap();
        let pt = aes_gcm_decrypt(&key, &iv, &ct, None).unwrap();
        assert_eq!(pt, plaintext);
    }

    #[test]
    fn aes_gcm_detects_tamper() {
        let key = random_bytes(AES_KEY_LEN);
        let iv = random_bytes(AES_IV_LEN);
        let mut ct = aes_gcm_encrypt(&key, &iv, b"payload", None).unwrap();
        let last = ct.len() - 1;
        ct[last] ^= 0x01;
        assert!(matches!(
            aes_gcm_decrypt(&key, &iv, &ct, None),
            Err(CryptoError::AuthTagMismatch)
        ));
    }

    #[test]
    fn ct_eq_rejects_different_lengths_and_content() {
        assert!(ct_eq(b"abc", b"abc"));
        assert!(!ct_eq(b"abc", b"abd"));
        assert!(!ct_eq(b"abc", b"abcd"));
    }

    #[test]
    fn pbkdf2_is_deterministic_for_fixed_inputs() {
        let a = pbkdf2(b"token-string", b"0123456789abcdef", PBKDF2_ITERATIONS, 32);
        let b = pbkdf2(b"token-string", b"0123456789abcdef", PBKDF2_ITERATIONS, 32);
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }
}
