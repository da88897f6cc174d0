//! Binary file pipeline (spec.md §1 item 5, §6): client-side
//! compression + authenticated encryption, dispatched by sniffing the
//! first byte of an upload, with a legacy-format fallback on decode.
//!
//! Encoding reuses the same v5 envelope as [`crate::cipher`] — the
//! "binary-v5" `encryptionFormat` custom-metadata value simply means
//! "this R2 object's bytes are a v5 envelope, stream it back raw".

use crate::cipher::{decrypt_v5, encrypt_v5};
use crate::crypto::{aes_gcm_decrypt, aes_gcm_encrypt, random_bytes, sha256};
use crate::error::{CoreError, CoreResult};
use crate::models::{EncryptionFormat, StoredObject, StoredObjectMetadata};

const LEGACY_JSON_CONTENT_TYPE: &str = "application/json";

/// Byte-0 sniff used on upload: `5` → v5, `4` → legacy v4, otherwise the
/// upload is only accepted if its declared MIME indicates the older
/// legacy-JSON-encrypted pipeline.
pub fn sniff_upload_format(first_byte: Option<u8>, declared_content_type: &str) -> CoreResult<EncryptionFormat> {
    match first_byte {
        Some(5) => Ok(EncryptionFormat::BinaryV5),
        Some(4) => Ok(EncryptionFormat::BinaryV4),
        _ if declared_content_type.eq_ignore_ascii_case(LEGACY_JSON_CONTENT_TYPE) => Ok(EncryptionFormat::Legacy),
        _ => Err(CoreError::Validation("unrecognised binary upload format".into())),
    }
}

/// Encrypts `plaintext` for storage and returns the raw bytes to hand
/// to the storage layer plus the custom metadata recorded alongside it.
pub fn encode_for_storage(
    r2_key: &str,
    token: &str,
    customer_id: &str,
    original_content_type: &str,
    plaintext: &[u8],
) -> (Vec<u8>, StoredObject) {
    let envelope = encrypt_v5(token, plaintext);
    let metadata = StoredObjectMetadata {
        encryption_format: EncryptionFormat::BinaryV5,
        sha256: hex::encode(sha256(plaintext)),
        original_content_type: original_content_type.to_string(),
        customer_id: customer_id.to_string(),
    };
    (
        envelope,
        StoredObject {
            r2_key: r2_key.to_string(),
            custom_metadata: metadata,
        },
    )
}

/// Legacy v4 envelope: identical header shape to v5 but with no
/// compression flag — v4 payloads are always stored uncompressed.
pub fn encode_legacy_v4(token: &str, plaintext: &[u8]) -> Vec<u8> {
    let salt = random_bytes(16);
    let iv = random_bytes(12);
    let token_hash = sha256(token.as_bytes());
    let key = crate::crypto::pbkdf2(token.as_bytes(), &salt, crate::crypto::PBKDF2_ITERATIONS, 32);
    let ciphertext = aes_gcm_encrypt(&key, &iv, plaintext, None).expect("fixed-size key/iv");

    let mut envelope = Vec::with_capacity(4 + 16 + 12 + 32 + ciphertext.len());
    envelope.push(4u8);
    envelope.push(16u8);
    envelope.push(12u8);
    envelope.push(32u8);
    envelope.extend_from_slice(&salt);
    envelope.extend_from_slice(&iv);
    envelope.extend_from_slice(&token_hash);
    envelope.extend_from_slice(&ciphertext);
    envelope
}

fn decode_legacy_v4(token: &str, envelope: &[u8]) -> CoreResult<Vec<u8>> {
    if envelope.len() < 4 || envelope[0] != 4 {
        return Err(CoreError::DecryptionFailed);
    }
    let salt_len = envelope[1] as usize;
    let iv_len = envelope[2] as usize;
    let hash_len = envelope[3] as usize;
    let header_len = 4 + salt_len + iv_len + hash_len;
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
    let ciphertext = &envelope[cursor..];

    let expected = sha256(token.as_bytes());
    if !crate::crypto::ct_eq(token_hash, &expected) {
        return Err(CoreError::DecryptionFailed);
    }
    let key = crate::crypto::pbkdf2(token.as_bytes(), salt, crate::crypto::PBKDF2_ITERATIONS, 32);
    aes_gcm_decrypt(&key, iv, ciphertext, None).map_err(CoreError::from)
}

/// Decodes a downloaded object's raw bytes, selecting the pipeline from
/// its stored `encryptionFormat`. v4/v5 both return plaintext suitable
/// for streaming back as `application/octet-stream`. Legacy-JSON format
/// has no active decoder (spec.md §9 Open Question): rejected
/// explicitly rather than guessed at.
pub fn decode_for_download(format: EncryptionFormat, token: &str, bytes: &[u8]) -> CoreResult<Vec<u8>> {
    match format {
        EncryptionFormat::BinaryV5 => decrypt_v5(token, bytes),
        EncryptionFormat::BinaryV4 => decode_legacy_v4(token, bytes),
        EncryptionFormat::Legacy => Err(CoreError::Validation(
            "legacy-JSON encryption format has no active decoder".into(),
        )),
    }
}

/// Verifies a decoded plaintext's hash against what was recorded at
/// upload time, catching silent storage-layer corruption.
pub fn verify_plaintext_hash(metadata: &StoredObjectMetadata, plaintext: &[u8]) -> bool {
    hex::encode(sha256(plaintext)) == metadata.sha256
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniff_dispatches_on_first_byte() {
        assert_eq!(sniff_upload_format(Some(5), "application/octet-stream").unwrap(), EncryptionFormat::BinaryV5);
        assert_eq!(sniff_upload_format(Some(4), "application/octet-stream").unwrap(), EncryptionFormat::BinaryV4);
        assert_eq!(sniff_upload_format(Some(9), "application/json").unwrap(), EncryptionFormat::Legacy);
        assert!(sniff_upload_format(Some(9), "application/octet-stream").is_err());
        assert!(sniff_upload_format(None, "text/plain").is_err());
    }

    #[test]
    fn v5_storage_round_trips_and_hash_verifies() {
        let token = "tok";
        let plaintext = b"binary payload bytes";
        let (envelope, stored) = encode_for_storage("r2/key/1", token, "cust_1", "image/png", plaintext);
        let decoded = decode_for_download(stored.custom_metadata.encryption_format, token, &envelope).unwrap();
        assert_eq!(decoded, plaintext);
        assert!(verify_plaintext_hash(&stored.custom_metadata, &decoded));
    }

    #[test]
    fn v4_legacy_round_trips() {
        let token = "tok";
        let plaintext = b"old format payload";
        let envelope = encode_legacy_v4(token, plaintext);
        let decoded = decode_for_download(EncryptionFormat::BinaryV4, token, &envelope).unwrap();
        assert_eq!(decoded, plaintext);
    }

    #[test]
    fn legacy_json_format_is_rejected_explicitly() {
        let err = decode_for_download(EncryptionFormat::Legacy, "tok", b"{}").unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }
}
