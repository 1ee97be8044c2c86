//! Webhook payload authentication.
//!
//! GitHub signs each delivery with HMAC-SHA256 over the raw request body and
//! sends the result as `X-Hub-Signature-256: sha256=<hex>`.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

const SIGNATURE_PREFIX: &str = "sha256=";

/// Hex length of a SHA-256 digest.
const DIGEST_HEX_LEN: usize = 64;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    #[error("missing signature header")]
    MissingSignature,

    #[error("signature header is not of the form sha256=<hex>")]
    BadFormat,

    #[error("signature has the wrong length")]
    LengthMismatch,

    #[error("signature does not match payload")]
    Mismatch,
}

/// Verify `signature_header` against `raw_body` signed with `secret`.
///
/// Pure function of its inputs. The digest comparison is constant-time; the
/// length check happens first because the comparison needs equal lengths.
pub fn verify(
    raw_body: &[u8],
    signature_header: Option<&str>,
    secret: &str,
) -> Result<(), SignatureError> {
    let header = signature_header.ok_or(SignatureError::MissingSignature)?;

    let signature_hex = header
        .trim()
        .strip_prefix(SIGNATURE_PREFIX)
        .ok_or(SignatureError::BadFormat)?;

    if signature_hex.len() != DIGEST_HEX_LEN {
        return Err(SignatureError::LengthMismatch);
    }

    let signature_bytes = hex::decode(signature_hex).map_err(|_| SignatureError::BadFormat)?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| SignatureError::Mismatch)?;
    mac.update(raw_body);

    // verify_slice compares in constant time
    mac.verify_slice(&signature_bytes)
        .map_err(|_| SignatureError::Mismatch)
}

/// Produce the header value GitHub would send for `raw_body`.
pub fn compute_signature(raw_body: &[u8], secret: &str) -> String {
    // HMAC accepts keys of any length, so this cannot fail
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(raw_body);
    format!(
        "{}{}",
        SIGNATURE_PREFIX,
        hex::encode(mac.finalize().into_bytes())
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const BODY: &[u8] = br#"{"action":"submitted"}"#;

    #[test]
    fn test_valid_signature() {
        let header = compute_signature(BODY, "topsecret");
        assert_eq!(verify(BODY, Some(&header), "topsecret"), Ok(()));
    }

    #[test]
    fn test_known_vector() {
        // From GitHub's webhook validation documentation
        let header = "sha256=757107ea0eb2509fc211221cce984b8a37570b6d7586c22c46f4379c8b043e17";
        assert_eq!(
            verify(b"Hello, World!", Some(header), "It's a Secret to Everybody"),
            Ok(())
        );
    }

    #[test]
    fn test_wrong_secret() {
        let header = compute_signature(BODY, "topsecret");
        assert_eq!(
            verify(BODY, Some(&header), "othersecret"),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_missing_header() {
        assert_eq!(
            verify(BODY, None, "topsecret"),
            Err(SignatureError::MissingSignature)
        );
    }

    #[test]
    fn test_wrong_algorithm_prefix() {
        let header = compute_signature(BODY, "topsecret").replace("sha256=", "sha1=");
        assert_eq!(
            verify(BODY, Some(&header), "topsecret"),
            Err(SignatureError::BadFormat)
        );
    }

    #[test]
    fn test_truncated_signature() {
        let header = compute_signature(BODY, "topsecret");
        let truncated = &header[..header.len() - 2];
        assert_eq!(
            verify(BODY, Some(truncated), "topsecret"),
            Err(SignatureError::LengthMismatch)
        );
    }

    #[test]
    fn test_non_hex_signature() {
        let header = format!("sha256={}", "zz".repeat(32));
        assert_eq!(
            verify(BODY, Some(&header), "topsecret"),
            Err(SignatureError::BadFormat)
        );
    }

    fn flip_bit(bytes: &mut [u8], index: usize, bit: u8) {
        let i = index % bytes.len();
        bytes[i] ^= 1 << bit;
    }

    proptest! {
        #[test]
        fn prop_correct_secret_verifies(
            body in proptest::collection::vec(any::<u8>(), 0..512),
            secret in "[a-zA-Z0-9]{1,40}",
        ) {
            let header = compute_signature(&body, &secret);
            prop_assert_eq!(verify(&body, Some(&header), &secret), Ok(()));
        }

        #[test]
        fn prop_payload_bit_flip_fails(
            body in proptest::collection::vec(any::<u8>(), 1..512),
            secret in "[a-zA-Z0-9]{1,40}",
            index in any::<usize>(),
            bit in 0u8..8,
        ) {
            let header = compute_signature(&body, &secret);
            let mut mutated = body.clone();
            flip_bit(&mut mutated, index, bit);
            prop_assert_eq!(
                verify(&mutated, Some(&header), &secret),
                Err(SignatureError::Mismatch)
            );
        }

        #[test]
        fn prop_secret_bit_flip_fails(
            body in proptest::collection::vec(any::<u8>(), 0..512),
            secret in "[a-zA-Z0-9]{1,40}",
            index in any::<usize>(),
            // Low seven bits keep the secret ASCII
            bit in 0u8..7,
        ) {
            let header = compute_signature(&body, &secret);
            let mut mutated = secret.clone().into_bytes();
            flip_bit(&mut mutated, index, bit);
            let mutated = String::from_utf8(mutated).unwrap();
            prop_assert_eq!(
                verify(&body, Some(&header), &mutated),
                Err(SignatureError::Mismatch)
            );
        }
    }
}
