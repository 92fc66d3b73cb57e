//! Webhook signature primitives.
//!
//! HMAC-SHA256 over the raw request body, lowercase hex output, and
//! constant-time comparison throughout — a tampered byte anywhere in body
//! or header must fail without an early return that leaks position.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::errors::SignatureError;

type HmacSha256 = Hmac<Sha256>;

/// Lowercase hex HMAC-SHA256 digest of `body` under `secret`.
pub fn hmac_sha256_hex(secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Verifies a hex-encoded HMAC-SHA256 signature in constant time.
pub fn verify_hmac_hex(secret: &str, body: &[u8], provided_hex: &str) -> Result<(), SignatureError> {
    let provided = hex::decode(provided_hex.trim()).map_err(|_| SignatureError::Malformed)?;

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    let expected = mac.finalize().into_bytes();

    if expected.ct_eq(provided.as_slice()).into() {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

/// Constant-time equality for plain shared-token headers (GitLab's
/// `X-Gitlab-Token`).
pub fn verify_token(secret: &str, provided: &str) -> Result<(), SignatureError> {
    if secret.as_bytes().ct_eq(provided.as_bytes()).into() {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_lowercase_hex() {
        let sig = hmac_sha256_hex("secret", b"payload");
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn verify_accepts_matching_signature() {
        let body = b"{\"zen\":\"ok\"}";
        let sig = hmac_sha256_hex("s3cret", body);
        assert!(verify_hmac_hex("s3cret", body, &sig).is_ok());
    }

    #[test]
    fn any_tampered_byte_rejects() {
        let body = b"{\"zen\":\"ok\"}".to_vec();
        let sig = hmac_sha256_hex("s3cret", &body);

        // Tampered body.
        let mut other = body.clone();
        other[3] ^= 0x01;
        assert!(verify_hmac_hex("s3cret", &other, &sig).is_err());

        // Tampered signature (each nibble position).
        let mut bad = sig.clone().into_bytes();
        bad[10] = if bad[10] == b'0' { b'1' } else { b'0' };
        let bad = String::from_utf8(bad).unwrap();
        assert!(verify_hmac_hex("s3cret", &body, &bad).is_err());

        // Wrong secret.
        assert!(verify_hmac_hex("other", &body, &sig).is_err());
    }

    #[test]
    fn malformed_hex_is_its_own_error() {
        let err = verify_hmac_hex("s", b"b", "not-hex!").unwrap_err();
        assert!(matches!(err, SignatureError::Malformed));
    }

    #[test]
    fn token_compare() {
        assert!(verify_token("tok", "tok").is_ok());
        assert!(verify_token("tok", "tok2").is_err());
        assert!(verify_token("tok", "").is_err());
    }
}
