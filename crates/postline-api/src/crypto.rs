//! Webhook signature and timestamp verification.
//!
//! The provider signs `"{timestamp}.{raw_body}"` with HMAC-SHA256 and sends
//! the lowercase hex digest in the `signature` header next to the
//! `signature-timestamp` header. Verification runs on the raw bytes, before
//! any JSON parsing, and compares digests in constant time.

use std::time::Duration;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the hex HMAC digest.
pub const SIGNATURE_HEADER: &str = "signature";

/// Header carrying the signing time in unix seconds.
pub const TIMESTAMP_HEADER: &str = "signature-timestamp";

/// Accepted clock skew between the provider and this service.
pub const DEFAULT_TOLERANCE: Duration = Duration::from_secs(300);

const DIGEST_LEN: usize = 32;

/// Signature verification failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    /// The configured secret cannot key an HMAC.
    #[error("invalid signing secret")]
    InvalidSecret,
    /// The signature is not a hex-encoded SHA-256 digest.
    #[error("malformed signature")]
    Malformed,
    /// The digest does not match the body.
    #[error("signature mismatch")]
    Mismatch,
    /// The timestamp is not a unix seconds value.
    #[error("invalid signature timestamp")]
    InvalidTimestamp,
    /// The timestamp is too far from the local clock.
    #[error("signature timestamp is {age_secs}s away from local time")]
    Stale {
        /// Absolute distance from local time in seconds.
        age_secs: u64,
    },
}

/// Computes the hex signature the provider would send for `body`.
///
/// # Errors
///
/// Returns [`SignatureError::InvalidSecret`] if the secret is rejected by
/// the HMAC implementation.
pub fn sign(secret: &str, timestamp: &str, body: &[u8]) -> Result<String, SignatureError> {
    Ok(hex::encode(digest(secret, timestamp, body)?))
}

/// Verifies `signature` against `timestamp` and the raw `body`.
///
/// # Example
///
/// ```
/// use postline_api::crypto::{sign, verify_signature};
///
/// let body = br#"{"id":"evt_1"}"#;
/// let signature = sign("whsec", "1700000000", body).unwrap();
/// assert!(verify_signature("whsec", "1700000000", body, &signature).is_ok());
/// assert!(verify_signature("whsec", "1700000001", body, &signature).is_err());
/// ```
pub fn verify_signature(
    secret: &str,
    timestamp: &str,
    body: &[u8],
    signature: &str,
) -> Result<(), SignatureError> {
    let provided = hex::decode(signature.trim()).map_err(|_| SignatureError::Malformed)?;
    if provided.len() != DIGEST_LEN {
        return Err(SignatureError::Malformed);
    }

    let expected = digest(secret, timestamp, body)?;
    if bool::from(expected.as_slice().ct_eq(provided.as_slice())) {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

/// Checks that `timestamp` lies within `tolerance` of `now_unix`, in
/// either direction.
pub fn verify_timestamp(
    timestamp: &str,
    now_unix: i64,
    tolerance: Duration,
) -> Result<(), SignatureError> {
    let sent: i64 = timestamp.trim().parse().map_err(|_| SignatureError::InvalidTimestamp)?;
    let age_secs = now_unix.abs_diff(sent);
    if age_secs > tolerance.as_secs() {
        return Err(SignatureError::Stale { age_secs });
    }
    Ok(())
}

fn digest(secret: &str, timestamp: &str, body: &[u8]) -> Result<Vec<u8>, SignatureError> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::InvalidSecret)?;
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);
    Ok(mac.finalize().into_bytes().to_vec())
}
