//! Slack request signature verification
//!
//! Both webhook endpoints verify the `v0` HMAC-SHA256 scheme before the
//! body is trusted. The comparison is constant-time and requests older
//! than the replay window are rejected.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Maximum clock skew / replay age in seconds
const REPLAY_WINDOW_SECS: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    MissingHeader,
    StaleTimestamp,
    Mismatch,
}

/// Verify `X-Slack-Signature` against the raw request body.
///
/// `now_epoch` is passed in so verification stays clock-testable.
pub fn verify(
    signing_secret: &str,
    timestamp_header: &str,
    signature_header: &str,
    body: &str,
    now_epoch: i64,
) -> Result<(), SignatureError> {
    let timestamp: i64 = timestamp_header
        .parse()
        .map_err(|_| SignatureError::MissingHeader)?;
    if (now_epoch - timestamp).abs() > REPLAY_WINDOW_SECS {
        return Err(SignatureError::StaleTimestamp);
    }

    let base = format!("v0:{timestamp}:{body}");
    let mut mac = HmacSha256::new_from_slice(signing_secret.as_bytes())
        .map_err(|_| SignatureError::Mismatch)?;
    mac.update(base.as_bytes());
    let expected = format!("v0={}", hex::encode(mac.finalize().into_bytes()));

    if expected
        .as_bytes()
        .ct_eq(signature_header.as_bytes())
        .into()
    {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "8f742231b10e8888abcd99yyyzzz85a5";

    fn sign(secret: &str, timestamp: i64, body: &str) -> String {
        let base = format!("v0:{timestamp}:{body}");
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(base.as_bytes());
        format!("v0={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn test_valid_signature_passes() {
        let body = "payload=%7B%22type%22%3A%22block_actions%22%7D";
        let ts = 1_700_000_000;
        let signature = sign(SECRET, ts, body);
        assert!(verify(SECRET, &ts.to_string(), &signature, body, ts + 10).is_ok());
    }

    #[test]
    fn test_tampered_body_fails() {
        let ts = 1_700_000_000;
        let signature = sign(SECRET, ts, "payload=a");
        assert_eq!(
            verify(SECRET, &ts.to_string(), &signature, "payload=b", ts),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_wrong_secret_fails() {
        let ts = 1_700_000_000;
        let signature = sign("other-secret", ts, "body");
        assert_eq!(
            verify(SECRET, &ts.to_string(), &signature, "body", ts),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let ts = 1_700_000_000;
        let signature = sign(SECRET, ts, "body");
        assert_eq!(
            verify(SECRET, &ts.to_string(), &signature, "body", ts + 301),
            Err(SignatureError::StaleTimestamp)
        );
    }

    #[test]
    fn test_unparseable_timestamp_rejected() {
        assert_eq!(
            verify(SECRET, "not-a-number", "v0=aa", "body", 0),
            Err(SignatureError::MissingHeader)
        );
    }
}
