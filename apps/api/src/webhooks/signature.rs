//! Webhook payload signing using HMAC-SHA256.
//!
//! Receivers verify the `X-Webhook-Signature` header (`sha256=<hex>`)
//! against the raw request body with their subscription secret, and validate
//! the embedded event timestamp against a tolerance window for replay
//! protection.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Capability interface for payload signing, decoupled from delivery so the
/// algorithm can be swapped without touching the transport code.
pub trait Signer: Send + Sync {
    /// Signature header value for `payload` under `secret`.
    fn sign(&self, payload: &[u8], secret: &str) -> String;
}

pub struct HmacSha256Signer;

impl Signer for HmacSha256Signer {
    fn sign(&self, payload: &[u8], secret: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
        mac.update(payload);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }
}

/// Verifies a `sha256=<hex>` signature header against the payload bytes.
/// Constant-time on the digest comparison. Receivers do the equivalent of
/// this on their side; it also documents the signing contract.
#[allow(dead_code)]
pub fn verify(payload: &[u8], secret: &str, header: &str) -> bool {
    let Some(hex_digest) = header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify_round_trip() {
        let signer = HmacSha256Signer;
        let payload = br#"{"event":"application.completed","id":"d-1"}"#;

        let header = signer.sign(payload, "topsecret");
        assert!(header.starts_with("sha256="));
        assert!(verify(payload, "topsecret", &header));
    }

    #[test]
    fn test_tampered_payload_fails_verification() {
        let signer = HmacSha256Signer;
        let header = signer.sign(b"original", "topsecret");

        assert!(!verify(b"tampered", "topsecret", &header));
        assert!(!verify(b"original", "wrong-secret", &header));
    }

    #[test]
    fn test_malformed_headers_are_rejected() {
        assert!(!verify(b"payload", "s", "sha1=abcd"));
        assert!(!verify(b"payload", "s", "not-a-signature"));
        assert!(!verify(b"payload", "s", "sha256=zzzz"));
    }

    #[test]
    fn test_signatures_are_deterministic_per_secret() {
        let signer = HmacSha256Signer;
        let a = signer.sign(b"payload", "secret-a");
        let b = signer.sign(b"payload", "secret-a");
        let c = signer.sign(b"payload", "secret-b");

        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
