//! `X-Hub-Signature-256` verification.
//!
//! GitHub signs each delivery with `sha256=<hex(HMAC-SHA256(secret, body))>`.

use crate::config::WebhookSecret;
use hmac::{Hmac, Mac};
use sha2::Sha256;

const SIGNATURE_PREFIX: &str = "sha256=";

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// Header absent or not in `sha256=<hex>` form.
    #[error("missing or invalid signature")]
    Missing,
    #[error("signature mismatch")]
    Mismatch,
}

/// Checks webhook bodies against the shared secret.
#[derive(Debug, Clone)]
pub struct SignatureVerifier {
    secret: WebhookSecret,
}

impl SignatureVerifier {
    pub fn new(secret: WebhookSecret) -> Self {
        Self { secret }
    }

    /// Verify `header_value` (the raw `X-Hub-Signature-256` value) against `body`.
    pub fn verify(&self, body: &[u8], header_value: Option<&str>) -> Result<(), AuthError> {
        let provided = header_value
            .and_then(|v| v.strip_prefix(SIGNATURE_PREFIX))
            .ok_or(AuthError::Missing)?;

        let expected = compute_hmac(body, self.secret.as_bytes());
        if !constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
            return Err(AuthError::Mismatch);
        }
        Ok(())
    }

    /// Produce the header value GitHub would send for `body`.
    pub fn sign(&self, body: &[u8]) -> String {
        format!("{SIGNATURE_PREFIX}{}", compute_hmac(body, self.secret.as_bytes()))
    }
}

fn compute_hmac(body: &[u8], secret: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("HMAC accepts keys of any length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time byte comparison to prevent timing attacks.
///
/// Length is not secret: every valid signature is 64 hex characters.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter()
        .zip(b.iter())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}
