//! Webhook signature validation.
//!
//! The provider signs each call with `hex(HMAC-SHA256(key, timestamp ‖ token))`.
//! Any failure collapses into a single opaque rejection so callers cannot tell
//! a missing field from a bad signature.

use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// The three authentication fields of a webhook call.
#[derive(Debug, Clone, Copy)]
pub struct SignedFields<'a> {
    pub token: Option<&'a str>,
    pub timestamp: Option<&'a str>,
    pub signature: Option<&'a str>,
}

/// Opaque signature rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejected;

/// Validates webhook signatures against the shared signing key.
pub struct SignatureValidator {
    signing_key: SecretString,
    max_age_secs: Option<u64>,
}

impl SignatureValidator {
    pub fn new(signing_key: SecretString) -> Self {
        Self {
            signing_key,
            max_age_secs: None,
        }
    }

    /// Also reject timestamps further than `secs` from now.
    pub fn with_max_age(mut self, secs: Option<u64>) -> Self {
        self.max_age_secs = secs;
        self
    }

    /// Check a call, using the current wall clock for the replay window.
    pub fn verify(&self, fields: SignedFields<'_>) -> Result<(), Rejected> {
        self.verify_at(fields, chrono::Utc::now().timestamp())
    }

    /// Check a call against an explicit `now` (unix seconds).
    pub fn verify_at(&self, fields: SignedFields<'_>, now: i64) -> Result<(), Rejected> {
        let (Some(token), Some(timestamp), Some(signature)) =
            (fields.token, fields.timestamp, fields.signature)
        else {
            debug!("Webhook call missing signature fields");
            return Err(Rejected);
        };
        if token.is_empty() || timestamp.is_empty() || signature.is_empty() {
            debug!("Webhook call has empty signature fields");
            return Err(Rejected);
        }

        let mut mac = HmacSha256::new_from_slice(self.signing_key.expose_secret().as_bytes())
            .map_err(|_| Rejected)?;
        mac.update(timestamp.as_bytes());
        mac.update(token.as_bytes());
        let computed = hex::encode(mac.finalize().into_bytes());

        if !bool::from(computed.as_bytes().ct_eq(signature.trim().as_bytes())) {
            debug!("Webhook signature mismatch");
            return Err(Rejected);
        }

        if let Some(max_age) = self.max_age_secs {
            let Ok(sent_at) = timestamp.parse::<i64>() else {
                debug!("Webhook timestamp is not numeric");
                return Err(Rejected);
            };
            if now.abs_diff(sent_at) > max_age {
                debug!(age = now.saturating_sub(sent_at), "Webhook timestamp outside replay window");
                return Err(Rejected);
            }
        }

        Ok(())
    }
}

/// Compute the signature the provider would send. Used by tests and tooling.
pub fn sign(signing_key: &str, timestamp: &str, token: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(signing_key.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(timestamp.as_bytes());
    mac.update(token.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}
