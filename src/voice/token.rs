//! Signed, time-bound bridge tokens.
//!
//! The outbound bridge webhook must never connect a call without proof the
//! request originated here. The token is `<payload>.<signature>`: a
//! base64url-encoded JSON payload and an HMAC-SHA256 signature over it.
//! Verification recomputes the HMAC (constant-time compare) and rejects
//! expired or malformed tokens.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

/// Tokens older than this are rejected.
const TOKEN_TTL_MINUTES: i64 = 15;

/// What the bridge step needs to connect the call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeClaims {
    pub call_log_id: String,
    pub user_id: String,
    pub client_id: Option<String>,
    pub from_number: String,
    pub to_number: String,
    /// Unix seconds at signing time.
    pub issued_at: i64,
}

pub struct TokenSigner {
    secret: SecretString,
}

impl TokenSigner {
    pub fn new(secret: SecretString) -> Self {
        Self { secret }
    }

    fn mac(&self) -> Hmac<Sha256> {
        // An HMAC key accepts any length; this cannot fail.
        Hmac::<Sha256>::new_from_slice(self.secret.expose_secret().as_bytes())
            .expect("HMAC accepts any key length")
    }

    pub fn sign(&self, claims: &BridgeClaims) -> String {
        let json = serde_json::to_vec(claims).expect("claims serialize");
        let payload = URL_SAFE_NO_PAD.encode(json);
        let mut mac = self.mac();
        mac.update(payload.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        format!("{payload}.{signature}")
    }

    /// Verify a token against `now`. Any shape, signature, or expiry
    /// failure yields `None`; callers treat that as terminal.
    pub fn verify_at(&self, token: &str, now: DateTime<Utc>) -> Option<BridgeClaims> {
        let (payload, signature) = token.split_once('.')?;
        let signature_bytes = URL_SAFE_NO_PAD.decode(signature).ok()?;
        let mut mac = self.mac();
        mac.update(payload.as_bytes());
        mac.verify_slice(&signature_bytes).ok()?;

        let json = URL_SAFE_NO_PAD.decode(payload).ok()?;
        let claims: BridgeClaims = serde_json::from_slice(&json).ok()?;

        let issued = DateTime::<Utc>::from_timestamp(claims.issued_at, 0)?;
        if now - issued > Duration::minutes(TOKEN_TTL_MINUTES) {
            return None;
        }
        Some(claims)
    }

    pub fn verify(&self, token: &str) -> Option<BridgeClaims> {
        self.verify_at(token, Utc::now())
    }
}
