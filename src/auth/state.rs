//! Login `state` parameter and PKCE verifier derivation.
//!
//! Signed state: `base64url(state_json).base64url(hmac_sha256(state_json))`.
//!
//! The callback recovers the audience and the referring identity from the
//! state alone. The PKCE verifier is never carried in the state: it is
//! re-derived from the state's nonce with the same secret, so the verifier
//! only ever travels to the token endpoint.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Duration, Utc};
use hmac::{KeyInit, Mac};
use rand::RngExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

type HmacSha256 = hmac::Hmac<Sha256>;

/// Failures decoding a callback `state`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    /// Not `payload.signature`, or not base64url/JSON
    #[error("Malformed state parameter")]
    Malformed,
    /// Signature does not match
    #[error("State signature verification failed")]
    BadSignature,
    /// Older than the allowed window
    #[error("Login attempt expired, please start again")]
    Expired,
}

/// Context carried through the provider round trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginState {
    /// Audience being logged in to
    pub audience: String,
    /// Random per-login value; seeds the PKCE verifier
    pub nonce: String,
    /// Subject of the user who started the login, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// Email of the user who started the login, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Where to send the browser after the callback
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
    /// Unix seconds
    pub issued_at: i64,
}

impl LoginState {
    /// New state with a fresh nonce.
    #[must_use]
    pub fn new(audience: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            audience: audience.into(),
            nonce: random_token(),
            subject: None,
            email: None,
            referrer: None,
            issued_at: now.timestamp(),
        }
    }
}

/// Signs and verifies [`LoginState`].
#[derive(Clone)]
pub struct StateSigner {
    mac: HmacSha256,
    ttl: Duration,
}

impl std::fmt::Debug for StateSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateSigner").field("ttl", &self.ttl).finish_non_exhaustive()
    }
}

impl StateSigner {
    /// Signer with an explicit secret.
    pub fn new(secret: impl AsRef<[u8]>, ttl: Duration) -> crate::Result<Self> {
        let mac = HmacSha256::new_from_slice(secret.as_ref())
            .map_err(|e| crate::Error::Config(format!("Invalid state secret: {e}")))?;
        Ok(Self { mac, ttl })
    }

    /// Signer with a random per-process secret. Logins must then complete on
    /// the instance that started them.
    pub fn ephemeral(ttl: Duration) -> crate::Result<Self> {
        let secret: [u8; 32] = rand::rng().random();
        Self::new(secret, ttl)
    }

    fn mac(&self) -> HmacSha256 {
        self.mac.clone()
    }

    /// Encode and sign.
    #[must_use]
    pub fn sign(&self, state: &LoginState) -> String {
        let json = serde_json::to_vec(state).unwrap_or_default();
        let mut mac = self.mac();
        mac.update(&json);
        let signature = mac.finalize().into_bytes();
        format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&json),
            URL_SAFE_NO_PAD.encode(signature)
        )
    }

    /// Verify signature and age, then decode.
    pub fn verify(&self, signed: &str, now: DateTime<Utc>) -> Result<LoginState, StateError> {
        let (payload, signature) = signed.split_once('.').ok_or(StateError::Malformed)?;
        let json = URL_SAFE_NO_PAD.decode(payload).map_err(|_| StateError::Malformed)?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| StateError::Malformed)?;

        let mut mac = self.mac();
        mac.update(&json);
        mac.verify_slice(&signature)
            .map_err(|_| StateError::BadSignature)?;

        let state: LoginState = serde_json::from_slice(&json).map_err(|_| StateError::Malformed)?;
        let issued = DateTime::from_timestamp(state.issued_at, 0).ok_or(StateError::Malformed)?;
        if now - issued > self.ttl {
            return Err(StateError::Expired);
        }
        Ok(state)
    }

    /// PKCE verifier for a login: `base64url(HMAC(secret, "pkce:" + nonce))`.
    #[must_use]
    pub fn pkce_verifier(&self, nonce: &str) -> String {
        let mut mac = self.mac();
        mac.update(b"pkce:");
        mac.update(nonce.as_bytes());
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }
}

/// S256 challenge for a PKCE verifier.
#[must_use]
pub fn pkce_challenge(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Random URL-safe value (16 bytes).
fn random_token() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(bytes)
}
