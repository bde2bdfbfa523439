//! Bearer token verification against an issuer's JWKS.
//!
//! # Verification flow
//!
//! 1. Tokens that are not compact JWTs are opaque and skip verification.
//! 2. Decode the header (no verification) to extract `kid` and `alg`.
//! 3. Resolve the signing keys: OIDC discovery yields `jwks_uri` and `issuer`
//!    when no JWKS URI is configured. The key set is cached for one hour and
//!    refreshed on an unknown `kid`, at most once per 30 seconds.
//! 4. Verify the signature and `iss`; check `exp` against the injected clock
//!    with a 60 second leeway.
//!
//! Every verification failure surfaces as [`AuthorizationNeeded`], never as a
//! raw `jsonwebtoken` error.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{
    DecodingKey, Header, Validation,
    errors::ErrorKind,
    jwk::{Jwk, JwkSet},
};
use parking_lot::{Mutex, RwLock};
use reqwest::Client;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::clock::SharedClock;
use super::error::AuthorizationNeeded;
use super::metadata::{FetchError, ProviderMetadata, fetch_json};
use super::token::{Audience, decode_claims_unverified, looks_like_jwt};

/// Default JWKS cache lifetime.
pub const DEFAULT_JWKS_TTL: Duration = Duration::hours(1);

/// Default clock skew tolerance in seconds.
pub const DEFAULT_LEEWAY_SECS: i64 = 60;

/// Minimum gap between JWKS refetches triggered by an unknown `kid`.
pub const UNKNOWN_KID_REFETCH_COOLDOWN: Duration = Duration::seconds(30);

/// Failures resolving signing keys.
#[derive(Debug, thiserror::Error)]
pub enum JwksError {
    /// Discovery or JWKS endpoint unreachable or answered non-2xx
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Neither a JWKS URI nor a well-known URI is configured
    #[error("No JWKS URI or well-known URI configured")]
    NotConfigured,

    /// The discovery document has no `jwks_uri`
    #[error("Discovery document at {0} has no jwks_uri")]
    MissingJwksUri(String),

    /// No key in the set matches the token's `kid`
    #[error("Unknown key ID: {0}")]
    UnknownKeyId(String),
}

struct CachedJwks {
    keys: JwkSet,
    fetched_at: DateTime<Utc>,
}

/// JWKS cache owned by one [`TokenReader`].
pub struct JwksCache {
    inner: RwLock<Option<CachedJwks>>,
    ttl: Duration,
}

impl JwksCache {
    /// Empty cache with the given TTL.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: RwLock::new(None),
            ttl,
        }
    }

    /// Cached keys if fetched within the TTL.
    #[must_use]
    pub fn fresh(&self, now: DateTime<Utc>) -> Option<JwkSet> {
        let guard = self.inner.read();
        let cached = guard.as_ref()?;
        (now - cached.fetched_at < self.ttl).then(|| cached.keys.clone())
    }

    fn store(&self, keys: JwkSet, now: DateTime<Utc>) {
        *self.inner.write() = Some(CachedJwks {
            keys,
            fetched_at: now,
        });
    }

    /// Drop the cached key set.
    pub fn invalidate(&self) {
        *self.inner.write() = None;
    }
}

#[derive(Clone, Default)]
struct Endpoints {
    jwks_uri: Option<String>,
    issuer: Option<String>,
}

/// Decodes and verifies bearer tokens for one issuer.
pub struct TokenReader {
    http: Client,
    clock: SharedClock,
    well_known_uri: Option<String>,
    endpoints: RwLock<Endpoints>,
    cache: JwksCache,
    leeway: i64,
    last_forced_fetch: Mutex<Option<DateTime<Utc>>>,
}

impl TokenReader {
    /// Reader that discovers its JWKS URI and issuer from `well_known_uri`.
    #[must_use]
    pub fn new(http: Client, clock: SharedClock, well_known_uri: Option<String>) -> Self {
        Self {
            http,
            clock,
            well_known_uri,
            endpoints: RwLock::new(Endpoints::default()),
            cache: JwksCache::new(DEFAULT_JWKS_TTL),
            leeway: DEFAULT_LEEWAY_SECS,
            last_forced_fetch: Mutex::new(None),
        }
    }

    /// Use an explicit JWKS URI instead of discovery.
    #[must_use]
    pub fn with_jwks_uri(self, jwks_uri: impl Into<String>) -> Self {
        self.endpoints.write().jwks_uri = Some(jwks_uri.into());
        self
    }

    /// Require this `iss` on verified tokens.
    #[must_use]
    pub fn with_issuer(self, issuer: impl Into<String>) -> Self {
        self.endpoints.write().issuer = Some(issuer.into());
        self
    }

    /// Override the JWKS cache TTL.
    #[must_use]
    pub fn with_jwks_ttl(mut self, ttl: Duration) -> Self {
        self.cache = JwksCache::new(ttl);
        self
    }

    /// Override the expiry leeway.
    #[must_use]
    pub fn with_leeway(mut self, secs: i64) -> Self {
        self.leeway = secs;
        self
    }

    /// Issuer learned from discovery or configured explicitly.
    #[must_use]
    pub fn issuer(&self) -> Option<String> {
        self.endpoints.read().issuer.clone()
    }

    /// Parse `Bearer <token>`. `None` for a missing or empty header, a
    /// non-Bearer scheme, or an empty token.
    #[must_use]
    pub fn extract_token(authorization: Option<&str>) -> Option<&str> {
        let header = authorization?.trim();
        let (scheme, token) = header.split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }
        let token = token.trim();
        (!token.is_empty()).then_some(token)
    }

    async fn resolve_jwks_uri(&self) -> Result<String, JwksError> {
        let configured = self.endpoints.read().jwks_uri.clone();
        if let Some(uri) = configured {
            return Ok(uri);
        }

        let well_known = self.well_known_uri.as_deref().ok_or(JwksError::NotConfigured)?;
        let metadata = ProviderMetadata::discover(&self.http, well_known).await?;
        let jwks_uri = metadata
            .jwks_uri
            .ok_or_else(|| JwksError::MissingJwksUri(well_known.to_string()))?;

        let mut endpoints = self.endpoints.write();
        endpoints.jwks_uri = Some(jwks_uri.clone());
        if endpoints.issuer.is_none() {
            endpoints.issuer = Some(metadata.issuer);
        }
        Ok(jwks_uri)
    }

    /// Fetch the key set unconditionally and cache it.
    pub async fn fetch_jwks(&self) -> Result<JwkSet, JwksError> {
        let jwks_uri = self.resolve_jwks_uri().await?;
        debug!(url = %jwks_uri, "Fetching JWKS");
        let keys: JwkSet = fetch_json(&self.http, &jwks_uri).await?;
        self.cache.store(keys.clone(), self.clock.now());
        Ok(keys)
    }

    /// Cached key set, fetched when absent or older than the TTL.
    pub async fn refresh_if_stale(&self) -> Result<JwkSet, JwksError> {
        if let Some(keys) = self.cache.fresh(self.clock.now()) {
            return Ok(keys);
        }
        self.fetch_jwks().await
    }

    /// Claim the unknown-`kid` refetch slot if the cooldown has passed.
    fn try_begin_forced_fetch(&self) -> bool {
        let now = self.clock.now();
        let mut last = self.last_forced_fetch.lock();
        if last.is_some_and(|at| now - at < UNKNOWN_KID_REFETCH_COOLDOWN) {
            return false;
        }
        *last = Some(now);
        true
    }

    /// Find a decoding key by `kid`, refreshing the key set if not found and
    /// no forced refresh ran within the cooldown.
    async fn find_decoding_key(&self, kid: Option<&str>) -> Result<DecodingKey, JwksError> {
        let jwks = self.refresh_if_stale().await?;
        if let Some(key) = find_key_in_jwks(&jwks, kid) {
            return Ok(key);
        }
        let unknown = || JwksError::UnknownKeyId(kid.unwrap_or_default().to_string());
        if !self.try_begin_forced_fetch() {
            debug!(kid = ?kid, "Key not found in cached JWKS, refetch cooling down");
            return Err(unknown());
        }

        debug!(kid = ?kid, "Key not found in cached JWKS, refreshing");
        let jwks = self.fetch_jwks().await?;
        find_key_in_jwks(&jwks, kid).ok_or_else(unknown)
    }

    /// Decode a bearer token.
    ///
    /// Returns `Ok(None)` for opaque (non-JWT) tokens. With `verify_signature`
    /// the signature, issuer and expiry are checked; without it the payload is
    /// only base64-decoded.
    pub async fn decode_token(
        &self,
        token: &str,
        verify_signature: bool,
    ) -> Result<Option<Map<String, Value>>, AuthorizationNeeded> {
        if !looks_like_jwt(token) {
            return Ok(None);
        }
        if !verify_signature {
            return decode_claims_unverified(token)
                .map(Some)
                .map_err(|e| AuthorizationNeeded::bearer_invalid(format!("Invalid token: {e}")));
        }
        self.verify_token(token).await.map(Some)
    }

    /// Fully verify a JWT and return its claims.
    pub async fn verify_token(&self, token: &str) -> Result<Map<String, Value>, AuthorizationNeeded> {
        let invalid = || {
            AuthorizationNeeded::bearer_invalid(
                "Your token is invalid. Please log in again to continue.",
            )
        };

        let header = jsonwebtoken::decode_header(token).map_err(|e| {
            debug!(error = %e, "Rejecting token with undecodable header");
            invalid()
        })?;

        let key = self.find_decoding_key(header.kid.as_deref()).await.map_err(|e| {
            warn!(error = %e, "Unable to resolve token signing key");
            invalid()
        })?;

        let mut validation = build_validation(&header);
        if let Some(issuer) = self.issuer() {
            validation.set_issuer(&[issuer]);
        }

        let claims = jsonwebtoken::decode::<Map<String, Value>>(token, &key, &validation)
            .map_err(|e| {
                match e.kind() {
                    ErrorKind::InvalidIssuer => debug!("Rejecting token from unexpected issuer"),
                    ErrorKind::MissingRequiredClaim(claim) => debug!(claim = %claim, "Rejecting token without required claim"),
                    _ => debug!(error = %e, "Token verification failed"),
                }
                invalid()
            })?
            .claims;

        let now = self.clock.now();
        let expires = claims
            .get("exp")
            .and_then(Value::as_i64)
            .and_then(|exp| DateTime::from_timestamp(exp, 0));
        match expires {
            Some(exp) if exp + Duration::seconds(self.leeway) > now => Ok(claims),
            Some(exp) => {
                debug!(expired_at = %exp, "Rejecting expired token");
                Err(AuthorizationNeeded::token_expired(Some(exp), now))
            }
            None => Err(invalid()),
        }
    }

    /// Verified `sub`, or `None` on any failure.
    pub async fn get_subject_from_token(&self, token: &str) -> Option<String> {
        let claims = self.verify_token(token).await.ok()?;
        claims.get("sub")?.as_str().map(str::to_string)
    }

    /// Verified `aud`, or `None` on any failure.
    pub async fn get_audience_from_token(&self, token: &str) -> Option<Audience> {
        let claims = self.verify_token(token).await.ok()?;
        serde_json::from_value(claims.get("aud")?.clone()).ok()
    }

    /// Verified `iss`, or `None` on any failure.
    pub async fn get_issuer_from_token(&self, token: &str) -> Option<String> {
        let claims = self.verify_token(token).await.ok()?;
        claims.get("iss")?.as_str().map(str::to_string)
    }

    /// Verified `exp`, or `None` on any failure.
    pub async fn get_expiration_from_token(&self, token: &str) -> Option<DateTime<Utc>> {
        let claims = self.verify_token(token).await.ok()?;
        DateTime::from_timestamp(claims.get("exp")?.as_i64()?, 0)
    }

    /// Verified `iat`, or `None` on any failure.
    pub async fn get_created_at_from_token(&self, token: &str) -> Option<DateTime<Utc>> {
        let claims = self.verify_token(token).await.ok()?;
        DateTime::from_timestamp(claims.get("iat")?.as_i64()?, 0)
    }
}

/// Find a JWK by `kid`. A key set with a single key matches a token without `kid`.
fn find_key_in_jwks(jwks: &JwkSet, kid: Option<&str>) -> Option<DecodingKey> {
    let jwk: &Jwk = match kid {
        Some(kid) => jwks
            .keys
            .iter()
            .find(|k| k.common.key_id.as_deref() == Some(kid))?,
        None if jwks.keys.len() == 1 => jwks.keys.first()?,
        None => return None,
    };
    DecodingKey::from_jwk(jwk)
        .inspect_err(|e| warn!(kid = ?kid, error = %e, "Unusable JWK"))
        .ok()
}

/// Build a [`Validation`] for the header's algorithm.
///
/// The key family must match the algorithm, so an HMAC header cannot be
/// verified with a published RSA key.
fn build_validation(header: &Header) -> Validation {
    let mut v = Validation::new(header.alg);
    // exp is checked against the injected clock after signature verification
    v.validate_exp = false;
    v.validate_aud = false;
    v.set_required_spec_claims(&["exp"]);
    v
}
