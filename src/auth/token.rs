//! Token data model.
//!
//! A [`Token`] is an immutable view over a compact JWT (or an opaque bearer
//! string). Claims are decoded without signature verification; trust decisions
//! are made by [`TokenReader`](super::TokenReader).
//!
//! A [`TokenCacheItem`] aggregates the access, ID and refresh tokens issued for
//! one `(issuer, audience, subject/email)` triple and is what the token cache
//! persists.

use std::fmt;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Token classification from the `typ` claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    /// Access token (`typ: Bearer`, or no `typ` at all)
    Access,
    /// OpenID Connect ID token (`typ: ID`)
    Id,
    /// Refresh token (`typ: Refresh`, `typ: Offline`)
    Refresh,
}

impl TokenKind {
    /// Classify a `typ` claim. A missing claim is an access token; an
    /// unrecognized one yields `None`.
    #[must_use]
    pub fn from_claim(typ: Option<&str>) -> Option<Self> {
        let Some(typ) = typ else {
            return Some(Self::Access);
        };
        match typ.to_ascii_lowercase().as_str() {
            "bearer" | "access" | "at+jwt" => Some(Self::Access),
            "id" | "id_token" => Some(Self::Id),
            "refresh" | "offline" => Some(Self::Refresh),
            _ => None,
        }
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Access => f.write_str("access"),
            Self::Id => f.write_str("id"),
            Self::Refresh => f.write_str("refresh"),
        }
    }
}

/// The `aud` claim: a single string or an array of strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    /// `"aud": "tools"`
    Single(String),
    /// `"aud": ["tools", "account"]`
    Multiple(Vec<String>),
}

impl Audience {
    /// Whether `aud` is one of the token's audiences.
    #[must_use]
    pub fn contains(&self, aud: &str) -> bool {
        match self {
            Self::Single(s) => s == aud,
            Self::Multiple(v) => v.iter().any(|a| a == aud),
        }
    }

    /// Whether any of `allowed` is one of the token's audiences.
    #[must_use]
    pub fn intersects(&self, allowed: &[String]) -> bool {
        allowed.iter().any(|a| self.contains(a))
    }

    /// The first audience, used as the cache key dimension.
    #[must_use]
    pub fn first(&self) -> Option<&str> {
        match self {
            Self::Single(s) => Some(s.as_str()),
            Self::Multiple(v) => v.first().map(String::as_str),
        }
    }

    /// All audiences as a vector of borrowed strings.
    #[must_use]
    pub fn values(&self) -> Vec<&str> {
        match self {
            Self::Single(s) => vec![s.as_str()],
            Self::Multiple(v) => v.iter().map(String::as_str).collect(),
        }
    }
}

impl fmt::Display for Audience {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single(s) => f.write_str(s),
            Self::Multiple(v) => f.write_str(&v.join(", ")),
        }
    }
}

/// Errors building tokens and cache items.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    /// The string has JWT shape but its payload is not base64url JSON.
    #[error("Malformed JWT payload: {0}")]
    Malformed(String),

    /// The `typ` claim is not one of access, ID or refresh.
    #[error("Unrecognized token type: {0}")]
    UnrecognizedType(String),
}

/// Whether `raw` has the compact JWS shape (`header.payload.signature`).
#[must_use]
pub fn looks_like_jwt(raw: &str) -> bool {
    raw.matches('.').count() == 2
}

/// Decode the payload segment of a compact JWT without verifying it.
pub fn decode_claims_unverified(raw: &str) -> Result<Map<String, Value>, TokenError> {
    let payload = raw
        .split('.')
        .nth(1)
        .ok_or_else(|| TokenError::Malformed("missing payload segment".to_string()))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| TokenError::Malformed(e.to_string()))?;
    match serde_json::from_slice::<Value>(&bytes) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(TokenError::Malformed("payload is not a JSON object".to_string())),
        Err(e) => Err(TokenError::Malformed(e.to_string())),
    }
}

fn timestamp_claim(claims: &Map<String, Value>, name: &str) -> Option<DateTime<Utc>> {
    let value = claims.get(name)?;
    #[allow(clippy::cast_possible_truncation)]
    let secs = value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f as i64))?;
    DateTime::from_timestamp(secs, 0)
}

/// Immutable token value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "StoredToken", into = "StoredToken")]
pub struct Token {
    token: String,
    expires: Option<DateTime<Utc>>,
    issued: Option<DateTime<Utc>>,
    claims: Option<Map<String, Value>>,
    issuer: Option<String>,
    kind: Option<TokenKind>,
}

impl Token {
    /// Parse a bearer string. Opaque (non-JWT) strings are accepted and carry no claims.
    pub fn parse(raw: impl Into<String>) -> Result<Self, TokenError> {
        let raw = raw.into();
        if !looks_like_jwt(&raw) {
            return Ok(Self::opaque(raw));
        }

        let claims = decode_claims_unverified(&raw)?;
        let expires = timestamp_claim(&claims, "exp");
        let issued = timestamp_claim(&claims, "iat");
        let issuer = claims.get("iss").and_then(Value::as_str).map(str::to_string);
        let kind = TokenKind::from_claim(claims.get("typ").and_then(Value::as_str));

        Ok(Self {
            token: raw,
            expires,
            issued,
            claims: Some(claims),
            issuer,
            kind,
        })
    }

    /// Wrap an opaque bearer value (static API key, sentinel, opaque refresh token).
    #[must_use]
    pub fn opaque(raw: impl Into<String>) -> Self {
        Self {
            token: raw.into(),
            expires: None,
            issued: None,
            claims: None,
            issuer: None,
            kind: Some(TokenKind::Access),
        }
    }

    /// Record an explicit expiry on an opaque token (e.g. a refresh token
    /// with `refresh_expires_in`). JWTs are left alone: their `exp` claim is
    /// the only expiry that survives storage, and a JWT without one stays
    /// invalid.
    #[must_use]
    pub fn with_expiry(mut self, expires: DateTime<Utc>) -> Self {
        if self.claims.is_none() && self.expires.is_none() {
            self.expires = Some(expires);
        }
        self
    }

    /// Force the classification, used for opaque tokens whose role is known
    /// from the token endpoint response field they arrived in.
    #[must_use]
    pub fn with_kind(mut self, kind: TokenKind) -> Self {
        if self.claims.is_none() {
            self.kind = Some(kind);
        }
        self
    }

    /// The raw compact string.
    #[must_use]
    pub fn raw(&self) -> &str {
        &self.token
    }

    /// Whether the token was parsed from a JWT.
    #[must_use]
    pub fn is_jwt(&self) -> bool {
        self.claims.is_some()
    }

    /// Expiry (`exp`).
    #[must_use]
    pub fn expires(&self) -> Option<DateTime<Utc>> {
        self.expires
    }

    /// Issue time (`iat`).
    #[must_use]
    pub fn issued(&self) -> Option<DateTime<Utc>> {
        self.issued
    }

    /// Full decoded payload.
    #[must_use]
    pub fn claims(&self) -> Option<&Map<String, Value>> {
        self.claims.as_ref()
    }

    /// A single claim.
    #[must_use]
    pub fn claim(&self, name: &str) -> Option<&Value> {
        self.claims.as_ref()?.get(name)
    }

    fn string_claim(&self, name: &str) -> Option<&str> {
        self.claim(name).and_then(Value::as_str)
    }

    /// Issuer (`iss`).
    #[must_use]
    pub fn issuer(&self) -> Option<&str> {
        self.issuer.as_deref()
    }

    /// Raw `typ` claim.
    #[must_use]
    pub fn token_type(&self) -> Option<&str> {
        self.string_claim("typ")
    }

    /// Classification; `None` when the `typ` claim is unrecognized.
    #[must_use]
    pub fn kind(&self) -> Option<TokenKind> {
        self.kind
    }

    /// `typ` is ID.
    #[must_use]
    pub fn is_id_token(&self) -> bool {
        self.kind == Some(TokenKind::Id)
    }

    /// `typ` is Bearer or absent.
    #[must_use]
    pub fn is_access_token(&self) -> bool {
        self.kind == Some(TokenKind::Access)
    }

    /// `typ` is Refresh.
    #[must_use]
    pub fn is_refresh_token(&self) -> bool {
        self.kind == Some(TokenKind::Refresh)
    }

    /// Subject (`sub`).
    #[must_use]
    pub fn subject(&self) -> Option<&str> {
        self.string_claim("sub")
    }

    /// Email (`email`).
    #[must_use]
    pub fn email(&self) -> Option<&str> {
        self.string_claim("email")
    }

    /// Audience (`aud`).
    #[must_use]
    pub fn audience(&self) -> Option<Audience> {
        self.claim("aud")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Valid iff an expiry is known and lies in the future.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }

    /// [`is_valid`](Self::is_valid) against an explicit instant.
    #[must_use]
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|exp| exp > now)
    }
}

/// Persisted form of a [`Token`]: claims are re-derived from the raw string on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredToken {
    token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    kind: Option<TokenKind>,
}

impl TryFrom<StoredToken> for Token {
    type Error = TokenError;

    fn try_from(stored: StoredToken) -> Result<Self, Self::Error> {
        let mut token = Token::parse(stored.token)?;
        if let Some(expires) = stored.expires {
            token = token.with_expiry(expires);
        }
        if let Some(kind) = stored.kind {
            token = token.with_kind(kind);
        }
        Ok(token)
    }
}

impl From<Token> for StoredToken {
    fn from(token: Token) -> Self {
        let opaque = !token.is_jwt();
        Self {
            expires: if opaque { token.expires } else { None },
            kind: if opaque { token.kind } else { None },
            token: token.token,
        }
    }
}

/// Persisted aggregate of the tokens issued for one identity and audience.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenCacheItem {
    /// Store-assigned identifier.
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Issuer of the tokens.
    pub issuer: String,
    /// Audience (auth provider) the tokens are scoped to.
    pub audience: String,
    /// Owner's email.
    #[serde(default)]
    pub email: Option<String>,
    /// Owner's subject.
    #[serde(default)]
    pub subject: Option<String>,
    /// URL the login was started from.
    #[serde(default)]
    pub referrer: Option<String>,
    /// Access token.
    #[serde(default)]
    pub access_token: Option<Token>,
    /// ID token.
    #[serde(default)]
    pub id_token: Option<Token>,
    /// Refresh token.
    #[serde(default)]
    pub refresh_token: Option<Token>,
    /// When the item was first stored.
    pub created: DateTime<Utc>,
    /// Last write.
    pub updated: DateTime<Utc>,
    /// Last successful refresh.
    #[serde(default)]
    pub refreshed: Option<DateTime<Utc>>,
}

impl TokenCacheItem {
    /// Build an item around a single token, slotting it by its kind.
    pub fn create(token: Token) -> Result<Self, TokenError> {
        let now = Utc::now();
        let mut item = Self {
            id: None,
            issuer: token.issuer().unwrap_or_default().to_string(),
            audience: token
                .audience()
                .and_then(|a| a.first().map(str::to_string))
                .unwrap_or_default(),
            email: token.email().map(str::to_string),
            subject: token.subject().map(str::to_string),
            referrer: None,
            access_token: None,
            id_token: None,
            refresh_token: None,
            created: now,
            updated: now,
            refreshed: None,
        };

        match token.kind() {
            Some(TokenKind::Access) => item.access_token = Some(token),
            Some(TokenKind::Id) => item.id_token = Some(token),
            Some(TokenKind::Refresh) => item.refresh_token = Some(token),
            None => {
                return Err(TokenError::UnrecognizedType(
                    token.token_type().unwrap_or_default().to_string(),
                ));
            }
        }

        Ok(item)
    }

    /// The token to present downstream: the ID token when present, else the access token.
    #[must_use]
    pub fn get_token(&self) -> Option<&Token> {
        self.id_token.as_ref().or(self.access_token.as_ref())
    }

    /// Expired when neither an ID nor an access token exists, or when the
    /// preferred one of the two is invalid.
    ///
    /// With an ID token present only its validity counts; the access token's
    /// own expiry is not consulted in that case.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// [`is_expired`](Self::is_expired) against an explicit instant.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match (&self.id_token, &self.access_token) {
            (None, None) => true,
            (Some(id), _) => !id.is_valid_at(now),
            (None, Some(access)) => !access.is_valid_at(now),
        }
    }

    /// Whether the ID token exists and is valid.
    #[must_use]
    pub fn has_valid_id_token_at(&self, now: DateTime<Utc>) -> bool {
        self.id_token.as_ref().is_some_and(|t| t.is_valid_at(now))
    }

    /// Whether a refresh grant can still be attempted.
    #[must_use]
    pub fn has_valid_refresh_token_at(&self, now: DateTime<Utc>) -> bool {
        self.refresh_token.as_ref().is_some_and(|t| t.is_valid_at(now))
    }

    /// Email, falling back to subject.
    #[must_use]
    pub fn principal(&self) -> Option<&str> {
        self.email.as_deref().or(self.subject.as_deref())
    }

    /// Lock/cache key for this item's identity.
    #[must_use]
    pub fn key(&self) -> String {
        cache_key(&self.audience, self.principal().unwrap_or_default())
    }

    /// Replace tokens after a refresh grant. Whole tokens are swapped, never merged;
    /// a `None` refresh token keeps the previous one.
    pub fn apply_refresh(
        &mut self,
        access_token: Token,
        id_token: Option<Token>,
        refresh_token: Option<Token>,
        now: DateTime<Utc>,
    ) {
        self.access_token = Some(access_token);
        if id_token.is_some() {
            self.id_token = id_token;
        }
        if refresh_token.is_some() {
            self.refresh_token = refresh_token;
        }
        self.refreshed = Some(now);
        self.updated = now;
    }
}

/// Key for an `(audience, principal)` pair.
#[must_use]
pub fn cache_key(audience: &str, principal: &str) -> String {
    format!("{audience}|{principal}")
}
