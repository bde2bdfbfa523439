//! Cache boundary between "we have a working credential" and "the user must log in".

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use super::clock::SharedClock;
use super::error::AuthorizationNeeded;
use super::reader::TokenReader;
use super::token::{Audience, Token, TokenCacheItem};
use crate::Result;
use crate::store::TokenRepository;

/// A credential to attach to an outbound call.
#[derive(Debug, Clone, PartialEq)]
pub enum Credential {
    /// The caller's own bearer token (already scoped correctly, or a bypass marker)
    Bearer(Token),
    /// A cached token for the tool's audience
    Cached(TokenCacheItem),
}

impl Credential {
    /// The token to present: the bearer itself, or the cache item's preferred token.
    #[must_use]
    pub fn token(&self) -> Option<&Token> {
        match self {
            Self::Bearer(token) => Some(token),
            Self::Cached(item) => item.get_token(),
        }
    }

    /// Raw string for an `Authorization: Bearer` header.
    #[must_use]
    pub fn bearer(&self) -> Option<&str> {
        self.token().map(Token::raw)
    }
}

/// Resolves credentials for tools from the caller's bearer token and the token cache.
pub struct TokenExchangeManager {
    reader: Arc<TokenReader>,
    tokens: TokenRepository,
    clock: SharedClock,
    bypass_tokens: Vec<String>,
}

impl TokenExchangeManager {
    /// Create a manager. `bypass_tokens` are bearer values accepted without verification.
    #[must_use]
    pub fn new(
        reader: Arc<TokenReader>,
        tokens: TokenRepository,
        clock: SharedClock,
        bypass_tokens: Vec<String>,
    ) -> Self {
        Self {
            reader,
            tokens,
            clock,
            bypass_tokens,
        }
    }

    /// The verifying reader.
    #[must_use]
    pub fn reader(&self) -> &TokenReader {
        &self.reader
    }

    /// Current instant from the injected clock.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Whether `token` is a verification bypass marker.
    #[must_use]
    pub fn is_bypass_token(&self, token: &str) -> bool {
        self.bypass_tokens.iter().any(|t| t == token)
    }

    /// Single cache lookup by `(audience, email)`.
    pub async fn get_token_for_auth_provider(
        &self,
        audience: &str,
        email: &str,
    ) -> Result<Option<TokenCacheItem>> {
        self.tokens.find(audience, email).await
    }

    /// First cached item, in `audiences` order, whose preferred token is valid.
    pub async fn get_valid_token_for_auth_provider(
        &self,
        audiences: &[String],
        email: Option<&str>,
    ) -> Result<Option<TokenCacheItem>> {
        let Some(email) = email.filter(|e| !e.is_empty()) else {
            return Ok(None);
        };
        let now = self.clock.now();
        for audience in audiences {
            if let Some(item) = self.tokens.find(audience, email).await? {
                if item.get_token().is_some_and(|t| t.is_valid_at(now)) {
                    return Ok(Some(item));
                }
            }
        }
        Ok(None)
    }

    /// Upsert `item` under `(audience, email)`, replacing any previous entry.
    pub async fn store_token(&self, item: &TokenCacheItem, email: &str, audience: &str) -> Result<String> {
        let mut item = item.clone();
        item.email = Some(email.to_string());
        item.audience = audience.to_string();
        self.tokens.upsert(&item).await
    }

    /// Resolve the credential for one tool invocation.
    ///
    /// Order: verify the caller's bearer token; use it directly when its
    /// audience is acceptable (or no audience is required); otherwise fall back
    /// to a cached token for `tool_auth_audiences[0]` under the caller's
    /// identity; otherwise fail with the found and expected audiences.
    ///
    /// # Errors
    ///
    /// `Error::Authorization` when the user has to log in. Token cache
    /// failures propagate as `Error::Store`.
    pub async fn get_token_for_tool(
        &self,
        auth_header: Option<&str>,
        error_message: &str,
        tool_name: &str,
        tool_auth_audiences: &[String],
    ) -> Result<Credential> {
        let audiences = tool_auth_audiences.to_vec();

        let Some(header) = auth_header.filter(|h| !h.trim().is_empty()) else {
            return Err(AuthorizationNeeded::bearer_invalid(error_message)
                .with_audiences(audiences)
                .into());
        };
        let Some(raw) = TokenReader::extract_token(Some(header)) else {
            return Err(AuthorizationNeeded::bearer_invalid(
                "The Authorization header must have the form 'Bearer <token>'.",
            )
            .with_audiences(audiences)
            .into());
        };

        if self.is_bypass_token(raw) {
            debug!(tool = %tool_name, "Bypass bearer, skipping verification");
            return Ok(Credential::Bearer(Token::opaque(raw)));
        }

        // Failures here are already AuthorizationNeeded and pass through unchanged
        let claims = self
            .reader
            .decode_token(raw, true)
            .await
            .map_err(|e| e.with_audiences(audiences.clone()))?;

        let Some(claims) = claims else {
            // Opaque bearer: usable as-is only when no audience is required
            if audiences.is_empty() {
                return Ok(Credential::Bearer(Token::opaque(raw)));
            }
            return Err(AuthorizationNeeded::cache_missing(
                format!(
                    "Tool '{tool_name}' requires a login for {}; the presented credential cannot be matched to a user.",
                    audiences.join(", ")
                ),
                audiences,
            )
            .into());
        };

        let token = Token::parse(raw).map_err(|e| {
            AuthorizationNeeded::bearer_invalid(format!("Invalid token: {e}")).with_audiences(audiences.clone())
        })?;
        let found: Option<Audience> = claims
            .get("aud")
            .and_then(|v| serde_json::from_value(v.clone()).ok());

        if audiences.is_empty() || found.as_ref().is_some_and(|aud| aud.intersects(&audiences)) {
            debug!(tool = %tool_name, "Bearer audience accepted");
            return Ok(Credential::Bearer(token));
        }

        let expected = &audiences[0];
        let found_text = found.as_ref().map_or_else(|| "none".to_string(), ToString::to_string);
        let principal = claims
            .get("email")
            .and_then(Value::as_str)
            .or_else(|| claims.get("sub").and_then(Value::as_str));

        if let Some(principal) = principal {
            match self.tokens.find(expected, principal).await? {
                Some(item) if item.is_expired_at(self.clock.now()) => {
                    debug!(tool = %tool_name, audience = %expected, "Cached token expired");
                    return Err(AuthorizationNeeded::cache_expired(item).into());
                }
                Some(item) => {
                    debug!(tool = %tool_name, audience = %expected, "Using cached token for tool audience");
                    return Ok(Credential::Cached(item));
                }
                None => {}
            }
        }

        Err(AuthorizationNeeded::cache_missing(
            format!(
                "Tool '{tool_name}' needs a token for audience '{expected}', but the presented token is for '{found_text}' and no cached token for '{expected}' exists. Please log in to {expected}."
            ),
            audiences,
        )
        .into())
    }
}
