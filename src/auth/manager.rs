//! OIDC login and refresh.
//!
//! Authorization-code flow with PKCE (S256). No session storage: the
//! callback recovers its context from the signed `state`, and the PKCE
//! verifier is re-derived from the state's nonce (see [`StateSigner`]).

use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use url::Url;

use super::clock::SharedClock;
use super::config_reader::{AuthConfig, AuthConfigReader};
use super::error::AuthorizationNeeded;
use super::metadata::{MetadataCache, ProviderMetadata};
use super::state::{LoginState, StateSigner, pkce_challenge};
use super::token::{Token, TokenCacheItem, TokenKind};
use crate::store::TokenRepository;
use crate::{Error, Result};

/// OAuth token endpoint response
#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_expires_in: Option<i64>,
}

/// Identity and return address attached to a login.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoginContext {
    /// Subject of the user starting the login
    pub subject: Option<String>,
    /// Email of the user starting the login
    pub email: Option<String>,
    /// URL to return to after the callback
    pub referrer: Option<String>,
}

/// Result of a completed login.
#[derive(Debug, Clone)]
pub struct CallbackOutcome {
    /// Persisted tokens
    pub item: TokenCacheItem,
    /// Where the login was started from
    pub referrer: Option<String>,
}

/// Drives the authorization-code + PKCE dance and refresh-token grants.
pub struct AuthManager {
    http: Client,
    clock: SharedClock,
    configs: AuthConfigReader,
    metadata: MetadataCache,
    signer: StateSigner,
    tokens: TokenRepository,
    gateway_url: String,
}

impl AuthManager {
    /// Create a manager.
    ///
    /// `gateway_url` is the externally visible base of this gateway; login
    /// links point at its `/auth/login` route.
    #[must_use]
    pub fn new(
        http: Client,
        clock: SharedClock,
        configs: AuthConfigReader,
        signer: StateSigner,
        tokens: TokenRepository,
        gateway_url: impl Into<String>,
    ) -> Self {
        let metadata = MetadataCache::new(http.clone(), clock.clone(), Duration::hours(1));
        Self {
            http,
            clock,
            configs,
            metadata,
            signer,
            tokens,
            gateway_url: gateway_url.into(),
        }
    }

    /// Per-audience client configuration.
    #[must_use]
    pub fn configs(&self) -> &AuthConfigReader {
        &self.configs
    }

    /// Redirect URI registered with the providers.
    #[must_use]
    pub fn default_redirect_uri(&self) -> String {
        self.configs
            .settings()
            .redirect_uri
            .clone()
            .unwrap_or_else(|| format!("{}/auth/callback", self.gateway_url.trim_end_matches('/')))
    }

    /// Link to this gateway's login route for `audience`.
    #[must_use]
    pub fn login_url(&self, audience: &str, referrer: Option<&str>) -> String {
        let base = format!("{}/auth/login", self.gateway_url.trim_end_matches('/'));
        let mut url = match Url::parse(&base) {
            Ok(url) => url,
            Err(_) => return format!("{base}?audience={audience}"),
        };
        {
            let mut params = url.query_pairs_mut();
            params.append_pair("audience", audience);
            if let Some(referrer) = referrer {
                params.append_pair("referrer", referrer);
            }
        }
        url.to_string()
    }

    async fn provider(&self, audience: &str) -> Result<(AuthConfig, std::sync::Arc<ProviderMetadata>)> {
        let config = self
            .configs
            .get_config_for_audience(audience)?
            .ok_or_else(|| Error::Config(format!("No auth configuration for audience '{audience}'")))?;
        let well_known = config.well_known_uri.as_deref().ok_or_else(|| {
            Error::Config(format!("No well-known URI configured for audience '{audience}'"))
        })?;
        let metadata = self.metadata.get(well_known).await?;
        Ok((config, metadata))
    }

    /// Build the provider authorization URL for `audience`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the audience has no client configuration,
    /// or an upstream error if discovery fails.
    pub async fn create_authorization_url(
        &self,
        redirect_uri: &str,
        audience: &str,
        context: LoginContext,
    ) -> Result<String> {
        let (config, metadata) = self.provider(audience).await?;
        let client_id = config
            .client_id
            .as_deref()
            .ok_or_else(|| Error::Config(format!("No client id configured for audience '{audience}'")))?;

        let mut state = LoginState::new(audience, self.clock.now());
        state.subject = context.subject;
        state.email = context.email;
        state.referrer = context.referrer;

        let verifier = self.signer.pkce_verifier(&state.nonce);
        let signed_state = self.signer.sign(&state);

        let mut auth_url = Url::parse(&metadata.authorization_endpoint)
            .map_err(|e| Error::Internal(format!("Invalid auth endpoint: {e}")))?;
        {
            let mut params = auth_url.query_pairs_mut();
            params.append_pair("response_type", "code");
            params.append_pair("client_id", client_id);
            params.append_pair("redirect_uri", redirect_uri);
            params.append_pair("scope", &metadata.login_scopes().join(" "));
            params.append_pair("state", &signed_state);
            params.append_pair("code_challenge", &pkce_challenge(&verifier));
            params.append_pair("code_challenge_method", "S256");
        }

        debug!(audience = %audience, "Created authorization URL");
        Ok(auth_url.to_string())
    }

    /// Complete a login: verify `state`, exchange `code`, persist the tokens.
    ///
    /// # Errors
    ///
    /// Returns an authorization error for a bad or stale `state`, an upstream
    /// error if the code exchange fails, and an internal error if the token
    /// endpoint answers without an access token.
    pub async fn read_callback_response(
        &self,
        code: &str,
        state: &str,
        redirect_uri: &str,
    ) -> Result<CallbackOutcome> {
        let now = self.clock.now();
        let state = self
            .signer
            .verify(state, now)
            .map_err(|e| AuthorizationNeeded::bearer_invalid(e.to_string()))?;
        let (config, metadata) = self.provider(&state.audience).await?;

        let verifier = self.signer.pkce_verifier(&state.nonce);
        let mut form = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("code_verifier", verifier.as_str()),
        ];
        if let Some(id) = config.client_id.as_deref() {
            form.push(("client_id", id));
        }
        if let Some(secret) = config.client_secret.as_deref() {
            form.push(("client_secret", secret));
        }

        let response = self
            .request_tokens(&metadata.token_endpoint, &form)
            .await?;
        let access_token = response.access_token.as_deref().ok_or_else(|| {
            Error::Internal("Token endpoint response has no access_token".to_string())
        })?;

        let access = token_from_response(access_token, TokenKind::Access, response.expires_in, now)?;
        let id = response
            .id_token
            .as_deref()
            .map(|t| token_from_response(t, TokenKind::Id, response.expires_in, now))
            .transpose()?;
        let refresh = response
            .refresh_token
            .as_deref()
            .map(|t| token_from_response(t, TokenKind::Refresh, response.refresh_expires_in, now))
            .transpose()?;

        let identity = id.as_ref().unwrap_or(&access);
        let mut email = identity.email().or(access.email()).map(str::to_string);
        let subject = identity
            .subject()
            .map(str::to_string)
            .or(state.subject.clone());
        if email.is_none() {
            email = self.userinfo_email(&metadata, access.raw()).await;
        }
        let email = email.or(state.email.clone());

        let item = TokenCacheItem {
            id: None,
            issuer: identity
                .issuer()
                .map_or_else(|| metadata.issuer.clone(), str::to_string),
            audience: state.audience.clone(),
            email,
            subject,
            referrer: state.referrer.clone(),
            access_token: Some(access),
            id_token: id,
            refresh_token: refresh,
            created: now,
            updated: now,
            refreshed: None,
        };

        if item.principal().is_none() {
            warn!(audience = %item.audience, "Login response carries no email or subject");
            return Err(Error::Upstream {
                status: 502,
                message: "The provider did not identify the user for this login".to_string(),
            });
        }

        let stored_id = self.tokens.upsert(&item).await?;
        info!(audience = %item.audience, principal = ?item.principal(), "Login completed");

        Ok(CallbackOutcome {
            item: TokenCacheItem {
                id: Some(stored_id),
                ..item
            },
            referrer: state.referrer,
        })
    }

    /// Exchange the item's refresh token for fresh tokens and persist them.
    ///
    /// Returns `Ok(None)` when the item has no refresh token, the refresh
    /// token has expired, or the provider refuses the grant: the caller must
    /// fall back to a new login.
    ///
    /// # Errors
    ///
    /// Configuration errors and store failures propagate.
    pub async fn refresh_tokens_with_oidc(&self, item: &TokenCacheItem) -> Result<Option<TokenCacheItem>> {
        let now = self.clock.now();
        let Some(refresh_token) = item
            .refresh_token
            .as_ref()
            .filter(|t| t.is_valid_at(now))
        else {
            debug!(audience = %item.audience, "No usable refresh token");
            return Ok(None);
        };

        let (config, metadata) = match self.provider(&item.audience).await {
            Ok(provider) => provider,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(audience = %item.audience, error = %e, "Provider discovery failed, cannot refresh");
                return Ok(None);
            }
        };

        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.raw()),
        ];
        if let Some(id) = config.client_id.as_deref() {
            form.push(("client_id", id));
        }
        if let Some(secret) = config.client_secret.as_deref() {
            form.push(("client_secret", secret));
        }

        let response = match self.request_tokens(&metadata.token_endpoint, &form).await {
            Ok(response) => response,
            Err(e) => {
                warn!(audience = %item.audience, error = %e, "Refresh grant failed");
                return Ok(None);
            }
        };
        let Some(access_token) = response.access_token.as_deref() else {
            warn!(audience = %item.audience, "Refresh response has no access_token");
            return Ok(None);
        };

        let access = token_from_response(access_token, TokenKind::Access, response.expires_in, now)?;
        let id = response
            .id_token
            .as_deref()
            .map(|t| token_from_response(t, TokenKind::Id, response.expires_in, now))
            .transpose()?;
        let refresh = response
            .refresh_token
            .as_deref()
            .map(|t| token_from_response(t, TokenKind::Refresh, response.refresh_expires_in, now))
            .transpose()?;

        let mut refreshed = item.clone();
        refreshed.apply_refresh(access, id, refresh, now);
        let stored_id = self.tokens.upsert(&refreshed).await?;
        refreshed.id = Some(stored_id);

        info!(audience = %refreshed.audience, principal = ?refreshed.principal(), "Tokens refreshed");
        Ok(Some(refreshed))
    }

    async fn request_tokens(&self, endpoint: &str, form: &[(&str, &str)]) -> Result<TokenResponse> {
        let response = self
            .http
            .post(endpoint)
            .form(form)
            .send()
            .await
            .map_err(|e| Error::Internal(format!("Token request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Upstream {
                status: status.as_u16(),
                message: format!("Token endpoint: {body}"),
            });
        }

        response
            .json()
            .await
            .map_err(|e| Error::Internal(format!("Failed to parse token response: {e}")))
    }

    async fn userinfo_email(&self, metadata: &ProviderMetadata, access_token: &str) -> Option<String> {
        let endpoint = metadata.userinfo_endpoint.as_deref()?;
        let response = self
            .http
            .get(endpoint)
            .bearer_auth(access_token)
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            debug!(status = %response.status(), "Userinfo request failed");
            return None;
        }
        let claims: Value = response.json().await.ok()?;
        claims.get("email")?.as_str().map(str::to_string)
    }
}

/// Parse a token from a token endpoint response, recording `expires_in` on
/// opaque tokens. A JWT keeps the expiry of its own `exp` claim.
fn token_from_response(
    raw: &str,
    kind: TokenKind,
    expires_in: Option<i64>,
    now: DateTime<Utc>,
) -> Result<Token> {
    let token = Token::parse(raw)
        .map_err(|e| Error::Internal(format!("Token endpoint returned a malformed {kind} token: {e}")))?
        .with_kind(kind);
    Ok(match expires_in {
        Some(secs) if secs > 0 => token.with_expiry(now + Duration::seconds(secs)),
        _ => token,
    })
}
