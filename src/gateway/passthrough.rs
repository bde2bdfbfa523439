//! Forwarding to OpenAI-compatible upstreams.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::debug;

use super::auth_info::AuthInformation;
use super::chat::{ChatCompletionRequest, ChatCompletionResponse, CompletionBackend, CompletionContext};
use crate::auth::token::Audience;
use crate::auth::{AuthorizationNeeded, TokenExchangeManager};
use crate::{Error, Result};

/// Picks the bearer token a pass-through upstream accepts.
pub struct PassThroughTokenManager {
    exchange: Arc<TokenExchangeManager>,
    audiences: Vec<String>,
}

impl PassThroughTokenManager {
    /// Tokens for any of `audiences` are accepted, in priority order.
    #[must_use]
    pub fn new(exchange: Arc<TokenExchangeManager>, audiences: Vec<String>) -> Self {
        Self { exchange, audiences }
    }

    /// Bearer token to forward for `auth`.
    ///
    /// The caller's own token when no audience is required or it is a bypass
    /// marker. Otherwise the token is verified: its own audience may be
    /// accepted, and its verified email (else subject) selects the first valid
    /// cached token for one of the upstream's audiences.
    ///
    /// # Errors
    ///
    /// [`Error::Authorization`] when the token does not verify or no
    /// acceptable token exists. Token cache failures propagate.
    pub async fn token_for_upstream(&self, auth: &AuthInformation) -> Result<Option<String>> {
        if self.audiences.is_empty() || auth.bypass {
            return Ok(auth.token.clone());
        }
        let Some(token) = auth.token.as_deref() else {
            return Err(self.login_needed());
        };

        let claims = self
            .exchange
            .reader()
            .decode_token(token, true)
            .await
            .map_err(|e| e.with_audiences(self.audiences.clone()))?;
        let Some(claims) = claims else {
            debug!("Opaque caller token cannot select a cached login");
            return Err(self.login_needed());
        };

        let audience: Option<Audience> = claims
            .get("aud")
            .and_then(|v| serde_json::from_value(v.clone()).ok());
        if audience.is_some_and(|aud| aud.intersects(&self.audiences)) {
            return Ok(Some(token.to_string()));
        }

        let principal = claims
            .get("email")
            .and_then(Value::as_str)
            .or_else(|| claims.get("sub").and_then(Value::as_str));
        let cached = self
            .exchange
            .get_valid_token_for_auth_provider(&self.audiences, principal)
            .await?;
        if let Some(item) = cached {
            if let Some(token) = item.get_token() {
                debug!(audience = %item.audience, "Forwarding cached token");
                return Ok(Some(token.raw().to_string()));
            }
        }

        Err(self.login_needed())
    }

    fn login_needed(&self) -> Error {
        AuthorizationNeeded::cache_missing(
            format!("This model requires a login to {}.", self.audiences.join(", ")),
            self.audiences.clone(),
        )
        .into()
    }
}

/// How a backend authenticates to its upstream.
pub enum UpstreamAuth {
    /// Static API key
    ApiKey(String),
    /// The caller's token, or a cached token for the upstream's audience
    PassThrough(PassThroughTokenManager),
    /// Nothing
    None,
}

/// Forwards completions to `{upstream_url}/chat/completions`.
pub struct PassThroughBackend {
    http: Client,
    endpoint: String,
    upstream_model: Option<String>,
    auth: UpstreamAuth,
}

impl PassThroughBackend {
    /// Backend for the upstream rooted at `upstream_url` (`…/v1`).
    #[must_use]
    pub fn new(http: Client, upstream_url: &str, upstream_model: Option<String>, auth: UpstreamAuth) -> Self {
        Self {
            http,
            endpoint: format!("{}/chat/completions", upstream_url.trim_end_matches('/')),
            upstream_model,
            auth,
        }
    }

    async fn bearer(&self, auth: &AuthInformation) -> Result<Option<String>> {
        match &self.auth {
            UpstreamAuth::ApiKey(key) => Ok(Some(key.clone())),
            UpstreamAuth::PassThrough(tokens) => tokens.token_for_upstream(auth).await,
            UpstreamAuth::None => Ok(None),
        }
    }
}

#[async_trait]
impl CompletionBackend for PassThroughBackend {
    async fn complete(
        &self,
        request: &ChatCompletionRequest,
        context: &CompletionContext,
    ) -> Result<ChatCompletionResponse> {
        let bearer = self.bearer(&context.auth).await?;

        let mut body = request.clone();
        body.stream = false;
        if let Some(model) = &self.upstream_model {
            body.model.clone_from(model);
        }

        let mut outbound = self.http.post(&self.endpoint).json(&body);
        if let Some(bearer) = &bearer {
            outbound = outbound.bearer_auth(bearer);
        }
        let response = outbound.send().await?;
        let status = response.status();

        if status == StatusCode::UNAUTHORIZED {
            if let UpstreamAuth::PassThrough(tokens) = &self.auth {
                return Err(AuthorizationNeeded::bearer_invalid(
                    "The model endpoint rejected your credential. Please log in again.",
                )
                .with_audiences(tokens.audiences.clone())
                .into());
            }
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(Error::Upstream {
                status: status.as_u16(),
                message,
            });
        }

        let mut completion: ChatCompletionResponse = response.json().await?;
        completion.model.clone_from(&request.model);
        Ok(completion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::clock::system_clock;
    use crate::auth::reader::tests::{SECRET, jwks_reader, sign};
    use crate::auth::token::tests::{jwt, token_with};
    use crate::auth::{AuthFailure, TokenCacheItem, TokenReader};
    use crate::gateway::auth_info::read_auth_information;
    use crate::store::{InMemoryDocumentStore, TokenRepository};
    use axum::http::{HeaderMap, HeaderValue, header};
    use chrono::{Duration, Utc};
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header as header_eq, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn exchange() -> Arc<TokenExchangeManager> {
        // No JWKS configured: any attempt to verify fails
        exchange_with(TokenReader::new(Client::new(), system_clock(), None))
    }

    fn exchange_with(reader: TokenReader) -> Arc<TokenExchangeManager> {
        Arc::new(TokenExchangeManager::new(
            Arc::new(reader),
            TokenRepository::new(Arc::new(InMemoryDocumentStore::new()), "tokens"),
            system_clock(),
            vec!["bedrock".to_string()],
        ))
    }

    fn auth_for(token: &str) -> AuthInformation {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {token}")).unwrap());
        read_auth_information(&headers, &crate::config::AuthSettings::default())
    }

    /// Signed token for alice with audience `aud`.
    fn signed(aud: &str) -> String {
        sign(
            &json!({
                "sub": "user-1",
                "email": "alice@example.com",
                "aud": aud,
                "exp": (Utc::now() + Duration::hours(1)).timestamp(),
            }),
            "k1",
            SECRET,
        )
    }

    /// Valid cached "models" login for alice.
    async fn cache_models_login(exchange: &TokenExchangeManager) -> TokenCacheItem {
        let cached = TokenCacheItem::create(token_with(Some("ID"), Duration::hours(1))).unwrap();
        exchange.store_token(&cached, "alice@example.com", "models").await.unwrap();
        cached
    }

    fn request() -> ChatCompletionRequest {
        serde_json::from_value(json!({
            "model": "assistant",
            "stream": true,
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn caller_token_with_accepted_audience_is_forwarded() {
        let (_server, reader) = jwks_reader().await;
        let token = signed("models");
        let tokens = PassThroughTokenManager::new(exchange_with(reader), vec!["models".to_string()]);

        let bearer = tokens.token_for_upstream(&auth_for(&token)).await.unwrap();

        assert_eq!(bearer.as_deref(), Some(token.as_str()));
    }

    #[tokio::test]
    async fn cached_token_is_forwarded_for_other_audiences() {
        // GIVEN: alice's verified token is for "tools" but the upstream wants "models"
        let (_server, reader) = jwks_reader().await;
        let exchange = exchange_with(reader);
        let cached = cache_models_login(&exchange).await;
        let tokens = PassThroughTokenManager::new(exchange, vec!["models".to_string()]);

        // WHEN: resolved
        let bearer = tokens.token_for_upstream(&auth_for(&signed("tools"))).await.unwrap();

        // THEN: her cached ID token is used
        assert_eq!(bearer.as_deref(), cached.get_token().map(|t| t.raw()));
    }

    #[tokio::test]
    async fn unsigned_token_claiming_another_user_gets_nothing() {
        // GIVEN: alice has a cached "models" login
        let (_server, reader) = jwks_reader().await;
        let exchange = exchange_with(reader);
        cache_models_login(&exchange).await;
        let tokens = PassThroughTokenManager::new(exchange, vec!["models".to_string()]);

        // WHEN: unsigned tokens naming alice are presented, for another and for the accepted audience
        for aud in ["tools", "models"] {
            let forged = jwt(&json!({
                "sub": "user-1",
                "email": "alice@example.com",
                "aud": aud,
                "exp": (Utc::now() + Duration::hours(1)).timestamp(),
            }));
            let err = tokens.token_for_upstream(&auth_for(&forged)).await.unwrap_err();

            // THEN: nothing is forwarded and the caller is asked to log in
            let needed = err.as_authorization().unwrap();
            assert_eq!(needed.kind, AuthFailure::BearerInvalid);
            assert_eq!(needed.audiences, vec!["models"]);
        }
    }

    #[tokio::test]
    async fn missing_token_needs_login() {
        let tokens = PassThroughTokenManager::new(exchange(), vec!["models".to_string()]);

        let err = tokens.token_for_upstream(&AuthInformation::default()).await.unwrap_err();

        assert_eq!(err.as_authorization().unwrap().audiences, vec!["models"]);
    }

    #[tokio::test]
    async fn forwards_without_streaming_and_renames_model() {
        // GIVEN: an upstream expecting the upstream model id and the static key
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header_eq("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({"model": "gpt-4o-mini", "stream": false})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "chatcmpl-1",
                "object": "chat.completion",
                "created": 1,
                "model": "gpt-4o-mini",
                "choices": [{"index": 0, "message": {"role": "assistant", "content": "hello"}, "finish_reason": "stop"}]
            })))
            .expect(1)
            .mount(&server)
            .await;
        let backend = PassThroughBackend::new(
            Client::new(),
            &format!("{}/v1/", server.uri()),
            Some("gpt-4o-mini".to_string()),
            UpstreamAuth::ApiKey("sk-test".to_string()),
        );

        // WHEN: completed
        let response = backend.complete(&request(), &CompletionContext::default()).await.unwrap();

        // THEN: the gateway model id is reported back
        assert_eq!(response.model, "assistant");
        assert_eq!(response.message().unwrap().text(), "hello");
    }

    #[tokio::test]
    async fn bypass_caller_is_forwarded_and_rejection_needs_login() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        let backend = PassThroughBackend::new(
            Client::new(),
            &server.uri(),
            None,
            UpstreamAuth::PassThrough(PassThroughTokenManager::new(exchange(), vec!["models".to_string()])),
        );
        let context = CompletionContext {
            auth: auth_for("bedrock"),
            ..CompletionContext::default()
        };

        let err = backend.complete(&request(), &context).await.unwrap_err();

        assert_eq!(err.as_authorization().unwrap().audiences, vec!["models"]);
    }
}
