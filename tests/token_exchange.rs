//! Token exchange against a mocked provider
//!
//! Covers the per-tool decision order:
//! - verified bearer with an accepted audience is used as-is
//! - wrong audience falls back to the cache under the caller's identity
//! - no cache entry fails with both audiences named
//! - bypass markers skip verification entirely

mod common;

use std::sync::Arc;

use chrono::{Duration, Utc};
use reqwest::Client;
use wiremock::matchers::any;
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{CountingStore, EMAIL, Provider, UnavailableStore, clock_at};
use llm_gateway::auth::{AuthFailure, Credential, Token, TokenCacheItem, TokenExchangeManager, TokenReader};
use llm_gateway::Error;
use llm_gateway::store::{DocumentStore, TokenRepository};

fn exchange(provider: &Provider, store: Arc<dyn DocumentStore>) -> TokenExchangeManager {
    let (_, clock) = clock_at(Utc::now());
    let reader = TokenReader::new(Client::new(), clock.clone(), Some(provider.well_known()));
    TokenExchangeManager::new(
        Arc::new(reader),
        TokenRepository::new(store, "tokens"),
        clock,
        vec!["bedrock".to_string(), "fake-api-key".to_string()],
    )
}

fn bearer(token: &str) -> String {
    format!("Bearer {token}")
}

#[tokio::test]
async fn accepted_audience_skips_the_cache() {
    // GIVEN: a verified token for the tool's audience
    let provider = Provider::start().await;
    let store = Arc::new(CountingStore::default());
    let manager = exchange(&provider, store.clone());
    let token = provider.token("search", "Bearer", Utc::now() + Duration::hours(1));

    // WHEN: the tool asks for a credential
    let credential = manager
        .get_token_for_tool(Some(&bearer(&token)), "x", "search", &["search".to_string()])
        .await
        .unwrap();

    // THEN: the presented token is returned and the store was never queried
    assert_eq!(credential.bearer(), Some(token.as_str()));
    assert!(matches!(credential, Credential::Bearer(_)));
    assert_eq!(store.finds(), 0);
}

#[tokio::test]
async fn no_required_audience_uses_the_bearer() {
    let provider = Provider::start().await;
    let store = Arc::new(CountingStore::default());
    let manager = exchange(&provider, store.clone());
    let token = provider.token("chat", "Bearer", Utc::now() + Duration::hours(1));

    let credential = manager
        .get_token_for_tool(Some(&bearer(&token)), "x", "calculator", &[])
        .await
        .unwrap();

    assert_eq!(credential.bearer(), Some(token.as_str()));
    assert_eq!(store.finds(), 0);
}

#[tokio::test]
async fn wrong_audience_falls_back_to_cached_token() {
    // GIVEN: a bearer for "chat" and a cached ID token for "search" under the same user
    let provider = Provider::start().await;
    let store = Arc::new(CountingStore::default());
    let manager = exchange(&provider, store.clone());
    let cached_raw = provider.token("search", "ID", Utc::now() + Duration::hours(1));
    let cached = TokenCacheItem::create(Token::parse(cached_raw.clone()).unwrap()).unwrap();
    manager.store_token(&cached, EMAIL, "search").await.unwrap();
    let presented = provider.token("chat", "Bearer", Utc::now() + Duration::hours(1));

    // WHEN: the search tool asks for a credential
    let credential = manager
        .get_token_for_tool(Some(&bearer(&presented)), "x", "search", &["search".to_string()])
        .await
        .unwrap();

    // THEN: the cached token wins over the presented one
    let Credential::Cached(item) = &credential else {
        panic!("expected a cached credential, got {credential:?}");
    };
    assert_eq!(item.audience, "search");
    assert_eq!(credential.bearer(), Some(cached_raw.as_str()));
    assert_ne!(credential.bearer(), Some(presented.as_str()));
}

#[tokio::test]
async fn wrong_audience_without_cache_names_both_audiences() {
    let provider = Provider::start().await;
    let manager = exchange(&provider, Arc::new(CountingStore::default()));
    let presented = provider.token("chat", "Bearer", Utc::now() + Duration::hours(1));

    let err = manager
        .get_token_for_tool(Some(&bearer(&presented)), "x", "search", &["search".to_string()])
        .await
        .unwrap_err();
    let err = err.as_authorization().unwrap();

    assert_eq!(err.kind, AuthFailure::CacheMissing);
    assert!(err.message.contains("'chat'"), "{}", err.message);
    assert!(err.message.contains("'search'"), "{}", err.message);
    assert_eq!(err.audiences, vec!["search"]);
}

#[tokio::test]
async fn expired_cache_entry_is_reported_with_the_item() {
    let provider = Provider::start().await;
    let manager = exchange(&provider, Arc::new(CountingStore::default()));
    let stale = provider.token("search", "ID", Utc::now() - Duration::hours(1));
    let item = TokenCacheItem::create(Token::parse(stale).unwrap()).unwrap();
    manager.store_token(&item, EMAIL, "search").await.unwrap();
    let presented = provider.token("chat", "Bearer", Utc::now() + Duration::hours(1));

    let err = manager
        .get_token_for_tool(Some(&bearer(&presented)), "x", "search", &["search".to_string()])
        .await
        .unwrap_err();

    let Some(AuthFailure::CacheExpired(item)) = err.as_authorization().map(|n| &n.kind) else {
        panic!("expected CacheExpired, got {err:?}");
    };
    assert_eq!(item.email.as_deref(), Some(EMAIL));
}

#[tokio::test]
async fn cache_outage_is_a_store_error_not_a_login_prompt() {
    // GIVEN: a verified bearer for "chat" and a token cache that cannot be reached
    let provider = Provider::start().await;
    let manager = exchange(&provider, Arc::new(UnavailableStore));
    let presented = provider.token("chat", "Bearer", Utc::now() + Duration::hours(1));

    // WHEN: the search tool falls back to the cache
    let err = manager
        .get_token_for_tool(Some(&bearer(&presented)), "x", "search", &["search".to_string()])
        .await
        .unwrap_err();

    // THEN: the outage surfaces as such
    assert!(matches!(err, Error::Store(_)), "{err:?}");
    assert!(err.as_authorization().is_none());
}

#[tokio::test]
async fn expired_bearer_asks_to_log_in_again() {
    let provider = Provider::start().await;
    let manager = exchange(&provider, Arc::new(CountingStore::default()));
    let expired = provider.token("search", "Bearer", Utc::now() - Duration::hours(2));

    let err = manager
        .get_token_for_tool(Some(&bearer(&expired)), "x", "search", &["search".to_string()])
        .await
        .unwrap_err();
    let err = err.as_authorization().unwrap();

    assert!(matches!(err.kind, AuthFailure::TokenExpired { .. }));
    assert!(err.message.contains("log in again"), "{}", err.message);
}

#[tokio::test]
async fn tampered_signature_is_invalid() {
    let provider = Provider::start().await;
    let manager = exchange(&provider, Arc::new(CountingStore::default()));
    // Payload swapped for another audience, signature kept
    let genuine = provider.token("chat", "Bearer", Utc::now() + Duration::hours(1));
    let forged = provider.token("search", "Bearer", Utc::now() + Duration::hours(1));
    let parts: Vec<&str> = genuine.split('.').collect();
    let tampered = format!("{}.{}.{}", parts[0], forged.split('.').nth(1).unwrap(), parts[2]);

    let err = manager
        .get_token_for_tool(Some(&bearer(&tampered)), "x", "search", &["search".to_string()])
        .await
        .unwrap_err();

    assert_eq!(err.as_authorization().unwrap().kind, AuthFailure::BearerInvalid);
}

#[tokio::test]
async fn bypass_markers_never_reach_the_provider() {
    // GIVEN: a provider that must not be contacted
    let server = MockServer::start().await;
    Mock::given(any())
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;
    let (_, clock) = clock_at(Utc::now());
    let reader = TokenReader::new(
        Client::new(),
        clock.clone(),
        Some(format!("{}/.well-known/openid-configuration", server.uri())),
    );
    let store = Arc::new(CountingStore::default());
    let manager = TokenExchangeManager::new(
        Arc::new(reader),
        TokenRepository::new(Arc::clone(&store) as _, "tokens"),
        clock,
        vec!["bedrock".to_string(), "fake-api-key".to_string()],
    );

    // WHEN: each marker is presented for an audience-restricted tool
    for marker in ["bedrock", "fake-api-key"] {
        let credential = manager
            .get_token_for_tool(Some(&bearer(marker)), "x", "search", &["search".to_string()])
            .await
            .unwrap();

        // THEN: it passes through untouched
        assert_eq!(credential.bearer(), Some(marker));
    }
    assert_eq!(store.finds(), 0);
}
