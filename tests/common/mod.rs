//! Shared fixtures: a mocked OIDC provider, HS256 test tokens and a
//! document store that counts lookups.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use serde_json::{Value, json};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use llm_gateway::{Error, Result};
use llm_gateway::auth::{AuthConfigReader, ManualClock, SharedClock};
use llm_gateway::config::{AuthSettings, Config};
use llm_gateway::store::{Document, DocumentStore, InMemoryDocumentStore};

pub const SECRET: &[u8] = b"integration-test-signing-secret-32b";
pub const KID: &str = "k1";
pub const EMAIL: &str = "alice@example.com";

/// Identity provider serving discovery and JWKS.
pub struct Provider {
    pub server: MockServer,
}

impl Provider {
    pub async fn start() -> Self {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "issuer": server.uri(),
                "authorization_endpoint": format!("{}/auth", server.uri()),
                "token_endpoint": format!("{}/token", server.uri()),
                "jwks_uri": format!("{}/certs", server.uri()),
                "scopes_supported": ["openid", "email", "profile", "offline_access"],
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/certs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "keys": [{"kty": "oct", "kid": KID, "alg": "HS256", "k": URL_SAFE_NO_PAD.encode(SECRET)}]
            })))
            .mount(&server)
            .await;
        Self { server }
    }

    pub fn issuer(&self) -> String {
        self.server.uri()
    }

    pub fn well_known(&self) -> String {
        format!("{}/.well-known/openid-configuration", self.server.uri())
    }

    /// Signed token for `aud` issued by this provider to alice.
    pub fn token(&self, aud: &str, typ: &str, expires: DateTime<Utc>) -> String {
        sign(&json!({
            "iss": self.issuer(),
            "sub": "user-1",
            "email": EMAIL,
            "aud": aud,
            "typ": typ,
            "iat": (expires - Duration::hours(1)).timestamp(),
            "exp": expires.timestamp(),
        }))
    }

    /// Client settings for `audiences`, all served by this provider.
    pub fn client_env(&self, audiences: &[&str]) -> HashMap<String, String> {
        let mut env = HashMap::new();
        for aud in audiences {
            env.insert(format!("AUTH_CLIENT_ID-{aud}"), format!("{aud}-client"));
            env.insert(format!("AUTH_CLIENT_SECRET-{aud}"), format!("{aud}-secret"));
            env.insert(format!("AUTH_WELL_KNOWN_URI-{aud}"), self.well_known());
        }
        env
    }

    /// Gateway settings verifying bearer tokens against this provider.
    pub fn settings(&self, audiences: &[&str]) -> AuthSettings {
        AuthSettings {
            well_known_uri: Some(self.well_known()),
            audiences: audiences.iter().map(ToString::to_string).collect(),
            state_secret: Some("state-secret".to_string()),
            ..AuthSettings::default()
        }
    }

    pub fn config_reader(&self, config: &Config, audiences: &[&str]) -> AuthConfigReader {
        AuthConfigReader::new(&config.auth, self.client_env(audiences))
    }
}

pub fn sign(claims: &Value) -> String {
    let mut header = Header::new(Algorithm::HS256);
    header.kid = Some(KID.to_string());
    encode(&header, claims, &EncodingKey::from_secret(SECRET)).unwrap()
}

pub fn clock_at(now: DateTime<Utc>) -> (ManualClock, SharedClock) {
    let clock = ManualClock::new(now);
    let shared: SharedClock = Arc::new(clock.clone());
    (clock, shared)
}

/// In-memory store that counts `find_by_fields` calls.
#[derive(Default)]
pub struct CountingStore {
    inner: InMemoryDocumentStore,
    finds: AtomicUsize,
}

impl CountingStore {
    pub fn finds(&self) -> usize {
        self.finds.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentStore for CountingStore {
    async fn find_by_fields(&self, collection: &str, filter: &Document) -> Result<Option<Document>> {
        self.finds.fetch_add(1, Ordering::SeqCst);
        self.inner.find_by_fields(collection, filter).await
    }

    async fn insert(&self, collection: &str, record: Document) -> Result<String> {
        self.inner.insert(collection, record).await
    }

    async fn insert_or_update(&self, collection: &str, filter_keys: &[&str], record: Document) -> Result<String> {
        self.inner.insert_or_update(collection, filter_keys, record).await
    }

    async fn delete_by_id(&self, collection: &str, id: &str) -> Result<bool> {
        self.inner.delete_by_id(collection, id).await
    }
}

/// Store whose backend is down: every call fails.
#[derive(Default)]
pub struct UnavailableStore;

#[async_trait]
impl DocumentStore for UnavailableStore {
    async fn find_by_fields(&self, _collection: &str, _filter: &Document) -> Result<Option<Document>> {
        Err(Error::Store("connection refused".to_string()))
    }

    async fn insert(&self, _collection: &str, _record: Document) -> Result<String> {
        Err(Error::Store("connection refused".to_string()))
    }

    async fn insert_or_update(&self, _collection: &str, _filter_keys: &[&str], _record: Document) -> Result<String> {
        Err(Error::Store("connection refused".to_string()))
    }

    async fn delete_by_id(&self, _collection: &str, _id: &str) -> Result<bool> {
        Err(Error::Store("connection refused".to_string()))
    }
}
