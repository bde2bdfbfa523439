//! OpenID Connect discovery.
//!
//! Fetches `.well-known/openid-configuration` documents and caches them per
//! URI so the login, callback and refresh paths do not rediscover on every call.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use reqwest::Client;
use serde::{Deserialize, Deserializer, Serialize, de::DeserializeOwned};
use tracing::debug;

use super::clock::SharedClock;

/// Failures fetching discovery documents and key sets.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Endpoint unreachable (DNS, connect, timeout)
    #[error("Failed to reach {url}: {message}")]
    Connection {
        /// Requested URL
        url: String,
        /// Transport error
        message: String,
    },

    /// Endpoint answered with a non-2xx status
    #[error("{url} returned HTTP {status}")]
    Status {
        /// Requested URL
        url: String,
        /// HTTP status code
        status: u16,
    },

    /// Body is not the expected JSON document
    #[error("Invalid response from {url}: {message}")]
    Parse {
        /// Requested URL
        url: String,
        /// Decoder error
        message: String,
    },
}

impl From<FetchError> for crate::Error {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Status { status, url } => crate::Error::Upstream {
                status,
                message: format!("{url} returned HTTP {status}"),
            },
            other => crate::Error::Internal(other.to_string()),
        }
    }
}

/// GET `url` and decode a JSON body, distinguishing connection, status and parse failures.
pub async fn fetch_json<T: DeserializeOwned>(client: &Client, url: &str) -> Result<T, FetchError> {
    let response = client
        .get(url)
        .header(reqwest::header::ACCEPT, "application/json")
        .send()
        .await
        .map_err(|e| FetchError::Connection {
            url: url.to_string(),
            message: e.to_string(),
        })?;

    let status = response.status();
    if !status.is_success() {
        return Err(FetchError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }

    response.json().await.map_err(|e| FetchError::Parse {
        url: url.to_string(),
        message: e.to_string(),
    })
}

/// OpenID Provider Metadata (OpenID Connect Discovery 1.0, section 3)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderMetadata {
    /// Issuer identifier
    pub issuer: String,

    /// Authorization endpoint URL
    pub authorization_endpoint: String,

    /// Token endpoint URL
    pub token_endpoint: String,

    /// JWKS URL
    #[serde(default)]
    pub jwks_uri: Option<String>,

    /// Userinfo endpoint (optional)
    #[serde(default)]
    pub userinfo_endpoint: Option<String>,

    /// RP-initiated logout endpoint (optional)
    #[serde(default)]
    pub end_session_endpoint: Option<String>,

    /// Supported scopes (may be string or array due to implementation bugs)
    #[serde(default, deserialize_with = "deserialize_scopes")]
    pub scopes_supported: Vec<String>,

    /// Supported grant types
    #[serde(default)]
    pub grant_types_supported: Vec<String>,

    /// Supported PKCE code challenge methods
    #[serde(default)]
    pub code_challenge_methods_supported: Vec<String>,
}

/// Deserialize scopes that may be either a string or array
fn deserialize_scopes<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrVec {
        String(String),
        Vec(Vec<String>),
    }

    match StringOrVec::deserialize(deserializer)? {
        StringOrVec::String(s) => Ok(s.split_whitespace().map(String::from).collect()),
        StringOrVec::Vec(v) => Ok(v),
    }
}

impl ProviderMetadata {
    /// Fetch the discovery document at `well_known_uri`.
    pub async fn discover(client: &Client, well_known_uri: &str) -> Result<Self, FetchError> {
        debug!(url = %well_known_uri, "Discovering OpenID provider metadata");
        let metadata: Self = fetch_json(client, well_known_uri).await?;
        debug!(issuer = %metadata.issuer, "Discovered OpenID provider");
        Ok(metadata)
    }

    /// Scopes to request at login: `openid` plus `email`/`offline_access` when offered.
    #[must_use]
    pub fn login_scopes(&self) -> Vec<&str> {
        let mut scopes = vec!["openid"];
        for optional in ["email", "profile", "offline_access"] {
            if self.scopes_supported.is_empty() || self.scopes_supported.iter().any(|s| s == optional) {
                scopes.push(optional);
            }
        }
        scopes
    }
}

/// Per-URI discovery cache with a fixed TTL.
#[derive(Clone)]
pub struct MetadataCache {
    client: Client,
    clock: SharedClock,
    ttl: Duration,
    entries: Arc<DashMap<String, (DateTime<Utc>, Arc<ProviderMetadata>)>>,
}

impl MetadataCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new(client: Client, clock: SharedClock, ttl: Duration) -> Self {
        Self {
            client,
            clock,
            ttl,
            entries: Arc::new(DashMap::new()),
        }
    }

    /// Cached metadata for `well_known_uri`, fetched when absent or stale.
    pub async fn get(&self, well_known_uri: &str) -> Result<Arc<ProviderMetadata>, FetchError> {
        let now = self.clock.now();
        if let Some(entry) = self.entries.get(well_known_uri) {
            let (fetched_at, metadata) = entry.value();
            if now - *fetched_at < self.ttl {
                return Ok(Arc::clone(metadata));
            }
        }

        let metadata = Arc::new(ProviderMetadata::discover(&self.client, well_known_uri).await?);
        self.entries
            .insert(well_known_uri.to_string(), (now, Arc::clone(&metadata)));
        Ok(metadata)
    }
}
