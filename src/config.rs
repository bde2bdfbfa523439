//! Configuration management

use std::{collections::HashMap, env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use url::{Origin, Url};

use crate::{Error, Result};

/// Legacy flat environment keys and the config paths they populate.
const LEGACY_ENV_KEYS: &[(&str, &str)] = &[
    ("AUTH_PROVIDER_NAME", "auth.provider_name"),
    ("AUTH_WELL_KNOWN_URI", "auth.well_known_uri"),
    ("AUTH_CLIENT_ID", "auth.client_id"),
    ("AUTH_CLIENT_SECRET", "auth.client_secret"),
    ("AUTH_REDIRECT_URI", "auth.redirect_uri"),
    ("AUTH_AUDIENCES", "auth.audiences"),
    ("AUTH_STATE_SECRET", "auth.state_secret"),
    ("MONGO_URL", "token_cache.mongo_url"),
    ("MONGO_DB_NAME", "token_cache.database"),
    ("MONGO_DB_TOKEN_COLLECTION_NAME", "token_cache.collection"),
    ("OAUTH_CACHE", "token_cache.backend"),
];

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    #[serde(default)]
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Outbound HTTP client configuration
    pub http: HttpConfig,
    /// Gateway login and token verification
    pub auth: AuthSettings,
    /// Token cache persistence
    pub token_cache: TokenCacheConfig,
    /// Models exposed on `/v1/models`, by id
    pub models: HashMap<String, ModelConfig>,
    /// Tools models may invoke, by name
    pub tools: HashMap<String, ToolConfig>,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        // Load from file if provided
        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (LLM_GATEWAY_ prefix)
        figment = figment.merge(Env::prefixed("LLM_GATEWAY_").split("__"));

        // Flat keys shared with older deployments
        figment = figment.merge(legacy_env());

        Self::from_figment(&figment)
    }

    fn from_figment(figment: &Figment) -> Result<Self> {
        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Load env files into process environment (before env var expansion)
        config.load_env_files();

        // Expand ${VAR} in URLs and secrets
        config.expand_env_vars();

        config.validate()?;
        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => {
                        tracing::info!("Loaded env file: {expanded}");
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load env file {expanded}: {e}");
                    }
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in config values
    fn expand_env_vars(&mut self) {
        // Pattern: ${VAR} or ${VAR:-default}
        let Ok(re) = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}") else {
            return;
        };

        let expand_opt = |value: &mut Option<String>| {
            if let Some(v) = value.as_mut() {
                *v = Self::expand_string(&re, v);
            }
        };

        expand_opt(&mut self.auth.well_known_uri);
        expand_opt(&mut self.auth.redirect_uri);
        expand_opt(&mut self.auth.client_secret);
        expand_opt(&mut self.auth.state_secret);
        expand_opt(&mut self.token_cache.mongo_url);
        expand_opt(&mut self.server.public_url);

        for model in self.models.values_mut() {
            expand_opt(&mut model.upstream_url);
            expand_opt(&mut model.api_key);
        }
        for tool in self.tools.values_mut() {
            expand_opt(&mut tool.url);
        }
    }

    /// Expand environment variables in a string
    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }

    /// Cross-section consistency checks.
    fn validate(&self) -> Result<()> {
        for (id, model) in &self.models {
            if let Some(missing) = model.tools.iter().find(|t| !self.tools.contains_key(*t)) {
                return Err(Error::Config(format!(
                    "Model '{id}' references unknown tool '{missing}'"
                )));
            }
            if model.upstream_url.is_none() {
                return Err(Error::Config(format!("Model '{id}' has no upstream_url")));
            }
        }
        if self.token_cache.backend == CacheBackend::Mongo && self.token_cache.mongo_url.is_none() {
            return Err(Error::Config(
                "OAUTH_CACHE=mongo requires MONGO_URL".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether a login may redirect back to `referrer`: its origin must be
    /// the gateway's own or one of `auth.allowed_referrers`.
    #[must_use]
    pub fn is_allowed_referrer(&self, referrer: &str) -> bool {
        let origin = |url: &str| Url::parse(url).ok().map(|u| u.origin());
        let Some(target) = origin(referrer).filter(Origin::is_tuple) else {
            return false;
        };
        std::iter::once(self.server.base_url())
            .chain(self.auth.allowed_referrers.iter().cloned())
            .any(|allowed| origin(&allowed).is_some_and(|o| o == target))
    }

    /// Tools configured for a model, in declaration order.
    pub fn tools_for_model<'a>(
        &'a self,
        model: &'a ModelConfig,
    ) -> impl Iterator<Item = (&'a str, &'a ToolConfig)> + 'a {
        model
            .tools
            .iter()
            .filter_map(|name| self.tools.get(name).map(|tool| (name.as_str(), tool)))
    }
}

/// Flat legacy keys (`AUTH_CLIENT_ID`, `MONGO_URL`, ...) mapped onto nested paths.
fn legacy_env() -> Env {
    let keys: Vec<&str> = LEGACY_ENV_KEYS.iter().map(|(key, _)| *key).collect();
    Env::raw().only(&keys).map(|key| {
        LEGACY_ENV_KEYS
            .iter()
            .find(|(legacy, _)| key.as_str().eq_ignore_ascii_case(legacy))
            .map_or_else(|| key.as_str().to_owned().into(), |(_, path)| (*path).into())
    })
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Externally visible base URL, used to build login links
    pub public_url: Option<String>,
    /// Request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Maximum request body size (bytes)
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 39500,
            public_url: None,
            request_timeout: Duration::from_secs(120),
            shutdown_timeout: Duration::from_secs(30),
            max_body_size: 10 * 1024 * 1024, // 10MB
        }
    }
}

impl ServerConfig {
    /// Base URL for links pointing back at the gateway.
    #[must_use]
    pub fn base_url(&self) -> String {
        self.public_url.clone().map_or_else(
            || format!("http://{}:{}", self.host, self.port),
            |url| url.trim_end_matches('/').to_string(),
        )
    }
}

/// Outbound HTTP client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// TCP connect timeout
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Per-request read timeout
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    /// User-Agent header
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(20),
            user_agent: format!("llm-gateway/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl HttpConfig {
    /// Build the shared outbound client.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialized.
    pub fn client(&self) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .read_timeout(self.read_timeout)
            .user_agent(&self.user_agent)
            .build()
            .map_err(Error::Http)
    }
}

/// Gateway login and token verification settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    /// Audience of the gateway's own login
    pub provider_name: Option<String>,
    /// OIDC discovery document for the gateway's own login
    pub well_known_uri: Option<String>,
    /// Client id for the gateway's own login
    pub client_id: Option<String>,
    /// Client secret for the gateway's own login
    pub client_secret: Option<String>,
    /// Callback URL registered with the provider
    pub redirect_uri: Option<String>,
    /// Audiences with per-audience client credentials
    #[serde(deserialize_with = "deserialize_list")]
    pub audiences: Vec<String>,
    /// Key for signing the login `state` parameter
    pub state_secret: Option<String>,
    /// How long a login `state` stays acceptable
    #[serde(with = "humantime_serde")]
    pub state_ttl: Duration,
    /// JWKS cache lifetime
    #[serde(with = "humantime_serde")]
    pub jwks_ttl: Duration,
    /// Clock skew tolerance for `exp`
    #[serde(with = "humantime_serde")]
    pub leeway: Duration,
    /// Bearer values that bypass verification (local/offline operation)
    #[serde(deserialize_with = "deserialize_list")]
    pub bypass_tokens: Vec<String>,
    /// Origins a finished login may redirect back to, besides the gateway's own
    #[serde(deserialize_with = "deserialize_list")]
    pub allowed_referrers: Vec<String>,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            provider_name: None,
            well_known_uri: None,
            client_id: None,
            client_secret: None,
            redirect_uri: None,
            audiences: Vec::new(),
            state_secret: None,
            state_ttl: Duration::from_secs(15 * 60),
            jwks_ttl: Duration::from_secs(3600),
            leeway: Duration::from_secs(60),
            bypass_tokens: vec!["bedrock".to_string(), "fake-api-key".to_string()],
            allowed_referrers: Vec::new(),
        }
    }
}

impl AuthSettings {
    /// Whether `token` is one of the verification bypass markers.
    #[must_use]
    pub fn is_bypass_token(&self, token: &str) -> bool {
        self.bypass_tokens.iter().any(|t| t == token)
    }
}

/// Accept `"a, b"`, `"a b"` or `["a", "b"]`.
fn deserialize_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
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
        StringOrVec::String(s) => Ok(s
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()),
        StringOrVec::Vec(v) => Ok(v),
    }
}

/// Token cache backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    /// Process-local map (tests, development)
    #[default]
    Memory,
    /// MongoDB collection
    Mongo,
}

/// Token cache persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenCacheConfig {
    /// Backend selection
    pub backend: CacheBackend,
    /// MongoDB connection string
    pub mongo_url: Option<String>,
    /// MongoDB database
    pub database: String,
    /// Collection holding token cache items
    pub collection: String,
}

impl Default for TokenCacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::Memory,
            mongo_url: None,
            database: "llm_gateway".to_string(),
            collection: "tokens".to_string(),
        }
    }
}

/// How a model's completions are produced
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelProvider {
    /// Forward to an OpenAI-compatible upstream, attaching the caller's (or tool's) credential
    #[default]
    PassThrough,
    /// OpenAI-compatible upstream with a static API key
    OpenAi,
}

/// A model exposed by the gateway
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ModelConfig {
    /// Backend type
    pub provider: ModelProvider,
    /// Upstream base URL (`…/v1`)
    pub upstream_url: Option<String>,
    /// Upstream model id, defaults to the gateway model id
    pub upstream_model: Option<String>,
    /// Static upstream API key
    pub api_key: Option<String>,
    /// Audiences whose token the pass-through upstream accepts
    #[serde(deserialize_with = "deserialize_list")]
    pub audiences: Vec<String>,
    /// Tools the model may invoke
    pub tools: Vec<String>,
    /// Human-readable description
    pub description: String,
}

/// Static configuration of one tool
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ToolConfig {
    /// Tool requires a per-audience credential
    pub auth: bool,
    /// Auth providers (audiences) able to issue the tool's credential
    #[serde(deserialize_with = "deserialize_list")]
    pub auth_providers: Vec<String>,
    /// Audiences the tool's endpoint accepts, in priority order
    #[serde(deserialize_with = "deserialize_list")]
    pub auth_audiences: Vec<String>,
    /// Proceed without a credential instead of asking the user to log in
    pub auth_optional: bool,
    /// Issuers whose tokens the tool accepts; empty accepts any
    #[serde(deserialize_with = "deserialize_list")]
    pub issuers: Vec<String>,
    /// Remote tool endpoint
    pub url: Option<String>,
    /// Human-readable description
    pub description: String,
}

impl ToolConfig {
    /// Audiences to resolve a credential for: `auth_audiences`, else `auth_providers`.
    #[must_use]
    pub fn audiences(&self) -> &[String] {
        if self.auth_audiences.is_empty() {
            &self.auth_providers
        } else {
            &self.auth_audiences
        }
    }
}

/// Humantime serde support
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}s", duration.as_secs()))
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;

        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(serde::de::Error::custom)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(serde::de::Error::custom)
        } else if let Some(hours) = s.strip_suffix('h') {
            hours
                .parse::<u64>()
                .map(|h| Duration::from_secs(h * 3600))
                .map_err(serde::de::Error::custom)
        } else {
            // Assume seconds
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        }
    }
}
