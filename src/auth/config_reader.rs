//! Per-audience OIDC client configuration.
//!
//! Client credentials live in the environment, suffixed by audience:
//! `AUTH_CLIENT_ID-{audience}`, `AUTH_CLIENT_SECRET-{audience}` and
//! `AUTH_WELL_KNOWN_URI-{audience}`. The gateway's own login
//! (`auth.provider_name`) may instead use the unsuffixed keys.

use std::collections::HashMap;

use serde::Serialize;

use crate::config::AuthSettings;
use crate::{Error, Result};

const WELL_KNOWN_SUFFIX: &str = "/.well-known/openid-configuration";

/// Static client configuration for one audience.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthConfig {
    /// Audience (auth provider name)
    pub audience: String,
    /// Issuer, derived from the well-known URI unless set explicitly
    pub issuer: String,
    /// OAuth client id
    pub client_id: Option<String>,
    /// OAuth client secret
    #[serde(skip_serializing)]
    pub client_secret: Option<String>,
    /// OIDC discovery document
    pub well_known_uri: Option<String>,
}

/// Derive an issuer from a discovery URI by stripping the well-known suffix.
fn issuer_from_well_known(uri: &str) -> String {
    uri.strip_suffix(WELL_KNOWN_SUFFIX)
        .unwrap_or(uri)
        .trim_end_matches('/')
        .to_string()
}

/// Resolves [`AuthConfig`] per audience from an environment snapshot.
#[derive(Debug, Clone)]
pub struct AuthConfigReader {
    env: HashMap<String, String>,
    audiences: Vec<String>,
    settings: AuthSettings,
}

impl AuthConfigReader {
    /// Reader over the current process environment.
    #[must_use]
    pub fn from_env(settings: &AuthSettings) -> Self {
        Self::new(settings, std::env::vars().collect())
    }

    /// Reader over an explicit environment map.
    #[must_use]
    pub fn new(settings: &AuthSettings, env: HashMap<String, String>) -> Self {
        let mut audiences = settings.audiences.clone();
        if let Some(provider) = &settings.provider_name {
            if !audiences.contains(provider) {
                audiences.insert(0, provider.clone());
            }
        }
        Self {
            env,
            audiences,
            settings: settings.clone(),
        }
    }

    /// Statically configured audiences, gateway login first.
    #[must_use]
    pub fn audiences(&self) -> &[String] {
        &self.audiences
    }

    /// Gateway login settings.
    #[must_use]
    pub fn settings(&self) -> &AuthSettings {
        &self.settings
    }

    fn suffixed(&self, key: &str, audience: &str) -> Option<String> {
        self.env
            .get(&format!("{key}-{audience}"))
            .filter(|v| !v.is_empty())
            .cloned()
    }

    /// Client configuration for `audience`.
    ///
    /// `Ok(None)` when nothing is configured for the audience. Once any of
    /// the three keys is present, a missing one is a configuration error.
    pub fn get_config_for_audience(&self, audience: &str) -> Result<Option<AuthConfig>> {
        let client_id = self.suffixed("AUTH_CLIENT_ID", audience);
        let client_secret = self.suffixed("AUTH_CLIENT_SECRET", audience);
        let well_known_uri = self.suffixed("AUTH_WELL_KNOWN_URI", audience);

        let (client_id, client_secret, well_known_uri) =
            match (client_id, client_secret, well_known_uri) {
                (None, None, None) => return Ok(self.default_config(audience)),
                (Some(id), Some(secret), Some(uri)) => (id, secret, uri),
                (id, secret, uri) => {
                    let missing: Vec<String> = [
                        ("AUTH_CLIENT_ID", id.is_none()),
                        ("AUTH_CLIENT_SECRET", secret.is_none()),
                        ("AUTH_WELL_KNOWN_URI", uri.is_none()),
                    ]
                    .into_iter()
                    .filter(|(_, missing)| *missing)
                    .map(|(key, _)| format!("{key}-{audience}"))
                    .collect();
                    return Err(Error::Config(format!(
                        "Incomplete auth configuration for audience '{audience}': missing {}",
                        missing.join(", ")
                    )));
                }
            };

        let issuer = self
            .suffixed("AUTH_ISSUER", audience)
            .unwrap_or_else(|| issuer_from_well_known(&well_known_uri));

        Ok(Some(AuthConfig {
            audience: audience.to_string(),
            issuer,
            client_id: Some(client_id),
            client_secret: Some(client_secret),
            well_known_uri: Some(well_known_uri),
        }))
    }

    /// The gateway's own login, from the unsuffixed keys.
    fn default_config(&self, audience: &str) -> Option<AuthConfig> {
        if self.settings.provider_name.as_deref() != Some(audience) {
            return None;
        }
        let well_known_uri = self.settings.well_known_uri.clone()?;
        Some(AuthConfig {
            audience: audience.to_string(),
            issuer: issuer_from_well_known(&well_known_uri),
            client_id: self.settings.client_id.clone(),
            client_secret: self.settings.client_secret.clone(),
            well_known_uri: Some(well_known_uri),
        })
    }

    /// Configuration for every configured audience, skipping unconfigured ones.
    pub fn get_auth_configs_for_all_audiences(&self) -> Result<Vec<AuthConfig>> {
        let mut configs = Vec::with_capacity(self.audiences.len());
        for audience in &self.audiences {
            if let Some(config) = self.get_config_for_audience(audience)? {
                configs.push(config);
            }
        }
        Ok(configs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    fn settings() -> AuthSettings {
        AuthSettings {
            provider_name: Some("gateway".to_string()),
            well_known_uri: Some(
                "https://login.example.com/realms/main/.well-known/openid-configuration".to_string(),
            ),
            client_id: Some("gateway-client".to_string()),
            audiences: vec!["tools".to_string(), "search".to_string()],
            ..AuthSettings::default()
        }
    }

    #[test]
    fn reads_suffixed_keys() {
        let reader = AuthConfigReader::new(
            &settings(),
            env(&[
                ("AUTH_CLIENT_ID-tools", "tools-client"),
                ("AUTH_CLIENT_SECRET-tools", "s3cret"),
                ("AUTH_WELL_KNOWN_URI-tools", "https://login.example.com/realms/tools/.well-known/openid-configuration"),
            ]),
        );

        let config = reader.get_config_for_audience("tools").unwrap().unwrap();

        assert_eq!(config.issuer, "https://login.example.com/realms/tools");
        assert_eq!(config.client_id.as_deref(), Some("tools-client"));
        assert_eq!(config.client_secret.as_deref(), Some("s3cret"));
    }

    #[test]
    fn unconfigured_audience_is_none() {
        let reader = AuthConfigReader::new(&settings(), HashMap::new());
        assert_eq!(reader.get_config_for_audience("search").unwrap(), None);
    }

    #[test]
    fn partial_configuration_is_an_error() {
        // GIVEN: a client id without secret or discovery URI
        let reader = AuthConfigReader::new(&settings(), env(&[("AUTH_CLIENT_ID-tools", "tools-client")]));

        // WHEN: read
        let err = reader.get_config_for_audience("tools").unwrap_err();

        // THEN: the error is fatal and names both missing keys
        assert!(err.is_fatal());
        let message = err.to_string();
        assert!(message.contains("AUTH_CLIENT_SECRET-tools"));
        assert!(message.contains("AUTH_WELL_KNOWN_URI-tools"));
    }

    #[test]
    fn gateway_login_uses_unsuffixed_keys() {
        let reader = AuthConfigReader::new(&settings(), HashMap::new());

        let config = reader.get_config_for_audience("gateway").unwrap().unwrap();

        assert_eq!(config.issuer, "https://login.example.com/realms/main");
        assert_eq!(config.client_id.as_deref(), Some("gateway-client"));
        assert_eq!(reader.audiences(), ["gateway", "tools", "search"]);
    }

    #[test]
    fn all_audiences_skips_unconfigured() {
        let reader = AuthConfigReader::new(
            &settings(),
            env(&[
                ("AUTH_CLIENT_ID-search", "search-client"),
                ("AUTH_CLIENT_SECRET-search", "s3cret"),
                ("AUTH_WELL_KNOWN_URI-search", "https://search-login.example.com/.well-known/openid-configuration"),
            ]),
        );

        let configs = reader.get_auth_configs_for_all_audiences().unwrap();
        let audiences: Vec<_> = configs.iter().map(|c| c.audience.as_str()).collect();

        assert_eq!(audiences, vec!["gateway", "search"]);
    }
}
