//! Per-tool credential resolution with refresh-on-expiry.
//!
//! Each tool invocation walks a small state machine:
//!
//! ```text
//! lookup ──► Usable                       (bearer accepted, or cache hit still valid)
//!        ──► Expired ──► refresh ──► Usable
//!        │                       └─► NeedsLogin   (no/expired refresh token, grant refused)
//!        ──► NeedsLogin                   (no cache entry, invalid bearer)
//! ```
//!
//! `Usable` and `NeedsLogin` are terminal. `NeedsLogin` carries an
//! [`AuthorizationNeeded`] with a login link, which the chat layer renders
//! in-band.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::error::{AuthFailure, AuthorizationNeeded};
use super::exchange::{Credential, TokenExchangeManager};
use super::manager::AuthManager;
use super::token::TokenCacheItem;
use crate::config::ToolConfig;
use crate::{Error, Result};

/// Where a tool's credential resolution stands.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolTokenState {
    /// A credential can be attached to the outbound call
    Usable(Credential),
    /// A cached item exists but is stale; a refresh may recover it
    Expired(TokenCacheItem),
    /// The user has to log in
    NeedsLogin(AuthorizationNeeded),
}

impl ToolTokenState {
    /// Whether no further transition is possible.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Expired(_))
    }
}

/// Resolves tool credentials through [`TokenExchangeManager`], refreshing stale cache items.
pub struct ToolAuthManager {
    exchange: Arc<TokenExchangeManager>,
    auth: Arc<AuthManager>,
    refresh_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ToolAuthManager {
    /// Create a manager.
    #[must_use]
    pub fn new(exchange: Arc<TokenExchangeManager>, auth: Arc<AuthManager>) -> Self {
        Self {
            exchange,
            auth,
            refresh_locks: DashMap::new(),
        }
    }

    /// The exchange manager this wraps.
    #[must_use]
    pub fn exchange(&self) -> &TokenExchangeManager {
        &self.exchange
    }

    /// The login/refresh manager.
    #[must_use]
    pub fn auth(&self) -> &AuthManager {
        &self.auth
    }

    /// Resolve a credential for `tool_name`.
    ///
    /// # Errors
    ///
    /// `Error::Config` if the tool names no auth provider.
    /// `Error::Authorization` (with a login link) if the user has to log in.
    /// Token cache failures propagate as `Error::Store`.
    pub async fn get_token_for_tool(
        &self,
        auth_header: Option<&str>,
        error_message: &str,
        tool_name: &str,
        tool: &ToolConfig,
        referrer: Option<&str>,
    ) -> Result<Credential> {
        if tool.auth_providers.is_empty() {
            return Err(Error::Config(format!(
                "Tool '{tool_name}' requires auth but names no auth_providers"
            )));
        }

        let mut state = self.lookup(auth_header, error_message, tool_name, tool).await?;
        while !state.is_terminal() {
            state = self.advance(state).await?;
        }

        match state {
            ToolTokenState::Usable(credential) => Ok(credential),
            ToolTokenState::NeedsLogin(needed) => {
                debug!(tool = %tool_name, reason = needed.kind.label(), "Tool needs login");
                Err(self.with_login_link(needed, tool, referrer).into())
            }
            ToolTokenState::Expired(_) => Err(Error::Internal(
                "credential resolution stopped in a non-terminal state".to_string(),
            )),
        }
    }

    /// Initial state from the exchange manager's answer.
    ///
    /// # Errors
    ///
    /// Anything other than a login requirement, e.g. a token cache failure.
    pub async fn lookup(
        &self,
        auth_header: Option<&str>,
        error_message: &str,
        tool_name: &str,
        tool: &ToolConfig,
    ) -> Result<ToolTokenState> {
        let result = self
            .exchange
            .get_token_for_tool(auth_header, error_message, tool_name, tool.audiences())
            .await;
        let now = self.exchange.now();

        let state = match result {
            Ok(Credential::Cached(item)) if item.has_valid_id_token_at(now) => {
                ToolTokenState::Usable(Credential::Cached(item))
            }
            Ok(Credential::Cached(item)) if !item.audience.is_empty() && item.is_expired_at(now) => {
                ToolTokenState::Expired(item)
            }
            Ok(credential) => ToolTokenState::Usable(credential),
            Err(Error::Authorization(needed)) => match needed.kind {
                AuthFailure::CacheExpired(ref item) if item.refresh_token.is_some() => {
                    ToolTokenState::Expired((**item).clone())
                }
                _ => ToolTokenState::NeedsLogin(needed),
            },
            Err(e) => return Err(e),
        };
        Ok(self.enforce_issuers(state, tool_name, tool))
    }

    /// Turn a credential minted by an issuer outside `tool.issuers` into a
    /// login requirement. An empty list trusts every issuer.
    fn enforce_issuers(&self, state: ToolTokenState, tool_name: &str, tool: &ToolConfig) -> ToolTokenState {
        if tool.issuers.is_empty() {
            return state;
        }
        let trusted = |issuer: &str| tool.issuers.iter().any(|i| i == issuer);
        let accepted = match &state {
            ToolTokenState::NeedsLogin(_) => true,
            ToolTokenState::Usable(Credential::Bearer(token)) => {
                self.exchange.is_bypass_token(token.raw()) || token.issuer().is_some_and(trusted)
            }
            ToolTokenState::Usable(Credential::Cached(item)) | ToolTokenState::Expired(item) => {
                trusted(item.issuer.as_str())
            }
        };
        if accepted {
            return state;
        }

        debug!(tool = %tool_name, issuers = ?tool.issuers, "Credential issuer not trusted by tool");
        let audiences = tool.audiences().to_vec();
        ToolTokenState::NeedsLogin(
            AuthorizationNeeded::bearer_invalid(format!(
                "Tool '{tool_name}' does not accept credentials from this issuer. Please log in to {}.",
                audiences.join(", ")
            ))
            .with_audiences(audiences),
        )
    }

    /// One transition. Terminal states are returned unchanged.
    ///
    /// # Errors
    ///
    /// Configuration and store errors raised while refreshing.
    pub async fn advance(&self, state: ToolTokenState) -> Result<ToolTokenState> {
        let ToolTokenState::Expired(item) = state else {
            return Ok(state);
        };

        match self.refresh(&item).await? {
            Some(fresh) => Ok(ToolTokenState::Usable(Credential::Cached(fresh))),
            None => Ok(ToolTokenState::NeedsLogin(AuthorizationNeeded::cache_expired(item))),
        }
    }

    /// Refresh `item`, serialized per `(audience, principal)`.
    ///
    /// The lock entry is dropped again once no other request holds it.
    async fn refresh(&self, item: &TokenCacheItem) -> Result<Option<TokenCacheItem>> {
        let key = item.key();
        let lock = self
            .refresh_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let result = {
            let _guard = lock.lock().await;
            self.refresh_locked(item).await
        };
        drop(lock);
        self.refresh_locks.remove_if(&key, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    /// Body of [`Self::refresh`], run under the per-key lock.
    ///
    /// The cache is re-read first: a concurrent request may already have
    /// stored fresh tokens, which are then reused.
    async fn refresh_locked(&self, item: &TokenCacheItem) -> Result<Option<TokenCacheItem>> {
        let mut current = item.clone();
        if let Some(principal) = item.principal() {
            match self
                .exchange
                .get_token_for_auth_provider(&item.audience, principal)
                .await?
            {
                Some(stored) if !stored.is_expired_at(self.exchange.now()) => {
                    debug!(audience = %item.audience, "Reusing tokens refreshed concurrently");
                    return Ok(Some(stored));
                }
                Some(stored) => current = stored,
                None => {}
            }
        }

        let refreshed = self.auth.refresh_tokens_with_oidc(&current).await?;
        if refreshed.is_some() {
            info!(audience = %item.audience, "Refreshed expired tool credential");
        }
        Ok(refreshed)
    }

    fn with_login_link(
        &self,
        needed: AuthorizationNeeded,
        tool: &ToolConfig,
        referrer: Option<&str>,
    ) -> AuthorizationNeeded {
        if needed.login_url.is_some() || matches!(needed.kind, AuthFailure::McpUnauthorized { .. }) {
            return needed;
        }
        let audience = needed
            .audiences
            .first()
            .or_else(|| tool.audiences().first())
            .cloned();
        match audience {
            Some(audience) => {
                let url = self.auth.login_url(&audience, referrer);
                let audiences = if needed.audiences.is_empty() {
                    vec![audience]
                } else {
                    needed.audiences.clone()
                };
                needed.with_audiences(audiences).with_login_url(url)
            }
            None => needed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::clock::system_clock;
    use crate::auth::config_reader::AuthConfigReader;
    use crate::auth::reader::TokenReader;
    use crate::auth::state::StateSigner;
    use crate::auth::token::tests::token_with;
    use crate::config::AuthSettings;
    use crate::store::{InMemoryDocumentStore, TokenRepository};
    use chrono::Duration;
    use reqwest::Client;
    use std::collections::HashMap;

    fn manager() -> ToolAuthManager {
        let tokens = TokenRepository::new(Arc::new(InMemoryDocumentStore::new()), "tokens");
        let reader = Arc::new(TokenReader::new(Client::new(), system_clock(), None));
        let exchange = Arc::new(TokenExchangeManager::new(
            reader,
            tokens.clone(),
            system_clock(),
            vec!["bedrock".to_string()],
        ));
        let auth = Arc::new(AuthManager::new(
            Client::new(),
            system_clock(),
            AuthConfigReader::new(&AuthSettings::default(), HashMap::new()),
            StateSigner::new(b"secret", Duration::minutes(15)).unwrap(),
            tokens,
            "https://gw.example.com",
        ));
        ToolAuthManager::new(exchange, auth)
    }

    fn tool() -> ToolConfig {
        ToolConfig {
            auth: true,
            auth_providers: vec!["search".to_string()],
            ..ToolConfig::default()
        }
    }

    #[tokio::test]
    async fn tool_without_providers_is_a_config_error() {
        let tool = ToolConfig {
            auth: true,
            ..ToolConfig::default()
        };

        let err = manager()
            .get_token_for_tool(Some("Bearer bedrock"), "x", "search", &tool, None)
            .await
            .unwrap_err();

        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn missing_header_needs_login_with_link() {
        let err = manager()
            .get_token_for_tool(None, "Please log in to use search.", "search", &tool(), Some("https://chat.example.com"))
            .await
            .unwrap_err();

        let needed = err.as_authorization().unwrap();
        assert_eq!(needed.audiences, vec!["search"]);
        assert_eq!(
            needed.login_url.as_deref(),
            Some("https://gw.example.com/auth/login?audience=search&referrer=https%3A%2F%2Fchat.example.com")
        );
    }

    #[tokio::test]
    async fn bypass_bearer_is_usable() {
        let credential = manager()
            .get_token_for_tool(Some("Bearer bedrock"), "x", "search", &tool(), None)
            .await
            .unwrap();

        assert_eq!(credential.bearer(), Some("bedrock"));
    }

    #[tokio::test]
    async fn expired_without_refresh_token_needs_login() {
        // GIVEN: an expired item and no way to refresh it
        let item = TokenCacheItem::create(token_with(Some("ID"), -Duration::hours(1))).unwrap();

        // WHEN: the machine advances
        let manager = manager();
        let next = manager.advance(ToolTokenState::Expired(item)).await.unwrap();

        // THEN: the user has to log in again
        let ToolTokenState::NeedsLogin(needed) = next else {
            panic!("expected NeedsLogin, got {next:?}");
        };
        assert!(matches!(needed.kind, AuthFailure::CacheExpired(_)));
        assert_eq!(needed.audiences, vec!["tools"]);
    }

    #[tokio::test]
    async fn refresh_locks_are_released_after_use() {
        // GIVEN: expired items for two different users
        let manager = manager();
        let mut bob = TokenCacheItem::create(token_with(Some("ID"), -Duration::hours(1))).unwrap();
        bob.email = Some("bob@example.com".to_string());
        let alice = TokenCacheItem::create(token_with(Some("ID"), -Duration::hours(1))).unwrap();

        // WHEN: both are advanced, concurrently and then again
        let (a, b) = tokio::join!(
            manager.advance(ToolTokenState::Expired(alice.clone())),
            manager.advance(ToolTokenState::Expired(bob)),
        );
        a.unwrap();
        b.unwrap();
        manager.advance(ToolTokenState::Expired(alice)).await.unwrap();

        // THEN: no per-user lock outlives its refresh
        assert!(manager.refresh_locks.is_empty());
    }

    #[tokio::test]
    async fn terminal_states_do_not_advance() {
        let needed = AuthorizationNeeded::bearer_invalid("x");
        let state = ToolTokenState::NeedsLogin(needed.clone());

        assert!(state.is_terminal());
        assert_eq!(manager().advance(state).await.unwrap(), ToolTokenState::NeedsLogin(needed));
    }
}
