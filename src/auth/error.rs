//! Authorization failures.
//!
//! Every path that ends in "the user has to (re-)authenticate" produces an
//! [`AuthorizationNeeded`]. Callers match on [`AuthFailure`] instead of
//! catching distinct error types, and the top of the request stack renders the
//! failure as an in-band chat message carrying a login link.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use chrono_tz::US::Eastern;

use super::token::TokenCacheItem;

/// Why a credential could not be produced.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthFailure {
    /// The bearer token verified but its `exp` has passed.
    TokenExpired {
        /// Expiry of the rejected token, when known
        expired_at: Option<DateTime<Utc>>,
    },
    /// Header missing or malformed, or signature/claims verification failed.
    BearerInvalid,
    /// A cache entry exists but is stale; a refresh may still recover it.
    CacheExpired(Box<TokenCacheItem>),
    /// No cache entry for the required audiences.
    CacheMissing,
    /// A remote tool endpoint rejected the credential it was given.
    McpUnauthorized {
        /// Tool endpoint that answered 401
        url: String,
        /// Selected response headers (`WWW-Authenticate`)
        headers: BTreeMap<String, String>,
    },
}

impl AuthFailure {
    /// Short stable label for logs and metrics fields.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::TokenExpired { .. } => "token_expired",
            Self::BearerInvalid => "bearer_invalid",
            Self::CacheExpired(_) => "cache_expired",
            Self::CacheMissing => "cache_missing",
            Self::McpUnauthorized { .. } => "mcp_unauthorized",
        }
    }
}

/// The user has to (re-)authenticate before the request can proceed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct AuthorizationNeeded {
    /// Human-actionable message
    pub message: String,
    /// Audiences the user must log in to
    pub audiences: Vec<String>,
    /// Login URL, filled in by whoever knows the redirect URI
    pub login_url: Option<String>,
    /// Failure classification
    pub kind: AuthFailure,
}

impl AuthorizationNeeded {
    fn new(kind: AuthFailure, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            audiences: Vec::new(),
            login_url: None,
            kind,
        }
    }

    /// Header missing, malformed, or failed verification.
    pub fn bearer_invalid(message: impl Into<String>) -> Self {
        Self::new(AuthFailure::BearerInvalid, message)
    }

    /// Bearer token past its `exp`. Times are rendered in US Eastern.
    #[must_use]
    pub fn token_expired(expired_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Self {
        let message = match expired_at {
            Some(exp) => format!(
                "Your token expired at {}. The current time is {}. Please log in again to continue.",
                format_eastern(exp),
                format_eastern(now)
            ),
            None => format!(
                "Your token has expired. The current time is {}. Please log in again to continue.",
                format_eastern(now)
            ),
        };
        Self::new(AuthFailure::TokenExpired { expired_at }, message)
    }

    /// No cached credential for `audiences`.
    pub fn cache_missing(message: impl Into<String>, audiences: Vec<String>) -> Self {
        Self::new(AuthFailure::CacheMissing, message).with_audiences(audiences)
    }

    /// The cached credential for `item.audience` is stale.
    #[must_use]
    pub fn cache_expired(item: TokenCacheItem) -> Self {
        let message = format!(
            "Your login for {} has expired. Please log in again to continue.",
            item.audience
        );
        let audiences = vec![item.audience.clone()];
        Self::new(AuthFailure::CacheExpired(Box::new(item)), message).with_audiences(audiences)
    }

    /// A remote tool at `url` answered 401.
    #[must_use]
    pub fn mcp_unauthorized(url: impl Into<String>, headers: BTreeMap<String, String>) -> Self {
        let url = url.into();
        let message = format!("The tool at {url} rejected your credentials. Please log in again.");
        Self::new(AuthFailure::McpUnauthorized { url, headers }, message)
    }

    /// Attach the audiences the user has to log in to.
    #[must_use]
    pub fn with_audiences(mut self, audiences: Vec<String>) -> Self {
        self.audiences = audiences;
        self
    }

    /// Attach a login URL.
    #[must_use]
    pub fn with_login_url(mut self, url: impl Into<String>) -> Self {
        self.login_url = Some(url.into());
        self
    }

    /// Message rendered as assistant content: the failure text followed by a
    /// markdown login link when one is known.
    #[must_use]
    pub fn user_message(&self) -> String {
        let target = match &self.kind {
            AuthFailure::McpUnauthorized { url, .. } => Some(url.as_str()),
            _ => None,
        };
        match (&self.login_url, target) {
            (Some(login), _) => {
                let label = if self.audiences.is_empty() {
                    "Log in".to_string()
                } else {
                    format!("Log in to {}", self.audiences.join(", "))
                };
                format!("{}\n\n[{label}]({login})", self.message)
            }
            (None, Some(url)) => format!("{}\n\n[Open tool]({url})", self.message),
            (None, None) => self.message.clone(),
        }
    }
}

/// Render an instant in US Eastern time, e.g. `2025-01-07 09:30:00 EST`.
#[must_use]
pub fn format_eastern(instant: DateTime<Utc>) -> String {
    instant
        .with_timezone(&Eastern)
        .format("%Y-%m-%d %H:%M:%S %Z")
        .to_string()
}
