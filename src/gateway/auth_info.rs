//! Per-request caller identity.
//!
//! Claims are read once per request, without signature verification, and
//! attached to the request extensions as log fields. They never pick a
//! credential or an identity: the bearer is verified again by
//! [`TokenExchangeManager`](crate::auth::TokenExchangeManager), the
//! pass-through token manager and [`AuthInformation::login_context`].

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Request, header},
    middleware::Next,
    response::Response,
};
use serde_json::Value;
use tracing::debug;

use super::router::AppState;
use crate::auth::token::{Audience, decode_claims_unverified, looks_like_jwt};
use crate::auth::{LoginContext, TokenReader};
use crate::config::AuthSettings;

/// What the inbound request says about its caller.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuthInformation {
    /// Raw `Authorization` header
    pub authorization: Option<String>,
    /// Bearer token extracted from the header
    pub token: Option<String>,
    /// `sub` claim
    pub subject: Option<String>,
    /// `email` claim
    pub email: Option<String>,
    /// `aud` claim
    pub audience: Option<Audience>,
    /// `iss` claim
    pub issuer: Option<String>,
    /// The bearer is a verification bypass marker
    pub bypass: bool,
    /// Page the request came from (`Referer`, else `Origin`)
    pub referrer: Option<String>,
}

impl AuthInformation {
    /// Whether a bearer token was presented.
    #[must_use]
    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    /// Identity used as the cache principal: email, else subject.
    #[must_use]
    pub fn principal(&self) -> Option<&str> {
        self.email.as_deref().or(self.subject.as_deref())
    }

    /// Login context for a login started by this caller.
    ///
    /// Subject and email come from the bearer only when `reader` verifies it;
    /// otherwise the login carries no identity.
    pub async fn login_context(&self, reader: &TokenReader, referrer: Option<String>) -> LoginContext {
        let claims = match self.token.as_deref() {
            Some(token) if !self.bypass => reader.verify_token(token).await.ok(),
            _ => None,
        };
        let text = |name: &str| {
            claims
                .as_ref()
                .and_then(|c| c.get(name))
                .and_then(Value::as_str)
                .map(String::from)
        };
        LoginContext {
            subject: text("sub"),
            email: text("email"),
            referrer,
        }
    }
}

/// Read the caller's identity from request headers.
#[must_use]
pub fn read_auth_information(headers: &HeaderMap, settings: &AuthSettings) -> AuthInformation {
    let header_text = |name: header::HeaderName| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(String::from)
    };

    let authorization = header_text(header::AUTHORIZATION);
    let referrer = header_text(header::REFERER).or_else(|| header_text(header::ORIGIN));
    let token = TokenReader::extract_token(authorization.as_deref()).map(String::from);

    let mut info = AuthInformation {
        authorization,
        referrer,
        ..AuthInformation::default()
    };
    let Some(token) = token else {
        return info;
    };

    info.bypass = settings.is_bypass_token(&token);
    if !info.bypass && looks_like_jwt(&token) {
        if let Ok(claims) = decode_claims_unverified(&token) {
            let text = |name: &str| claims.get(name).and_then(Value::as_str).map(String::from);
            info.subject = text("sub");
            info.email = text("email");
            info.issuer = text("iss");
            info.audience = claims
                .get("aud")
                .and_then(|v| serde_json::from_value(v.clone()).ok());
        }
    }
    info.token = Some(token);
    info
}

/// Attach [`AuthInformation`] to every request.
pub async fn auth_info_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let info = read_auth_information(request.headers(), &state.config.auth);
    debug!(
        path = %request.uri().path(),
        subject = info.subject.as_deref().unwrap_or("-"),
        bypass = info.bypass,
        "Read caller identity"
    );
    request.extensions_mut().insert(info);
    next.run(request).await
}
