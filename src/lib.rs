//! LLM Gateway Library
//!
//! OpenAI-compatible gateway that authorizes every tool a model may call.
//!
//! # Features
//!
//! - **Token exchange**: one user bearer token unlocks tools with different
//!   audiences once each has been authorized, via a persistent token cache
//! - **Refresh on expiry**: cached credentials are refreshed through the
//!   provider's token endpoint, serialized per user and audience
//! - **In-band login**: missing or expired credentials are answered with a
//!   chat message carrying a login link, never with a 401
//! - **OIDC login**: authorization code + PKCE with a signed `state`
//! - **Pass-through models**: forwards to OpenAI-compatible upstreams

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod store;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string())),
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string())),
    }
}
