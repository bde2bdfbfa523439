//! Error types for the LLM gateway

use std::io;

use thiserror::Error;

use crate::auth::AuthorizationNeeded;

/// Result type alias for the gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (deployment bug, never answered in-band)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A credential is missing, invalid or expired; the user has to (re-)authenticate
    #[error(transparent)]
    Authorization(#[from] AuthorizationNeeded),

    /// Token cache persistence error
    #[error("Token store error: {0}")]
    Store(String),

    /// Upstream model provider returned an error
    #[error("Upstream error: HTTP {status}: {message}")]
    Upstream {
        /// HTTP status returned by the upstream
        status: u16,
        /// Response body or reason
        message: String,
    },

    /// Unknown model requested
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error indicates a deployment bug rather than a request-level condition.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// The authorization failure carried by this error, if any.
    #[must_use]
    pub fn as_authorization(&self) -> Option<&AuthorizationNeeded> {
        match self {
            Self::Authorization(needed) => Some(needed),
            _ => None,
        }
    }

    /// HTTP status code used when the error is not answered in-band.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::ModelNotFound(_) => 404,
            Self::Json(_) => 400,
            Self::Upstream { status, .. } if *status >= 400 => *status,
            Self::Authorization(_) => 401,
            Self::Http(_) | Self::Upstream { .. } => 502,
            _ => 500,
        }
    }

    /// OpenAI-style error `type` string.
    #[must_use]
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::ModelNotFound(_) | Self::Json(_) => "invalid_request_error",
            Self::Authorization(_) => "authentication_error",
            Self::Upstream { .. } | Self::Http(_) => "upstream_error",
            _ => "server_error",
        }
    }
}
