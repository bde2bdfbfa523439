//! Token authorization and exchange.
//!
//! Leaf-first:
//!
//! - [`TokenReader`] verifies bearer JWTs against the issuer's JWKS.
//! - [`TokenCacheItem`] is the persisted access/ID/refresh aggregate.
//! - [`AuthConfigReader`] resolves per-audience OIDC client settings.
//! - [`AuthManager`] drives the authorization-code + PKCE login and refresh grants.
//! - [`TokenExchangeManager`] is the cache boundary: it yields a usable
//!   credential or an [`AuthorizationNeeded`].
//! - [`ToolAuthManager`] adds refresh-on-expiry per tool.

pub mod clock;
pub mod config_reader;
pub mod error;
pub mod exchange;
pub mod manager;
pub mod metadata;
pub mod reader;
pub mod state;
pub mod token;
pub mod tool;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock, system_clock};
pub use config_reader::{AuthConfig, AuthConfigReader};
pub use error::{AuthFailure, AuthorizationNeeded, format_eastern};
pub use exchange::{Credential, TokenExchangeManager};
pub use manager::{AuthManager, CallbackOutcome, LoginContext};
pub use metadata::{FetchError, MetadataCache, ProviderMetadata};
pub use reader::{JwksCache, JwksError, TokenReader};
pub use state::{LoginState, StateError, StateSigner};
pub use token::{Audience, Token, TokenCacheItem, TokenError, TokenKind};
pub use tool::{ToolAuthManager, ToolTokenState};
