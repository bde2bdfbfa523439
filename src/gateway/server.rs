//! Gateway server

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use reqwest::Client;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use super::chat::ChatCompletionManager;
use super::mcp::RemoteToolClient;
use super::passthrough::{PassThroughBackend, PassThroughTokenManager, UpstreamAuth};
use super::router::{AppState, create_router};
use crate::auth::reader::DEFAULT_LEEWAY_SECS;
use crate::auth::{
    AuthConfigReader, AuthManager, SharedClock, StateSigner, TokenExchangeManager, TokenReader,
    ToolAuthManager, system_clock,
};
use crate::config::{Config, ModelProvider};
use crate::store::{self, DocumentStore, TokenRepository};
use crate::{Error, Result};

fn chrono_duration(d: std::time::Duration, what: &str) -> Result<chrono::Duration> {
    chrono::Duration::from_std(d).map_err(|e| Error::Config(format!("Invalid {what}: {e}")))
}

impl AppState {
    /// Wire the token core and the model backends.
    ///
    /// Clock, store and the per-audience client environment are injected so
    /// tests can control expiry and inspect the cache.
    ///
    /// # Errors
    ///
    /// Configuration errors (durations, models without an upstream, signer setup).
    pub fn build(
        config: Config,
        http: Client,
        clock: SharedClock,
        store: Arc<dyn DocumentStore>,
        configs: AuthConfigReader,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let settings = &config.auth;
        let tokens = TokenRepository::new(store, config.token_cache.collection.clone())
            .with_clock(clock.clone());

        let leeway = i64::try_from(settings.leeway.as_secs()).unwrap_or(DEFAULT_LEEWAY_SECS);
        let reader = TokenReader::new(http.clone(), clock.clone(), settings.well_known_uri.clone())
            .with_jwks_ttl(chrono_duration(settings.jwks_ttl, "auth.jwks_ttl")?)
            .with_leeway(leeway);

        let state_ttl = chrono_duration(settings.state_ttl, "auth.state_ttl")?;
        let signer = match &settings.state_secret {
            Some(secret) => StateSigner::new(secret, state_ttl)?,
            None => {
                warn!("No auth.state_secret configured; pending logins do not survive a restart");
                StateSigner::ephemeral(state_ttl)?
            }
        };

        let auth = Arc::new(AuthManager::new(
            http.clone(),
            clock.clone(),
            configs,
            signer,
            tokens.clone(),
            config.server.base_url(),
        ));
        let exchange = Arc::new(TokenExchangeManager::new(
            Arc::new(reader),
            tokens,
            clock,
            settings.bypass_tokens.clone(),
        ));
        let tools = Arc::new(ToolAuthManager::new(Arc::clone(&exchange), auth));

        let mut chat = ChatCompletionManager::new(
            Arc::clone(&config),
            Arc::clone(&tools),
            RemoteToolClient::new(http.clone()),
        );
        for (id, model) in &config.models {
            let upstream = model
                .upstream_url
                .as_deref()
                .ok_or_else(|| Error::Config(format!("Model '{id}' has no upstream_url")))?;
            let upstream_auth = match model.provider {
                ModelProvider::PassThrough => UpstreamAuth::PassThrough(PassThroughTokenManager::new(
                    Arc::clone(&exchange),
                    model.audiences.clone(),
                )),
                ModelProvider::OpenAi => model
                    .api_key
                    .clone()
                    .map_or(UpstreamAuth::None, UpstreamAuth::ApiKey),
            };
            let backend = PassThroughBackend::new(http.clone(), upstream, model.upstream_model.clone(), upstream_auth);
            chat = chat.with_backend(id.clone(), Arc::new(backend));
            info!(model = %id, provider = ?model.provider, tools = model.tools.len(), "Registered model");
        }

        Ok(Self { config, chat, tools })
    }
}

/// LLM gateway server
pub struct Gateway {
    state: Arc<AppState>,
}

impl Gateway {
    /// Create a gateway from configuration, opening the token store.
    pub async fn new(config: Config) -> Result<Self> {
        let http = config.http.client()?;
        let store = store::open(&config.token_cache).await?;
        let configs = AuthConfigReader::from_env(&config.auth);
        let state = AppState::build(config, http, system_clock(), store, configs)?;
        Ok(Self {
            state: Arc::new(state),
        })
    }

    /// Gateway over prepared state.
    #[must_use]
    pub fn from_state(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// The HTTP application.
    #[must_use]
    pub fn router(&self) -> Router {
        create_router(Arc::clone(&self.state))
    }

    /// Run the gateway until Ctrl+C / SIGTERM.
    pub async fn run(self) -> Result<()> {
        let server = &self.state.config.server;
        let addr = SocketAddr::new(
            server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            server.port,
        );
        let shutdown_timeout = server.shutdown_timeout;

        let listener = TcpListener::bind(addr).await?;

        info!("============================================================");
        info!("LLM GATEWAY v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %server.host, port = %server.port, "Listening");
        info!(public_url = %server.base_url(), "Login links point at");
        info!(models = ?self.state.chat.model_ids(), "Models");
        let audiences = self.state.tools.auth().configs().audiences();
        if audiences.is_empty() {
            warn!("No auth audiences configured; tools requiring auth will always ask for a login");
        } else {
            info!(audiences = ?audiences, "Auth audiences");
        }
        info!("============================================================");

        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
        let mut shutdown_rx = shutdown_tx.subscribe();
        let drain_deadline = async move {
            let _ = shutdown_rx.recv().await;
            tokio::time::sleep(shutdown_timeout).await;
        };

        let serve = axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown_signal(shutdown_tx))
            .into_future();
        tokio::select! {
            result = serve => result.map_err(|e| Error::Internal(e.to_string()))?,
            () = drain_deadline => warn!(timeout = ?shutdown_timeout, "Graceful shutdown timed out, dropping open connections"),
        }

        Ok(())
    }
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown_tx: tokio::sync::broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
