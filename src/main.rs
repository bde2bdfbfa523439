//! LLM Gateway - OpenAI-compatible front end with per-tool token exchange

use std::process::ExitCode;

use chrono::Duration;
use clap::Parser;
use tracing::{error, info, warn};

use llm_gateway::{
    auth::{
        AuthConfigReader, AuthManager, LoginContext, StateSigner, Token, format_eastern,
        system_clock,
    },
    cli::{Cli, Command},
    config::Config,
    gateway::Gateway,
    setup_tracing,
    store::{InMemoryDocumentStore, TokenRepository},
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::InspectToken { ref token }) => run_inspect_token(token),
        Some(Command::Audiences) => run_audiences(&cli),
        Some(Command::LoginUrl {
            ref audience,
            ref redirect_uri,
        }) => run_login_url(&cli, audience, redirect_uri.as_deref()).await,
        Some(Command::Serve { port, ref host }) => run_server(&cli, port, host.clone()).await,
        None => run_server(&cli, None, None).await,
    }
}

fn load_config(cli: &Cli) -> Option<Config> {
    match Config::load(cli.config.as_deref()) {
        Ok(config) => Some(config),
        Err(e) => {
            error!("Failed to load configuration: {e}");
            None
        }
    }
}

/// Print unverified claims, classification and expiry
fn run_inspect_token(raw: &str) -> ExitCode {
    let token = match Token::parse(raw.trim()) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("❌ Not a token: {e}");
            return ExitCode::FAILURE;
        }
    };

    let Some(claims) = token.claims() else {
        println!("Opaque token (no claims)");
        return ExitCode::SUCCESS;
    };
    println!(
        "{}",
        serde_json::to_string_pretty(claims).unwrap_or_default()
    );
    println!();
    match token.kind() {
        Some(kind) => println!("Kind:     {kind}"),
        None => println!("Kind:     unrecognized typ {:?}", token.token_type()),
    }
    if let Some(aud) = token.audience() {
        println!("Audience: {aud}");
    }
    match token.expires() {
        Some(exp) => {
            println!("Expires:  {} ({})", exp.to_rfc3339(), format_eastern(exp));
            println!("Valid:    {}", token.is_valid());
        }
        None => println!("Expires:  never stated (treated as expired)"),
    }
    ExitCode::SUCCESS
}

/// List audiences and their client configuration status
fn run_audiences(cli: &Cli) -> ExitCode {
    let Some(config) = load_config(cli) else {
        return ExitCode::FAILURE;
    };
    let reader = AuthConfigReader::from_env(&config.auth);

    if reader.audiences().is_empty() {
        println!("No audiences configured (set AUTH_PROVIDER_NAME / AUTH_AUDIENCES).");
        return ExitCode::SUCCESS;
    }

    let mut failed = false;
    for audience in reader.audiences() {
        match reader.get_config_for_audience(audience) {
            Ok(Some(c)) => println!(
                "✅ {audience}  client_id={}  issuer={}",
                c.client_id.as_deref().unwrap_or("-"),
                c.issuer
            ),
            Ok(None) => println!("⚪ {audience}  not configured"),
            Err(e) => {
                failed = true;
                println!("❌ {audience}  {e}");
            }
        }
    }
    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

/// Print the provider authorization URL for an audience
async fn run_login_url(cli: &Cli, audience: &str, redirect_uri: Option<&str>) -> ExitCode {
    let Some(config) = load_config(cli) else {
        return ExitCode::FAILURE;
    };
    let http = match config.http.client() {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to create HTTP client: {e}");
            return ExitCode::FAILURE;
        }
    };
    let ttl = Duration::from_std(config.auth.state_ttl).unwrap_or_else(|_| Duration::minutes(15));
    let signer = match &config.auth.state_secret {
        Some(secret) => StateSigner::new(secret, ttl),
        None => {
            warn!("No auth.state_secret configured; a running gateway will reject this login's state");
            StateSigner::ephemeral(ttl)
        }
    };
    let signer = match signer {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to create state signer: {e}");
            return ExitCode::FAILURE;
        }
    };

    let tokens = TokenRepository::new(
        std::sync::Arc::new(InMemoryDocumentStore::new()),
        config.token_cache.collection.clone(),
    );
    let manager = AuthManager::new(
        http,
        system_clock(),
        AuthConfigReader::from_env(&config.auth),
        signer,
        tokens,
        config.server.base_url(),
    );
    let redirect_uri = redirect_uri.map_or_else(|| manager.default_redirect_uri(), String::from);

    match manager
        .create_authorization_url(&redirect_uri, audience, LoginContext::default())
        .await
    {
        Ok(url) => {
            println!("{url}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ {e}");
            ExitCode::FAILURE
        }
    }
}

/// Run the gateway server
async fn run_server(cli: &Cli, port: Option<u16>, host: Option<String>) -> ExitCode {
    let Some(mut config) = load_config(cli) else {
        return ExitCode::FAILURE;
    };
    // Apply CLI overrides
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(host) = host {
        config.server.host = host;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        models = config.models.len(),
        tools = config.tools.len(),
        cache = ?config.token_cache.backend,
        "Starting LLM Gateway"
    );

    // Create and run gateway
    let gateway = match Gateway::new(config).await {
        Ok(g) => g,
        Err(e) => {
            error!("Failed to create gateway: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Run with graceful shutdown
    if let Err(e) = gateway.run().await {
        error!("Gateway error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Gateway shutdown complete");
    ExitCode::SUCCESS
}
