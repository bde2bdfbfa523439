//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// OpenAI-compatible LLM gateway with per-tool OIDC token exchange
#[derive(Parser, Debug)]
#[command(name = "llm-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "LLM_GATEWAY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "LLM_GATEWAY_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "LLM_GATEWAY_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the gateway server (default)
    Serve {
        /// Port to listen on
        #[arg(short, long, env = "LLM_GATEWAY_PORT")]
        port: Option<u16>,

        /// Host to bind to
        #[arg(long, env = "LLM_GATEWAY_HOST")]
        host: Option<String>,
    },

    /// Print the provider authorization URL (PKCE) for an audience
    LoginUrl {
        /// Audience to log in to
        #[arg(short, long)]
        audience: String,

        /// Callback URL, defaults to the gateway's `/auth/callback`
        #[arg(long)]
        redirect_uri: Option<String>,
    },

    /// Print a token's claims without verifying its signature
    InspectToken {
        /// Compact JWT
        #[arg(required = true)]
        token: String,
    },

    /// List configured audiences and whether their client settings are complete
    Audiences,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_server_mode() {
        let cli = Cli::parse_from(["llm-gateway"]);

        assert!(cli.command.is_none());
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn login_url_takes_audience() {
        let cli = Cli::parse_from(["llm-gateway", "login-url", "--audience", "search"]);

        let Some(Command::LoginUrl { audience, redirect_uri }) = cli.command else {
            panic!("expected login-url");
        };
        assert_eq!(audience, "search");
        assert_eq!(redirect_uri, None);
    }

    #[test]
    fn global_config_after_subcommand() {
        let cli = Cli::parse_from(["llm-gateway", "audiences", "--config", "gateway.yaml"]);

        assert_eq!(cli.config, Some(PathBuf::from("gateway.yaml")));
    }
}
