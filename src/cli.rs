//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// OAuth2 / OIDC token issuance service
#[derive(Parser, Debug)]
#[command(name = "tokenforge")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "TOKENFORGE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "TOKENFORGE_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "TOKENFORGE_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "TOKENFORGE_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "TOKENFORGE_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the token server (default)
    Serve,

    /// Load and validate the configuration, then print it
    CheckConfig,

    /// Print the public keys of a tenant, generating one if none exists
    Jwks {
        /// Tenant id (defaults to `oidc.default_tenant`)
        #[arg(short, long)]
        tenant: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn serve_is_the_default() {
        let cli = Cli::try_parse_from(["tokenforge", "--port", "9000"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.port, Some(9000));
    }

    #[test]
    fn jwks_takes_a_tenant() {
        let cli = Cli::try_parse_from(["tokenforge", "jwks", "--tenant", "acme"]).unwrap();
        match cli.command {
            Some(Command::Jwks { tenant }) => assert_eq!(tenant.as_deref(), Some("acme")),
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
