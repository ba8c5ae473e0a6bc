//! tokenforge - OAuth2 / OIDC token issuance service

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use tokenforge::{
    cli::{Cli, Command},
    config::Config,
    provider::{Collaborators, Provider, handler},
    setup_tracing,
    storage::{InMemoryLock, InMemoryStore},
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            if let Some(ref host) = cli.host {
                config.server.host = host.clone();
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Some(Command::CheckConfig) => check_config(&config),
        Some(Command::Jwks { tenant }) => print_jwks(config, tenant).await,
        Some(Command::Serve) | None => run_server(config).await,
    }
}

/// Seeded in-memory collaborators.
fn collaborators(config: &Config) -> tokenforge::Result<Collaborators> {
    let store = Arc::new(InMemoryStore::new(config.keys.key_lifetime));
    config.apply_seed(&store)?;
    Ok(Collaborators::in_memory(store, Arc::new(InMemoryLock::new())))
}

fn check_config(config: &Config) -> ExitCode {
    match serde_yaml::to_string(config) {
        Ok(yaml) => {
            println!("{yaml}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Failed to render configuration: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn print_jwks(config: Config, tenant: Option<String>) -> ExitCode {
    let tenant = tenant.unwrap_or_else(|| config.oidc.default_tenant.clone());
    let provider = match collaborators(&config).and_then(|c| Provider::new(config, c)) {
        Ok(p) => p,
        Err(e) => {
            error!("Failed to create provider: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = provider.signers().signer(&tenant).await {
        error!(tenant = %tenant, "Failed to obtain a signing key: {e}");
        return ExitCode::FAILURE;
    }
    let set = match provider.jwks(&tenant).await {
        Ok(set) => set,
        Err(e) => {
            error!(tenant = %tenant, "Failed to read public keys: {e}");
            return ExitCode::FAILURE;
        }
    };
    match serde_json::to_string_pretty(&set) {
        Ok(json) => {
            println!("{json}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Failed to serialize JWKS: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Run the token server until ctrl-c.
async fn run_server(config: Config) -> ExitCode {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        default_tenant = %config.oidc.default_tenant,
        tenants = config.seed.len(),
        "Starting tokenforge"
    );

    let (shutdown_tx, _) = broadcast::channel(1);
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let shutdown_timeout = config.server.shutdown_timeout;

    let provider = match collaborators(&config)
        .and_then(|c| Provider::with_background(config, c, &shutdown_tx))
    {
        Ok(p) => Arc::new(p),
        Err(e) => {
            error!("Failed to create provider: {e}");
            return ExitCode::FAILURE;
        }
    };

    let listener = match TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(addr = %addr, "Failed to bind: {e}");
            return ExitCode::FAILURE;
        }
    };
    info!(addr = %addr, "Listening");

    let app = handler::routes(provider);
    let mut shutdown_rx = shutdown_tx.subscribe();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = shutdown_rx.recv().await;
    });
    let mut server = tokio::spawn(async move { server.await });

    tokio::select! {
        result = &mut server => {
            return finish(result);
        }
        _ = signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(shutdown_timeout, &mut server).await {
        Ok(result) => finish(result),
        Err(_) => {
            warn!(timeout = ?shutdown_timeout, "Graceful shutdown timed out");
            ExitCode::FAILURE
        }
    }
}

fn finish(result: Result<std::io::Result<()>, tokio::task::JoinError>) -> ExitCode {
    match result {
        Ok(Ok(())) => {
            info!("tokenforge shutdown complete");
            ExitCode::SUCCESS
        }
        Ok(Err(e)) => {
            error!("Server error: {e}");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("Server task failed: {e}");
            ExitCode::FAILURE
        }
    }
}
