//! WebSocket Gateway - authenticating, rate-limited reverse proxy
//!
//! Admits clients, resolves their credentials and relays their sessions to a
//! single upstream WebSocket service.

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use ws_gateway::{
    cli::{Cli, Command},
    config::Config,
    gateway::Gateway,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Some(Command::Config) => print_config(&config),
        Some(Command::Serve) | None => run_server(config).await,
    }
}

/// Load config and apply command-line overrides.
fn load_config(cli: &Cli) -> ws_gateway::Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(host) = &cli.host {
        config.server.host.clone_from(host);
    }
    Ok(config)
}

/// Print the effective configuration
fn print_config(config: &Config) -> ExitCode {
    match serde_yaml::to_string(&config.redacted()) {
        Ok(yaml) => {
            print!("{yaml}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Failed to render configuration: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Run the gateway server
async fn run_server(config: Config) -> ExitCode {
    info!(
        upstream = %config.upstream.url,
        jwks = config.jwks.endpoint().unwrap_or("-"),
        "Starting gateway"
    );

    let gateway = match Gateway::new(config).await {
        Ok(gateway) => gateway,
        Err(e) => {
            error!("Failed to create gateway: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = gateway.run().await {
        error!("Gateway error: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
