//! CRM MCP Gateway - MCP over a CRM's OData API with per-user OAuth

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use crm_mcp_gateway::{
    cli::{Cli, Command},
    config::Config,
    gateway::Gateway,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Some(Command::Check) => run_check(&config),
        Some(Command::Serve) | None => run_server(config).await,
    }
}

/// File and environment, then CLI overrides, then validation
fn load_config(cli: &Cli) -> crm_mcp_gateway::Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;
    cli.apply(&mut config);
    config.validate()?;
    Ok(config)
}

fn run_check(config: &Config) -> ExitCode {
    match config.auth_config() {
        Ok(auth) => {
            println!("Configuration OK");
            println!("  upstream:   {}", config.upstream.base_url);
            println!("  auth:       {}", auth.kind());
            println!("  public url: {}", config.public_url());
            println!("  readonly:   {}", config.upstream.readonly);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Invalid configuration: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_server(config: Config) -> ExitCode {
    let gateway = match Gateway::new(config) {
        Ok(g) => g,
        Err(e) => {
            error!("Failed to create gateway: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = gateway.run().await {
        error!("Gateway error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Gateway stopped");
    ExitCode::SUCCESS
}
