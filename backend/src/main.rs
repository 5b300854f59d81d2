//! db-keeper - Main Entry Point

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use db_keeper_backend::{
    cli::{self, Cli},
    config::Config,
    error::Result,
    providers::ProviderRegistry,
    services::{
        config_store::ConfigStore,
        encryption::{load_master_key, CredentialEncryption},
        BackupService,
    },
    telemetry,
};

#[tokio::main]
async fn main() -> ExitCode {
    // Load environment variables
    dotenvy::dotenv().ok();
    let args = Cli::parse();

    match start(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(_) => ExitCode::FAILURE,
    }
}

async fn start(args: Cli) -> Result<()> {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            cli::commands::error(&args.format, &e.to_string());
            return Err(e);
        }
    };
    let _otel_guard = telemetry::init_tracing(
        &config.log_level,
        config.otel_endpoint.as_deref(),
        &config.otel_service_name,
    )?;
    tracing::debug!(data_dir = %config.data_dir.display(), "Starting db-keeper");

    let service = match bootstrap(config).await {
        Ok(service) => service,
        Err(e) => {
            cli::commands::error(&args.format, &format!("{} ({})", e, e.code()));
            return Err(e);
        }
    };
    cli::run(args, service).await
}

async fn bootstrap(config: Config) -> Result<BackupService> {
    tokio::fs::create_dir_all(&config.data_dir).await?;
    let master_key = load_master_key(&config)?;
    let cipher = CredentialEncryption::new(&master_key)?;
    let store = ConfigStore::open(config.config_path(), config.backup_dir(), cipher).await?;
    tracing::info!(path = %store.path().display(), "Configuration loaded");
    Ok(BackupService::new(config, Arc::new(store), ProviderRegistry::default()))
}
