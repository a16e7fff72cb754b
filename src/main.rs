mod cli;

use std::{env, path::PathBuf, process};

use clap::Parser;
use cli::{Cli, CliContext, execute};
use changefeed::{
    config::{ConfigManager, EnvConfigManager},
    logger::init_tracing,
    secret::{EnvSecretsManager, SecretsManager},
};
use tracing::error;
use trigger_plugin::plugin::LogLevel;

/// Resolve the changefeed root directory from the environment or use default.
pub fn resolve_root_dir() -> PathBuf {
    match env::var("CHANGEFEED_ROOT") {
        Ok(path) => PathBuf::from(path),
        Err(_) => PathBuf::from("./changefeed"),
    }
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let root = resolve_root_dir();

    let telemetry = init_tracing(
        &root,
        "logs/changefeed.log",
        "logs/changefeed-deliveries.json",
        LogLevel::parse(&cli.log_level),
        cli.otel_endpoint.clone(),
    )?;

    let config_manager = ConfigManager(EnvConfigManager::new(root.join("config").join(".env")));
    let secrets_manager = SecretsManager(EnvSecretsManager::new(Some(root.join("secrets"))));
    let context = CliContext::new(root, config_manager, secrets_manager);

    let result = execute(&context, cli.command).await;
    if let Some(telemetry) = telemetry {
        telemetry.shutdown();
    }
    if let Err(err) = result {
        error!("{err:#}");
        eprintln!("❌ {err:#}");
        process::exit(1);
    }
    Ok(())
}
