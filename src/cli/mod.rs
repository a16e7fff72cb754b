use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

pub mod config;
pub mod credentials;
pub mod deliver;
pub mod renew;
pub mod schema;
pub mod secrets;
pub mod status;
pub mod subscribe;

use config::ConfigArgs;
use credentials::CredentialArgs;
use deliver::DeliverArgs;
use renew::RenewArgs;
use secrets::SecretArgs;
use status::StatusArgs;
use subscribe::{SubscribeArgs, UnsubscribeArgs};

use changefeed::config::{ConfigManager, EngineConfig};
use changefeed::engine::Engine;
use changefeed::registry::ProviderRegistry;
use changefeed::secret::SecretsManager;
use changefeed::store::SqliteStore;

#[derive(Parser, Debug)]
#[command(
    name = "changefeed",
    about = "Keeps provider push subscriptions alive and turns their notifications into events",
    version = "0.2.0"
)]
pub struct Cli {
    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// OpenTelemetry endpoint (e.g. http://localhost:4317)
    #[arg(long, global = true)]
    pub otel_endpoint: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Provision a subscription from a YAML config
    Subscribe(SubscribeArgs),

    /// Process one inbound delivery and print the resulting events
    Deliver(DeliverArgs),

    /// Renew one subscription, or every subscription that is due
    Renew(RenewArgs),

    /// Stop a subscription and forget its credentials
    Unsubscribe(UnsubscribeArgs),

    /// Manage per-subscription OAuth tokens
    Credentials(CredentialArgs),

    /// Show subscriptions and their checkpoints
    Status(StatusArgs),

    /// Emit JSON-Schema for configs and output records
    Schema,

    /// Handle secrets
    Secrets(SecretArgs),

    /// Handle engine configuration
    Config(ConfigArgs),
}

#[derive(Clone)]
pub struct CliContext {
    pub root: PathBuf,
    pub config_manager: ConfigManager,
    pub secrets_manager: SecretsManager,
}

impl CliContext {
    pub fn new(root: PathBuf, config_manager: ConfigManager, secrets_manager: SecretsManager) -> Self {
        Self { root, config_manager, secrets_manager }
    }

    /// An engine over the SQLite store; the database defaults to `<root>/changefeed.db`.
    pub async fn engine(&self) -> anyhow::Result<Arc<Engine>> {
        let config = EngineConfig::load(&self.config_manager).await?;
        let db_path = config.db_path.clone().unwrap_or_else(|| self.root.join("changefeed.db"));
        let store = SqliteStore::open(&db_path).with_context(|| format!("opening {}", db_path.display()))?;
        Ok(Engine::new(store, ProviderRegistry::with_defaults(), self.secrets_manager.clone(), &config)?)
    }
}

pub async fn execute(context: &CliContext, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Subscribe(args) => subscribe::execute(args, context).await,
        Commands::Deliver(args) => deliver::execute(args, context).await,
        Commands::Renew(args) => renew::execute(args, context).await,
        Commands::Unsubscribe(args) => subscribe::unsubscribe(args, context).await,
        Commands::Credentials(args) => credentials::execute(args, context).await,
        Commands::Status(args) => status::execute(args, context).await,
        Commands::Schema => schema::execute(context).await,
        Commands::Secrets(args) => secrets::execute(args, context).await,
        Commands::Config(args) => config::execute(args, context).await,
    }
}

/// Pretty JSON on stdout; the host parses it.
pub fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
