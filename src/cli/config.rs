use clap::{Args, Subcommand};

use super::CliContext;
use changefeed::config::EngineConfig;

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    Set { key: String, value: String },
    Delete { key: String },
    /// Print the effective engine settings
    Show,
}

pub async fn execute(args: ConfigArgs, context: &CliContext) -> anyhow::Result<()> {
    match args.command {
        ConfigCommands::Set { key, value } => {
            if !key.starts_with("CHANGEFEED_") {
                eprintln!("❌ Engine settings are named CHANGEFEED_*.");
                return Ok(());
            }
            match context.config_manager.0.set(&key, &value).await {
                Ok(_) => println!("✅ Config set."),
                Err(e) => eprintln!("❌ Config could not be set: {e}"),
            }
        }
        ConfigCommands::Delete { key } => {
            context.config_manager.0.del(&key).await;
            println!("✅ Config deleted.");
        }
        ConfigCommands::Show => {
            let engine = EngineConfig::load(&context.config_manager).await?;
            println!("{engine:#?}");
        }
    }
    Ok(())
}
