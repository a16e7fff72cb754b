use clap::{Args, Subcommand};

use super::CliContext;

#[derive(Args, Debug)]
pub struct SecretArgs {
    #[command(subcommand)]
    pub command: SecretCommands,
}

/// Signing keys and OAuth client credentials, referenced by name from configs.
#[derive(Subcommand, Debug)]
pub enum SecretCommands {
    Add { key: String, secret: String },
    Update { key: String, secret: String },
    Delete { key: String },
    /// Names only
    List,
}

pub async fn execute(args: SecretArgs, context: &CliContext) -> anyhow::Result<()> {
    let secrets = &context.secrets_manager;
    let (result, done) = match args.command {
        SecretCommands::Add { key, secret } => (secrets.add_secret(&key, &secret).await, "added"),
        SecretCommands::Update { key, secret } => (secrets.update_secret(&key, &secret).await, "updated"),
        SecretCommands::Delete { key } => (secrets.delete_secret(&key).await, "deleted"),
        SecretCommands::List => {
            let mut keys = secrets.0.keys();
            keys.sort();
            keys.iter().for_each(|k| println!("{k}"));
            return Ok(());
        }
    };
    match result {
        Ok(()) => println!("✅ Secret {done}."),
        Err(e) => eprintln!("❌ Secret could not be {done}: {e}"),
    }
    Ok(())
}
