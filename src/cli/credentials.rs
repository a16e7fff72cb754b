use chrono::{Duration, Utc};
use clap::{Args, Subcommand};
use serde_json::json;

use super::{CliContext, print_json};
use changefeed::store::{CredentialStore, StoredCredential};

#[derive(Args, Debug)]
pub struct CredentialArgs {
    #[command(subcommand)]
    pub command: CredentialCommands,
}

#[derive(Subcommand, Debug)]
pub enum CredentialCommands {
    /// Store tokens from a fresh authorization, replacing any existing ones
    Set {
        subscription_id: String,
        #[arg(long)]
        access_token: String,
        #[arg(long)]
        refresh_token: Option<String>,
        /// Seconds until the access token expires
        #[arg(long)]
        expires_in: Option<i64>,
    },
    /// Show token metadata; token values are never printed
    Show { subscription_id: String },
    Delete { subscription_id: String },
}

pub async fn execute(args: CredentialArgs, context: &CliContext) -> anyhow::Result<()> {
    let engine = context.engine().await?;
    let store = engine.store();
    match args.command {
        CredentialCommands::Set { subscription_id, access_token, refresh_token, expires_in } => {
            engine.status(&subscription_id).await.map_err(|e| anyhow::anyhow!(e.user_message()))?;
            let stored = store
                .put_credential(&StoredCredential {
                    subscription_id,
                    access_token,
                    refresh_token,
                    expires_at: expires_in.map(|secs| Utc::now() + Duration::seconds(secs)),
                    version: 0,
                })
                .await?;
            println!("✅ Credential stored (version {}).", stored.version);
            Ok(())
        }
        CredentialCommands::Show { subscription_id } => match store.get_credential(&subscription_id).await? {
            Some(credential) => print_json(&json!({
                "subscription_id": credential.subscription_id,
                "has_refresh_token": credential.refresh_token.is_some(),
                "expires_at": credential.expires_at,
                "version": credential.version,
            })),
            None => {
                eprintln!("❌ No credential stored for {subscription_id}.");
                Ok(())
            }
        },
        CredentialCommands::Delete { subscription_id } => {
            store.delete_credential(&subscription_id).await?;
            println!("✅ Credential deleted.");
            Ok(())
        }
    }
}
